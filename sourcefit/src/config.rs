//! Configuration for segmentation, deblending, profile fitting and the
//! measurement queue.
//!
//! All parameters live in the flat [`Config`] struct, grouped by comment
//! banners. A YAML document can override any subset of them; missing keys
//! keep their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fit::LmConfig;
use crate::profile::ComponentKind;
use crate::subimage::FilterKernel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ========================================================================
    // Segmentation
    // ========================================================================
    /// Detection threshold in units of the local noise sigma.
    pub detect_threshold: f32,
    /// Minimum number of connected pixels for a detection.
    pub min_area: usize,
    /// Optional smoothing kernel applied before thresholding.
    pub filter: Option<FilterKernel>,

    // ========================================================================
    // Deblending
    // ========================================================================
    /// Outer deblend iterations (fit, subtract, re-segment).
    pub deblend_iterations: usize,
    /// Inner joint-fit iterations per deblend iteration.
    pub multifit_iterations: usize,
    /// Factor applied to neighbour models subtracted during joint fitting.
    pub neighbor_attenuation: f64,
    /// Relative model uncertainty added to the residual variance.
    pub model_tolerance: f32,
    /// Residual detection threshold in units of the residual noise sigma.
    pub residual_threshold: f32,
    /// Residual sub-detections larger than this are dropped.
    pub deblend_max_area: usize,
    /// Paste each member's own pixels into its cutouts and blank the pixels
    /// of residual detections in their parents' cutouts.
    pub blank: bool,

    // ========================================================================
    // Profile fitting
    // ========================================================================
    /// Components of the model fitted to every detection.
    pub model: Vec<ComponentKind>,
    /// Minimizer iteration limit per fit.
    pub max_fit_iterations: usize,
    /// Maximum sub-pixel oversampling factor near profile cores.
    pub oversampling: f64,
    /// Largest side of the oversampled model raster.
    pub max_model_size: usize,
    /// Largest side of the detector-resolution fitting window.
    pub max_object_size: usize,
    /// Dynamic-range compression scale of the residuals; `None` disables it.
    pub dynamic_compression: Option<f64>,
    /// Refit each detection as a point source to derive `class_star`.
    pub classify: bool,
    /// Magnitude zero point.
    pub mag_zeropoint: f64,
    pub lm: LmConfig,

    // ========================================================================
    // Measurement queue
    // ========================================================================
    /// Number of object lists buffered between the driver and the workers.
    pub queue_capacity: usize,
    /// Number of measurement worker threads.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detect_threshold: 1.5,
            min_area: 5,
            filter: None,

            deblend_iterations: 4,
            multifit_iterations: 4,
            neighbor_attenuation: 0.95,
            model_tolerance: 0.1,
            residual_threshold: 1.0,
            deblend_max_area: 3000,
            blank: false,

            model: vec![ComponentKind::Sersic],
            max_fit_iterations: 100,
            oversampling: 11.0,
            max_model_size: 512,
            max_object_size: 512,
            dynamic_compression: Some(10.0),
            classify: true,
            mag_zeropoint: 0.0,
            lm: LmConfig::default(),

            queue_capacity: 64,
            workers: 4,
        }
    }
}

impl Config {
    /// Parses a YAML document and validates the result.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yml::from_str(yaml)?;
        config.validate();
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yml::to_string(self)?)
    }

    /// Validate all configuration parameters.
    ///
    /// # Panics
    /// Panics with a descriptive message if any parameter is invalid.
    pub fn validate(&self) {
        assert!(
            self.detect_threshold > 0.0,
            "detect_threshold must be positive, got {}",
            self.detect_threshold
        );
        assert!(self.min_area >= 1, "min_area must be at least 1");
        if let Some(filter) = &self.filter {
            filter.validate();
        }

        assert!(
            (0.0..=1.0).contains(&self.neighbor_attenuation),
            "neighbor_attenuation must be in [0, 1], got {}",
            self.neighbor_attenuation
        );
        assert!(
            self.model_tolerance >= 0.0,
            "model_tolerance must be non-negative, got {}",
            self.model_tolerance
        );
        assert!(
            self.residual_threshold > 0.0,
            "residual_threshold must be positive, got {}",
            self.residual_threshold
        );
        assert!(
            self.deblend_max_area >= self.min_area,
            "deblend_max_area ({}) must be >= min_area ({})",
            self.deblend_max_area,
            self.min_area
        );

        assert!(!self.model.is_empty(), "model must have at least one component");
        assert!(
            self.oversampling >= 1.0,
            "oversampling must be >= 1, got {}",
            self.oversampling
        );
        assert!(
            self.max_model_size >= 16 && self.max_model_size % 2 == 0,
            "max_model_size must be even and >= 16, got {}",
            self.max_model_size
        );
        assert!(
            self.max_object_size >= 9,
            "max_object_size must be >= 9, got {}",
            self.max_object_size
        );
        if let Some(scale) = self.dynamic_compression {
            assert!(scale > 0.0, "dynamic_compression must be positive, got {}", scale);
        }
        self.lm.validate();

        assert!(self.queue_capacity >= 1, "queue_capacity must be at least 1");
        assert!(self.workers >= 1, "workers must be at least 1");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() -> anyhow::Result<()> {
        let config = Config::from_yaml_str("min_area: 9\nworkers: 2\n")?;
        assert_eq!(config.min_area, 9);
        assert_eq!(config.workers, 2);
        assert_eq!(config.deblend_iterations, Config::default().deblend_iterations);
        assert_eq!(config.neighbor_attenuation, 0.95);
        Ok(())
    }

    #[test]
    fn test_yaml_round_trip() -> anyhow::Result<()> {
        let mut config = Config::default();
        config.model = vec![ComponentKind::Exponential, ComponentKind::DeVaucouleurs];
        config.filter = Some(FilterKernel::gaussian(2.0, 5));
        config.dynamic_compression = None;

        let yaml = config.to_yaml()?;
        let parsed = Config::from_yaml_str(&yaml)?;
        assert_eq!(parsed, config);
        Ok(())
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = Config::from_yaml_str("min_area: [1, 2").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::from_yaml_file(Path::new("/nonexistent/sourcefit.yaml")).unwrap_err();
        assert!(matches!(err, Error::ConfigIo { .. }));
    }

    #[test]
    #[should_panic(expected = "workers must be at least 1")]
    fn test_zero_workers_rejected() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        config.validate();
    }

    #[test]
    #[should_panic(expected = "neighbor_attenuation must be in [0, 1]")]
    fn test_attenuation_out_of_range_rejected() {
        let config = Config {
            neighbor_attenuation: 1.5,
            ..Config::default()
        };
        config.validate();
    }
}
