use std::collections::{HashMap, HashSet, VecDeque};

use common::Buffer2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::test_utils::{draw_square, flat_sub};

fn run(image: Buffer2<f32>, threshold: f32, min_area: usize) -> ObjectList {
    let sub = flat_sub(image, 1.0);
    segment(&sub, Threshold::Absolute(threshold), ScanBounds::of(&sub), min_area).unwrap()
}

/// Component sizes by breadth-first flood fill, for cross-checking.
fn flood_fill_sizes(image: &Buffer2<f32>, threshold: f32) -> Vec<usize> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let mut seen = vec![false; image.len()];
    let mut sizes = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) as usize;
            if seen[i] || image[i] <= threshold {
                continue;
            }
            seen[i] = true;
            let mut queue = VecDeque::from([(x, y)]);
            let mut size = 0;
            while let Some((cx, cy)) = queue.pop_front() {
                size += 1;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let (nx, ny) = (cx + dx, cy + dy);
                        if let Some(&v) = image.checked(nx, ny) {
                            let j = (ny * w + nx) as usize;
                            if !seen[j] && v > threshold {
                                seen[j] = true;
                                queue.push_back((nx, ny));
                            }
                        }
                    }
                }
            }
            sizes.push(size);
        }
    }
    sizes.sort_unstable();
    sizes
}

#[test]
fn test_single_square() {
    let mut image = Buffer2::new_filled(20, 20, 0.0f32);
    draw_square(&mut image, 6, 8, 5, 10.0);

    let list = run(image, 5.0, 1);

    assert_eq!(list.len(), 1);
    let det = list.get(0);
    assert_eq!(det.npix, 25);
    assert_eq!((det.xmin, det.xmax, det.ymin, det.ymax), (6, 10, 8, 12));
    assert_eq!(list.pixels(det).count(), 25);
    assert!(!det.flags.contains(DetectionFlags::TRUNCATED));
    assert!((det.mx - 8.0).abs() < 1e-9);
    assert!((det.my - 10.0).abs() < 1e-9);
    assert_eq!(det.flux, 250.0);
}

#[test]
fn test_separated_squares_get_own_blend_ids() {
    let mut image = Buffer2::new_filled(20, 10, 0.0f32);
    draw_square(&mut image, 2, 2, 4, 10.0);
    draw_square(&mut image, 7, 2, 4, 10.0);

    let list = run(image, 5.0, 1);

    assert_eq!(list.len(), 2);
    for (index, det) in list.iter().enumerate() {
        assert_eq!(det.blend, index as u32);
        assert_eq!(det.number, index as u32);
        assert_eq!(det.npix, 16);
    }
    assert_ne!(list.get(0).blend, list.get(1).blend);
}

#[test]
fn test_diagonal_contact_is_one_detection() {
    let mut image = Buffer2::new_filled(20, 20, 0.0f32);
    draw_square(&mut image, 2, 2, 4, 10.0);
    draw_square(&mut image, 6, 6, 4, 10.0);

    let list = run(image, 5.0, 1);

    assert_eq!(list.len(), 1);
    assert_eq!(list.get(0).npix, 32);
}

#[test]
fn test_spike_below_min_area_is_dropped() {
    let mut image = Buffer2::new_filled(9, 9, 0.0f32);
    image[(4, 4)] = 100.0;
    assert!(run(image.clone(), 5.0, 3).is_empty());
    assert_eq!(run(image, 5.0, 1).len(), 1);
}

#[test]
fn test_u_and_inverted_u_shapes_merge() {
    // Two prongs joined below.
    let rows = ["#...#", "#...#", "#####"];
    // Two prongs joined above.
    let rows_inv = ["#####", "#...#", "#...#"];
    for pattern in [rows, rows_inv] {
        let mut image = Buffer2::new_filled(7, 5, 0.0f32);
        for (y, row) in pattern.iter().enumerate() {
            for (x, c) in row.chars().enumerate() {
                if c == '#' {
                    image[(x + 1, y + 1)] = 1.0;
                }
            }
        }
        let list = run(image, 0.5, 1);
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).npix, 9);
        assert_eq!(list.pixels(list.get(0)).count(), 9);
    }
}

#[test]
fn test_edge_runs_are_truncated() {
    let mut image = Buffer2::new_filled(12, 12, 0.0f32);
    draw_square(&mut image, 0, 4, 3, 10.0);
    draw_square(&mut image, 6, 5, 3, 10.0);

    let list = run(image, 5.0, 1);

    assert_eq!(list.len(), 2);
    let edge = list.iter().find(|d| d.xmin == 0).unwrap();
    let inner = list.iter().find(|d| d.xmin == 6).unwrap();
    assert!(edge.flags.contains(DetectionFlags::TRUNCATED));
    assert!(!inner.flags.contains(DetectionFlags::TRUNCATED));
}

#[test]
fn test_scan_bounds_restrict_and_truncate() {
    let mut image = Buffer2::new_filled(20, 20, 0.0f32);
    draw_square(&mut image, 4, 4, 6, 10.0);
    let sub = flat_sub(image, 1.0);
    let bounds = ScanBounds {
        xmin: 7,
        xmax: 20,
        ymin: 0,
        ymax: 20,
    };

    let list = segment(&sub, Threshold::Absolute(5.0), bounds, 1).unwrap();

    assert_eq!(list.len(), 1);
    let det = list.get(0);
    assert_eq!(det.xmin, 7);
    assert_eq!(det.npix, 18);
    assert!(det.flags.contains(DetectionFlags::TRUNCATED));
}

#[test]
fn test_relative_threshold_scales_with_noise() {
    let mut image = Buffer2::new_filled(10, 10, 0.0f32);
    draw_square(&mut image, 3, 3, 3, 3.0);
    let sub = flat_sub(image, 4.0);

    let low = segment(&sub, Threshold::Relative(1.0), ScanBounds::of(&sub), 1).unwrap();
    let high = segment(&sub, Threshold::Relative(2.0), ScanBounds::of(&sub), 1).unwrap();

    assert_eq!(low.len(), 1);
    assert!(high.is_empty());
}

#[test]
fn test_filtered_values_drive_threshold() {
    let mut image = Buffer2::new_filled(15, 15, 0.0f32);
    image[(7, 7)] = 9.0;
    let mut sub = flat_sub(image, 1.0);
    sub.apply_filter(&crate::subimage::FilterKernel::gaussian(2.0, 3)).unwrap();

    let list = segment(&sub, Threshold::Absolute(0.5), ScanBounds::of(&sub), 1).unwrap();

    // The smoothed spike spreads over its neighbours.
    assert_eq!(list.len(), 1);
    assert!(list.get(0).npix > 1);
    let centre = list
        .pixels(list.get(0))
        .find(|(_, p)| p.x == 7 && p.y == 7)
        .map(|(_, p)| *p)
        .unwrap();
    assert_eq!(centre.value, 9.0);
    assert!(centre.filtered.unwrap() < 9.0);
}

#[test]
fn test_missing_pixels_never_detected() {
    let mut image = Buffer2::new_filled(6, 6, crate::constants::NO_DATA);
    image[(2, 2)] = 10.0;
    let list = run(image, -1.0, 1);
    assert_eq!(list.len(), 1);
    assert_eq!(list.get(0).npix, 1);
}

#[test]
fn test_random_rasters_match_flood_fill() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..40 {
        let w = rng.random_range(1..40);
        let h = rng.random_range(1..40);
        let density: f32 = rng.random_range(0.2..0.7);
        let pixels: Vec<f32> = (0..w * h)
            .map(|_| if rng.random::<f32>() < density { 1.0 } else { 0.0 })
            .collect();
        let image = Buffer2::new(w, h, pixels);
        let expected = flood_fill_sizes(&image, 0.5);

        let list = run(image.clone(), 0.5, 1);

        let mut sizes: Vec<usize> = list.iter().map(|d| d.npix).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, expected);

        // Every above-threshold pixel lies on exactly one chain.
        let mut owner = HashMap::new();
        let mut indices = HashSet::new();
        for (n, det) in list.iter().enumerate() {
            let mut count = 0;
            for (index, p) in list.pixels(det) {
                assert!(indices.insert(index), "record {} chained twice", index);
                assert!(owner.insert((p.x, p.y), n).is_none());
                count += 1;
            }
            assert_eq!(count, det.npix);
        }
        let above = image.iter().filter(|&&v| v > 0.5).count();
        assert_eq!(owner.len(), above);
    }
}
