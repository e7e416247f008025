//! Dense linear algebra for the normal equations of the minimizer.
//!
//! Matrices are square, row-major `n * n` slices. Systems are small (one
//! row per free parameter), so plain elimination with partial pivoting is
//! enough.

/// Pivots below this fraction of the largest matrix entry count as zero.
const RELATIVE_PIVOT: f64 = 1e-12;

fn max_abs(a: &[f64]) -> f64 {
    a.iter().fold(0.0f64, |m, v| m.max(v.abs()))
}

/// Solves `A x = b` by Gaussian elimination with partial pivoting.
/// Returns `None` when `A` is singular.
pub fn solve(a: &[f64], b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    debug_assert_eq!(a.len(), n * n);
    let mut m = a.to_vec();
    let mut rhs = b.to_vec();
    let tiny = RELATIVE_PIVOT * max_abs(a);

    for col in 0..n {
        let (pivot_row, pivot) = (col..n)
            .map(|row| (row, m[row * n + col].abs()))
            .fold((col, -1.0), |best, cur| if cur.1 > best.1 { cur } else { best });
        if pivot <= tiny {
            return None;
        }
        if pivot_row != col {
            for j in 0..n {
                m.swap(col * n + j, pivot_row * n + j);
            }
            rhs.swap(col, pivot_row);
        }

        for row in (col + 1)..n {
            let factor = m[row * n + col] / m[col * n + col];
            if factor == 0.0 {
                continue;
            }
            for j in col..n {
                m[row * n + j] -= factor * m[col * n + j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = rhs[i];
        for j in (i + 1)..n {
            sum -= m[i * n + j] * x[j];
        }
        x[i] = sum / m[i * n + i];
    }
    Some(x)
}

/// Inverse of a symmetric positive semi-definite matrix. Rows whose
/// diagonal vanishes are left out and come back as zero rows and columns.
/// Returns `None` when the remaining block is singular.
pub fn invert_semidefinite(a: &[f64], n: usize) -> Option<Vec<f64>> {
    debug_assert_eq!(a.len(), n * n);
    let max_diag = (0..n).fold(0.0f64, |m, i| m.max(a[i * n + i]));
    let kept: Vec<usize> = (0..n)
        .filter(|&i| a[i * n + i] > RELATIVE_PIVOT * max_diag)
        .collect();
    let k = kept.len();

    let mut reduced = vec![0.0; k * k];
    for (ri, &i) in kept.iter().enumerate() {
        for (rj, &j) in kept.iter().enumerate() {
            reduced[ri * k + rj] = a[i * n + j];
        }
    }

    let mut inverse = vec![0.0; n * n];
    let mut unit = vec![0.0; k];
    for col in 0..k {
        unit.fill(0.0);
        unit[col] = 1.0;
        let column = solve(&reduced, &unit)?;
        for (row, value) in column.into_iter().enumerate() {
            inverse[kept[row] * n + kept[col]] = value;
        }
    }
    Some(inverse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_diagonal() {
        let a = [2.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 0.0, 5.0];
        let x = solve(&a, &[2.0, 8.0, 15.0]).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
        assert!((x[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_solve_needs_pivoting() {
        // Zero in the leading position forces a row swap.
        let a = [0.0, 1.0, 1.0, 1.0];
        let x = solve(&a, &[2.0, 3.0]).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_singular_returns_none() {
        let a = [1.0, 2.0, 2.0, 4.0];
        assert!(solve(&a, &[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_inverse_of_spd_matrix() {
        let a = [4.0, 1.0, 1.0, 3.0];
        let inv = invert_semidefinite(&a, 2).unwrap();
        // A * A^-1 = I.
        for i in 0..2 {
            for j in 0..2 {
                let v: f64 = (0..2).map(|k| a[i * 2 + k] * inv[k * 2 + j]).sum();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((v - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_inverse_skips_dead_rows() {
        let a = [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 8.0];
        let inv = invert_semidefinite(&a, 3).unwrap();
        assert!((inv[0] - 0.5).abs() < 1e-12);
        assert_eq!(inv[4], 0.0);
        assert!((inv[8] - 0.125).abs() < 1e-12);
    }
}
