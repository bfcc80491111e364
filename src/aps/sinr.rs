//! SINR evaluation of linear downlink precoders.

use ndarray::{Array1, Array2, ArrayView2};

use super::Complex64;

/// Smallest magnitude kept by [`polar`] so phases stay defined.
const MIN_MAGNITUDE: f64 = 1e-20;

/// Per-UE SINR achieved by the combining matrix `a` under power budget `rho_d`.
///
/// Row `i` of `a` holds the coefficients seen by UE `i`; the diagonal term is
/// the useful signal and the rest of the row is interference:
///
/// `sinr_i = rho_d |a_ii|² / (1 + rho_d ‖a_i‖² − rho_d |a_ii|²)`
///
/// # Panics
///
/// Panics if `a` is not square.
pub fn sinr_from_a(a: ArrayView2<'_, Complex64>, rho_d: f64) -> Array1<f64> {
    assert_eq!(a.nrows(), a.ncols(), "combining matrix must be square");

    a.outer_iter()
        .enumerate()
        .map(|(i, row)| {
            let signal = row[i].norm_sqr() * rho_d;
            let total = rho_d * row.iter().map(|c| c.norm_sqr()).sum::<f64>();
            signal / (1.0 + total - signal)
        })
        .collect()
}

/// Worst-user SINR, i.e. the max-min objective value of `a`.
///
/// Returns `f64::INFINITY` for an empty matrix.
pub fn min_sinr(a: ArrayView2<'_, Complex64>, rho_d: f64) -> f64 {
    sinr_from_a(a, rho_d)
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min)
}

/// Splits a complex matrix into (magnitude, phase), flooring magnitudes at 1e-20.
pub fn polar(a: ArrayView2<'_, Complex64>) -> (Array2<f64>, Array2<f64>) {
    let magnitude = a.mapv(|c| c.norm().max(MIN_MAGNITUDE));
    let phase = a.mapv(|c| c.arg());
    (magnitude, phase)
}

/// Rebuilds `a` from its floored polar form so that no entry is exactly zero.
pub fn clip_abs(a: ArrayView2<'_, Complex64>) -> Array2<Complex64> {
    let (magnitude, phase) = polar(a);
    ndarray::Zip::from(&magnitude)
        .and(&phase)
        .map_collect(|&r, &theta| Complex64::from_polar(r, theta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    #[test]
    fn diagonal_precoder_has_no_interference() {
        let a = array![[c(2.0, 0.0), c(0.0, 0.0)], [c(0.0, 0.0), c(0.0, 1.0)]];
        let sinr = sinr_from_a(a.view(), 1.0);
        // 4 / (1 + 4 - 4) and 1 / (1 + 1 - 1)
        assert!((sinr[0] - 4.0).abs() < 1e-12);
        assert!((sinr[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn interference_lowers_sinr() {
        let a = array![[c(1.0, 0.0), c(1.0, 0.0)], [c(0.0, 0.0), c(1.0, 0.0)]];
        let sinr = sinr_from_a(a.view(), 2.0);
        // UE 0: 2 / (1 + 4 - 2) = 2/3
        assert!((sinr[0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((sinr[1] - 2.0).abs() < 1e-12);
        assert!((min_sinr(a.view(), 2.0) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn clip_abs_removes_exact_zeros() {
        let a = array![[c(0.0, 0.0), c(3.0, -4.0)]];
        let clipped = clip_abs(a.view());
        assert!(clipped[[0, 0]].norm() >= MIN_MAGNITUDE * 0.5);
        assert!((clipped[[0, 1]] - a[[0, 1]]).norm() < 1e-12);
    }

    #[test]
    fn polar_phase_matches_arg() {
        let a = array![[c(0.0, 2.0)]];
        let (mag, phase) = polar(a.view());
        assert!((mag[[0, 0]] - 2.0).abs() < 1e-12);
        assert!((phase[[0, 0]] - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }
}
