// Fixed-size linear algebra for the position filter
//
// All matrices are stack-allocated nalgebra SMatrix types, so the predict/update
// path never allocates. Multiply, transpose, add and subtract are the nalgebra
// operators; this module adds the closed-form 2x2 inverse and the model matrices.

use nalgebra::{SMatrix, SVector};

use crate::constants::SINGULAR_DETERMINANT;

/// State vector: [lat, lon, v_lat, v_lon]
pub type Vector4 = SVector<f64, 4>;
/// Measurement vector: [lat, lon]
pub type Vector2 = SVector<f64, 2>;
pub type Matrix4 = SMatrix<f64, 4, 4>;
pub type Matrix2 = SMatrix<f64, 2, 2>;
/// Observation matrix (measurement x state)
pub type Matrix2x4 = SMatrix<f64, 2, 4>;
/// Gain matrix (state x measurement)
pub type Matrix4x2 = SMatrix<f64, 4, 2>;

/// Closed-form inverse of a 2x2 matrix.
///
/// Returns `None` when the determinant is within `SINGULAR_DETERMINANT` of zero
/// or not finite.
pub fn invert_2x2(m: &Matrix2) -> Option<Matrix2> {
    let a = m[(0, 0)];
    let b = m[(0, 1)];
    let c = m[(1, 0)];
    let d = m[(1, 1)];

    let det = a * d - b * c;
    if !det.is_finite() || det.abs() < SINGULAR_DETERMINANT {
        return None;
    }

    let inv_det = 1.0 / det;
    Some(Matrix2::new(
        d * inv_det, -b * inv_det,
        -c * inv_det, a * inv_det,
    ))
}

/// Inverse with identity fallback.
///
/// The flag is true when the input was singular and the identity was returned.
pub fn invert_2x2_or_identity(m: &Matrix2) -> (Matrix2, bool) {
    match invert_2x2(m) {
        Some(inv) => (inv, false),
        None => (Matrix2::identity(), true),
    }
}

/// Constant-velocity transition over `dt` seconds.
///
/// lat' = lat + v_lat*dt, lon' = lon + v_lon*dt, velocities unchanged.
pub fn constant_velocity_transition(dt: f64) -> Matrix4 {
    let mut f = Matrix4::identity();
    f[(0, 2)] = dt;
    f[(1, 3)] = dt;
    f
}

/// Observation matrix selecting the position components.
pub fn position_observation() -> Matrix2x4 {
    let mut h = Matrix2x4::zeros();
    h[(0, 0)] = 1.0;
    h[(1, 1)] = 1.0;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invert_2x2() {
        let m = Matrix2::new(4.0, 7.0, 2.0, 6.0);
        let inv = invert_2x2(&m).unwrap();
        let product = m * inv;
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((product[(i, j)] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_invert_singular_falls_back_to_identity() {
        let m = Matrix2::new(1.0, 2.0, 2.0, 4.0);
        assert!(invert_2x2(&m).is_none());

        let (inv, singular) = invert_2x2_or_identity(&m);
        assert!(singular);
        assert_eq!(inv, Matrix2::identity());

        let (_, singular) = invert_2x2_or_identity(&Matrix2::zeros());
        assert!(singular);
    }

    #[test]
    fn test_transition_moves_position_by_velocity() {
        let f = constant_velocity_transition(2.0);
        let x = Vector4::new(10.0, -66.0, 0.5, -0.25);
        let next = f * x;
        assert!((next[0] - 11.0).abs() < 1e-12);
        assert!((next[1] + 66.5).abs() < 1e-12);
        assert_eq!(next[2], 0.5);
        assert_eq!(next[3], -0.25);
    }

    #[test]
    fn test_observation_picks_position() {
        let h = position_observation();
        let x = Vector4::new(1.0, 2.0, 3.0, 4.0);
        let z = h * x;
        assert_eq!(z, Vector2::new(1.0, 2.0));

        let ht = h.transpose();
        assert_eq!(ht.nrows(), 4);
        assert_eq!(ht[(1, 1)], 1.0);
    }
}
