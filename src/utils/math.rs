//! Math utility functions

use ndarray::{ArrayView1, ArrayViewMut1};

/// Euclidean norm of a vector
pub fn l2_norm(v: ArrayView1<f32>) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// L2 normalize a vector in place
pub fn l2_normalize(mut v: ArrayViewMut1<f32>) {
    let norm = l2_norm(v.view());
    if norm > 0.0 {
        v.mapv_inplace(|x| x / norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_l2_norm() {
        let v = array![3.0f32, 4.0];
        assert!((l2_norm(v.view()) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = array![3.0f32, 4.0];
        l2_normalize(v.view_mut());
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let mut v = array![0.0f32, 0.0];
        l2_normalize(v.view_mut());
        assert_eq!(v[0], 0.0);
    }
}
