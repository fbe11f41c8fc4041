//! W+ latent codes

use ndarray::{Array2, Array3, ArrayView2, Axis};

use crate::error::StageError;

/// Per-layer latent code of shape `(batch, layers, dim)`
#[derive(Debug, Clone, PartialEq)]
pub struct LatentCode {
    data: Array3<f32>,
}

impl LatentCode {
    pub fn new(data: Array3<f32>) -> Self {
        Self { data }
    }

    /// Broadcast a W-space code `(batch, dim)` to W+ by repeating it on every layer
    pub fn from_w(w: ArrayView2<f32>, num_layers: usize) -> Self {
        let (batch, dim) = w.dim();
        let data = Array3::from_shape_fn((batch, num_layers, dim), |(b, _, d)| w[[b, d]]);
        Self { data }
    }

    /// Build from a raw tensor of shape `[batch, dim]` or `[batch, layers, dim]`,
    /// checking it against the generator geometry
    pub fn from_raw(
        shape: &[usize],
        values: Vec<f32>,
        num_layers: usize,
        latent_dim: usize,
    ) -> Result<Self, StageError> {
        let mismatch = || StageError::Shape {
            expected: (num_layers, latent_dim),
            actual: shape.to_vec(),
        };

        match *shape {
            [batch, dim] if dim == latent_dim => {
                let w = Array2::from_shape_vec((batch, dim), values).map_err(|_| mismatch())?;
                tracing::debug!("Expanding W latent to W+ with {} layers", num_layers);
                Ok(Self::from_w(w.view(), num_layers))
            }
            [batch, layers, dim] if layers == num_layers && dim == latent_dim => {
                let data = Array3::from_shape_vec((batch, layers, dim), values)
                    .map_err(|_| mismatch())?;
                Ok(Self { data })
            }
            _ => Err(mismatch()),
        }
    }

    pub fn batch(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn num_layers(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn latent_dim(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    pub fn view(&self) -> ndarray::ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn as_array(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn into_array(self) -> Array3<f32> {
        self.data
    }

    /// Flatten to `(batch, layers * dim)`
    pub fn to_flat(&self) -> Array2<f32> {
        let (batch, layers, dim) = self.data.dim();
        Array2::from_shape_fn((batch, layers * dim), |(b, i)| self.data[[b, i / dim, i % dim]])
    }

    pub fn from_flat(flat: &Array2<f32>, num_layers: usize) -> Self {
        let (batch, width) = flat.dim();
        let dim = width / num_layers;
        let data = Array3::from_shape_fn((batch, num_layers, dim), |(b, l, d)| flat[[b, l * dim + d]]);
        Self { data }
    }

    /// Blend toward `mean`: `mean + psi * (self - mean)`.
    /// `psi >= 1.0` leaves the code untouched.
    pub fn truncate(self, mean: &LatentCode, psi: f32) -> Self {
        if psi >= 1.0 {
            return self;
        }
        let mean = mean.data.view();
        let data = &mean + &((&self.data - &mean) * psi);
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_w_is_broadcast_to_every_layer() {
        let w = array![[1.0f32, 2.0, 3.0]];
        let code = LatentCode::from_w(w.view(), 4);
        assert_eq!(code.as_array().dim(), (1, 4, 3));
        for layer in 0..4 {
            assert_eq!(code.as_array()[[0, layer, 2]], 3.0);
        }
    }

    #[test]
    fn test_from_raw_rejects_wrong_geometry() {
        let err = LatentCode::from_raw(&[1, 3, 5], vec![0.0; 15], 4, 5).unwrap_err();
        assert!(matches!(err, StageError::Shape { .. }));

        let ok = LatentCode::from_raw(&[1, 5], vec![0.5; 5], 4, 5).unwrap();
        assert_eq!(ok.num_layers(), 4);
    }

    #[test]
    fn test_truncation_one_is_identity() {
        let code = LatentCode::new(Array3::from_elem((1, 2, 3), 0.3));
        let mean = LatentCode::new(Array3::from_elem((1, 2, 3), 10.0));
        assert_eq!(code.clone().truncate(&mean, 1.0), code);
    }

    #[test]
    fn test_truncation_blends_toward_mean() {
        let code = LatentCode::new(Array3::from_elem((1, 1, 2), 2.0));
        let mean = LatentCode::new(Array3::from_elem((1, 1, 2), 0.0));
        let truncated = code.truncate(&mean, 0.5);
        assert!((truncated.as_array()[[0, 0, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_flat_roundtrip_keeps_layout() {
        let data = Array3::from_shape_fn((1, 2, 3), |(_, l, d)| (l * 3 + d) as f32);
        let code = LatentCode::new(data.clone());
        let flat = code.to_flat();
        assert_eq!(flat[[0, 4]], 4.0);
        assert_eq!(LatentCode::from_flat(&flat, 2).into_array(), data);
    }
}
