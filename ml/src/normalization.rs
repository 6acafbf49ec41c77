use crate::{ImagePrecision, InternalDataRepresentation, WeightPrecision};
use ndarray::*;

/// Inference-time batch normalization with frozen statistics:
/// `y = gamma * (x - mean) / sqrt(var + epsilon) + beta`, per channel.
pub struct BatchNormalizationLayer {
    /// Per channel multiplier, `gamma / sqrt(var + epsilon)`
    scale: Array1<WeightPrecision>,
    /// Per channel offset, `beta - mean * scale`
    shift: Array1<WeightPrecision>,
}

impl BatchNormalizationLayer {
    pub fn new(
        mean: &Array1<WeightPrecision>,
        var: &Array1<WeightPrecision>,
        gamma: &Array1<WeightPrecision>,
        beta: &Array1<WeightPrecision>,
        epsilon: WeightPrecision,
    ) -> BatchNormalizationLayer {
        let scale = gamma / &var.mapv(|v| (v + epsilon).sqrt());
        let shift = beta - &(mean * &scale);
        BatchNormalizationLayer { scale, shift }
    }

    pub fn num_channels(&self) -> usize {
        self.scale.len()
    }

    pub fn normalize(&self, x: &ArrayView3<ImagePrecision>) -> InternalDataRepresentation {
        let mut z = x.to_owned();
        for ((mut channel, &scale), &shift) in z
            .outer_iter_mut()
            .zip(self.scale.iter())
            .zip(self.shift.iter())
        {
            channel.mapv_inplace(|a| a * scale + shift);
        }
        z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_norm() {
        let input = array![[[1., 3.]], [[0., 4.]]];
        let layer = BatchNormalizationLayer::new(
            &array![2., 0.],
            &array![4. - 1e-3, 1. - 1e-3],
            &array![1., 0.5],
            &array![0., 1.],
            1e-3,
        );

        assert_eq!(layer.num_channels(), 2);
        let res = layer.normalize(&input.view());
        let expected = array![[[-0.5, 0.5]], [[1., 3.]]];
        for (a, b) in res.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5, "{} != {}", a, b);
        }
    }

    #[test]
    fn test_zero_parameters_give_zero_output() {
        let zeros: Array1<WeightPrecision> = Array::zeros(3);
        let layer = BatchNormalizationLayer::new(&zeros, &zeros, &zeros, &zeros, 1e-3);
        let input = Array::from_elem((3, 2, 2), 5.);
        assert_eq!(layer.normalize(&input.view()), Array3::<f32>::zeros((3, 2, 2)));
    }
}
