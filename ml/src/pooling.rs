use crate::{ImagePrecision, InternalDataRepresentation};
use ndarray::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingType {
    Avg,
    Max,
}

/// Global pooling: every channel is reduced to a single value, (C, H, W) -> (C, 1, 1).
pub struct PoolingLayer {
    pooling_type: PoolingType,
}

impl PoolingLayer {
    pub fn new(pooling_type: PoolingType) -> Self {
        Self { pooling_type }
    }

    pub fn pool(&self, x: &ArrayView3<ImagePrecision>) -> InternalDataRepresentation {
        let channels = x.len_of(Axis(0));
        let mut z = Array3::zeros((channels, 1, 1));
        for (c, channel) in x.outer_iter().enumerate() {
            z[[c, 0, 0]] = match self.pooling_type {
                PoolingType::Avg => channel.sum() / channel.len() as ImagePrecision,
                PoolingType::Max => channel.fold(ImagePrecision::NEG_INFINITY, |m, &a| m.max(a)),
            };
        }
        z
    }
}
