//! This module provides the activation functions for our neural networks,
//! namely Relu, the bounded Relu (Relu6 in MobileNets) and softmax.
//!
//! Elementwise functions are exposed as a layer as well as a free function.
use ndarray::*;

use crate::{ImagePrecision, Tensor};

/// Relu implementation
pub fn relu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| if x > 0. { x } else { 0. })
}

/// Clamps every value into [0, upper]. With upper = 6 this is the Relu6 of MobileNets.
pub fn bounded_relu<D: Dimension>(
    data: &Array<ImagePrecision, D>,
    upper: ImagePrecision,
) -> Array<ImagePrecision, D> {
    data.mapv(|x| num::clamp(x, 0., upper))
}

/// Numerically stable softmax along the last axis, applied to every lane separately.
pub fn softmax<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    let mut z = data.clone();
    if z.ndim() == 0 {
        return z;
    }
    let last = Axis(z.ndim() - 1);
    for mut lane in z.lanes_mut(last) {
        let max = lane.fold(ImagePrecision::NEG_INFINITY, |m, &x| m.max(x));
        lane.mapv_inplace(|x| (x - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum);
    }
    z
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationFunction {
    Relu,
    BoundedRelu(ImagePrecision),
}

/// Elementwise activation as a layer.
pub struct ActivationLayer {
    function: ActivationFunction,
}

impl ActivationLayer {
    pub fn new(function: ActivationFunction) -> Self {
        Self { function }
    }

    pub fn activate(&self, x: &Tensor) -> Tensor {
        match self.function {
            ActivationFunction::Relu => relu(x),
            ActivationFunction::BoundedRelu(upper) => bounded_relu(x, upper),
        }
    }
}

/// Softmax over the last axis as a layer.
pub struct SoftmaxLayer {}

impl SoftmaxLayer {
    pub fn new() -> Self {
        Self {}
    }

    pub fn activate(&self, x: &Tensor) -> Tensor {
        softmax(x)
    }
}
