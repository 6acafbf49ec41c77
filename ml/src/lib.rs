//! Small CPU compute-graph library.
//!
//! Layers are described with [`graph::LayerDesc`], their parameters are pulled in through
//! [`accessor::TensorAccessor`] implementations while the graph is built, and the finished
//! [`graph::Graph`] is executed batch by batch until its input accessor runs out of data.
pub mod accessor;
pub mod activation_functions;
pub mod convolutions;
pub mod graph;
pub mod normalization;
pub mod pooling;
pub mod weight_loader;

use ndarray::{Array3, ArrayD};

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

/// A single sample in (channels, height, width) layout.
pub type InternalDataRepresentation = Array3<ImagePrecision>;

/// A batch of samples. The batch axis always comes first.
pub type Tensor = ArrayD<ImagePrecision>;

pub use accessor::{AccessorError, TensorAccessor};
pub use graph::{Graph, GraphBuilder, GraphError, GraphResult, LayerDesc, SubGraph};
