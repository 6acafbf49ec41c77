//! Graph construction and execution.
//!
//! A [`GraphBuilder`] consumes [`LayerDesc`]s in order. It tracks the shape flowing through
//! the graph, allocates every parameter tensor with the shape the layer expects and lets the
//! layer's accessor fill it. The resulting [`Graph`] then repeatedly pulls a batch from its
//! input accessor, runs all layers and hands the result to its output accessor.
use crate::{
    accessor::{AccessorError, TensorAccessor},
    activation_functions::{ActivationFunction, ActivationLayer, SoftmaxLayer},
    convolutions::{ConvolutionLayer, ConvolutionMethodHint, DepthwiseConvolutionLayer, PadStrideInfo},
    normalization::BatchNormalizationLayer,
    pooling::{PoolingLayer, PoolingType},
    ImagePrecision, InternalDataRepresentation, Tensor, WeightPrecision,
};
use log::debug;
use ndarray::{stack, ArrayView3, Axis, Ix1, Ix3, Ix4, IxDyn, ShapeError};
use thiserror::Error;

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Could not access the {tensor} of {layer}: {source}")]
    WeightAccessError {
        layer: String,
        tensor: &'static str,
        #[source]
        source: AccessorError,
    },
    #[error("Input accessor failed: {0}")]
    InputAccessError(#[source] AccessorError),
    #[error("Output accessor failed: {0}")]
    OutputAccessError(#[source] AccessorError),
    #[error("{layer} cannot be applied to an input of shape {shape:?}: {reason}")]
    InvalidLayerError {
        layer: String,
        shape: Vec<usize>,
        reason: String,
    },
    #[error("Tensor has an unexpected shape:\n {0}.")]
    ShapeError(#[from] ShapeError),
}

/// Description of a layer, as handed to the [`GraphBuilder`].
/// Parameter tensors are represented by the accessors that will fill them.
pub enum LayerDesc<A> {
    /// Weights (outputs, inputs, kernel height, kernel width), biases (outputs)
    Convolution {
        kernel_height: usize,
        kernel_width: usize,
        num_outputs: usize,
        weights: A,
        biases: Option<A>,
        pad_stride: PadStrideInfo,
    },
    /// Weights (channels, kernel height, kernel width), biases (channels)
    DepthwiseConvolution {
        kernel_height: usize,
        kernel_width: usize,
        weights: A,
        biases: Option<A>,
        pad_stride: PadStrideInfo,
    },
    BatchNormalization {
        mean: A,
        var: A,
        gamma: A,
        beta: A,
        epsilon: WeightPrecision,
    },
    Activation(ActivationFunction),
    /// Global pooling
    Pooling(PoolingType),
    /// Target shape of a single sample
    Reshape(Vec<usize>),
    Softmax,
    SubGraph(SubGraph<A>),
}

impl<A> LayerDesc<A> {
    pub fn convolution(
        kernel_height: usize,
        kernel_width: usize,
        num_outputs: usize,
        weights: A,
        biases: Option<A>,
        pad_stride: PadStrideInfo,
    ) -> Self {
        LayerDesc::Convolution {
            kernel_height,
            kernel_width,
            num_outputs,
            weights,
            biases,
            pad_stride,
        }
    }

    pub fn depthwise_convolution(
        kernel_height: usize,
        kernel_width: usize,
        weights: A,
        biases: Option<A>,
        pad_stride: PadStrideInfo,
    ) -> Self {
        LayerDesc::DepthwiseConvolution {
            kernel_height,
            kernel_width,
            weights,
            biases,
            pad_stride,
        }
    }

    pub fn batch_normalization(
        mean: A,
        var: A,
        gamma: A,
        beta: A,
        epsilon: WeightPrecision,
    ) -> Self {
        LayerDesc::BatchNormalization {
            mean,
            var,
            gamma,
            beta,
            epsilon,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LayerDesc::Convolution { .. } => "Convolution",
            LayerDesc::DepthwiseConvolution { .. } => "DepthwiseConvolution",
            LayerDesc::BatchNormalization { .. } => "BatchNormalization",
            LayerDesc::Activation(_) => "Activation",
            LayerDesc::Pooling(_) => "Pooling",
            LayerDesc::Reshape(_) => "Reshape",
            LayerDesc::Softmax => "Softmax",
            LayerDesc::SubGraph(_) => "SubGraph",
        }
    }
}

/// A named sequence of layers with a single input and a single output.
pub struct SubGraph<A> {
    name: String,
    layers: Vec<LayerDesc<A>>,
}

impl<A> SubGraph<A> {
    pub fn new<S: Into<String>>(name: S) -> Self {
        SubGraph {
            name: name.into(),
            layers: Vec::new(),
        }
    }

    /// Appends a layer, builder style.
    pub fn then(mut self, layer: LayerDesc<A>) -> Self {
        self.layers.push(layer);
        self
    }
}

/// A configured layer, ready to be executed.
enum Node {
    Convolution(ConvolutionLayer),
    DepthwiseConvolution(DepthwiseConvolutionLayer),
    BatchNormalization(BatchNormalizationLayer),
    Activation(ActivationLayer),
    Pooling(PoolingLayer),
    Reshape(Vec<usize>),
    Softmax(SoftmaxLayer),
}

impl Node {
    fn forward(&self, x: Tensor) -> GraphResult<Tensor> {
        match self {
            Node::Convolution(l) => per_sample(&x, |s| l.convolve(&s)),
            Node::DepthwiseConvolution(l) => per_sample(&x, |s| l.convolve(&s)),
            Node::BatchNormalization(l) => per_sample(&x, |s| l.normalize(&s)),
            Node::Activation(l) => Ok(l.activate(&x)),
            Node::Pooling(l) => per_sample(&x, |s| l.pool(&s)),
            Node::Reshape(shape) => {
                let mut new_shape = vec![x.len_of(Axis(0))];
                new_shape.extend_from_slice(shape);
                Ok(Tensor::from_shape_vec(
                    IxDyn(&new_shape),
                    x.iter().copied().collect(),
                )?)
            }
            Node::Softmax(l) => Ok(l.activate(&x)),
        }
    }
}

/// Applies `f` to every (channels, height, width) sample of the batch.
fn per_sample<F>(x: &Tensor, f: F) -> GraphResult<Tensor>
where
    F: Fn(ArrayView3<ImagePrecision>) -> InternalDataRepresentation,
{
    let outputs = x
        .outer_iter()
        .map(|sample| sample.into_dimensionality::<Ix3>().map(&f))
        .collect::<Result<Vec<_>, _>>()?;
    let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
    Ok(stack(Axis(0), &views)?.into_dyn())
}

/// Allocates a parameter tensor and lets the accessor fill it.
fn access_parameter<A: TensorAccessor>(
    accessor: &mut A,
    shape: &[usize],
    layer: &str,
    tensor: &'static str,
) -> GraphResult<Tensor> {
    let mut parameter = Tensor::zeros(IxDyn(shape));
    accessor
        .access_tensor(&mut parameter)
        .map_err(|source| GraphError::WeightAccessError {
            layer: layer.to_string(),
            tensor,
            source,
        })?;
    Ok(parameter)
}

pub struct GraphBuilder<A> {
    input: A,
    batch_size: usize,
    input_shape: Vec<usize>,
    /// Shape of a single sample after the last configured layer
    shape: Vec<usize>,
    nodes: Vec<Node>,
    method: ConvolutionMethodHint,
}

impl<A: TensorAccessor> GraphBuilder<A> {
    /// `input_shape` is the shape of a single sample, without the batch axis.
    pub fn new(input_shape: &[usize], batch_size: usize, input: A) -> Self {
        GraphBuilder {
            input,
            batch_size,
            input_shape: input_shape.to_vec(),
            shape: input_shape.to_vec(),
            nodes: Vec::new(),
            method: ConvolutionMethodHint::default(),
        }
    }

    /// Applies to all convolutions added afterwards.
    pub fn convolution_method(&mut self, method: ConvolutionMethodHint) -> &mut Self {
        self.method = method;
        self
    }

    /// Shape of a single sample after the layers added so far.
    pub fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn add(&mut self, layer: LayerDesc<A>) -> GraphResult<&mut Self> {
        self.configure(layer, "")?;
        Ok(self)
    }

    pub fn finish(self, output: A) -> Graph<A> {
        let batch_size = self.batch_size;
        let with_batch = |shape: &[usize]| {
            let mut full = vec![batch_size];
            full.extend_from_slice(shape);
            full
        };
        let input_shape = with_batch(&self.input_shape);
        let output_shape = with_batch(&self.shape);
        Graph {
            input: self.input,
            output,
            input_shape,
            output_shape,
            nodes: self.nodes,
        }
    }

    fn invalid(&self, layer: &str, reason: &str) -> GraphError {
        GraphError::InvalidLayerError {
            layer: layer.to_string(),
            shape: self.shape.clone(),
            reason: reason.to_string(),
        }
    }

    fn spatial_shape(&self, layer: &str) -> GraphResult<(usize, usize, usize)> {
        match self.shape.as_slice() {
            &[c, h, w] => Ok((c, h, w)),
            _ => Err(self.invalid(layer, "expected a (channels, height, width) input")),
        }
    }

    fn configure(&mut self, layer: LayerDesc<A>, scope: &str) -> GraphResult<()> {
        let name = if scope.is_empty() {
            format!("{} {}", layer.kind(), self.nodes.len())
        } else {
            format!("{}/{}", scope, layer.kind())
        };

        let node = match layer {
            LayerDesc::SubGraph(sub_graph) => {
                let scope = if scope.is_empty() {
                    sub_graph.name
                } else {
                    format!("{}/{}", scope, sub_graph.name)
                };
                for layer in sub_graph.layers {
                    self.configure(layer, &scope)?;
                }
                return Ok(());
            }
            LayerDesc::Convolution {
                kernel_height,
                kernel_width,
                num_outputs,
                mut weights,
                biases,
                pad_stride,
            } => {
                let (c, h, w) = self.spatial_shape(&name)?;
                let (new_h, new_w) = pad_stride
                    .scaled_dimensions(h, w, kernel_height, kernel_width)
                    .ok_or_else(|| self.invalid(&name, "kernel larger than padded input"))?;
                let weights = access_parameter(
                    &mut weights,
                    &[num_outputs, c, kernel_height, kernel_width],
                    &name,
                    "weights",
                )?
                .into_dimensionality::<Ix4>()?;
                let biases = match biases {
                    Some(mut b) => Some(
                        access_parameter(&mut b, &[num_outputs], &name, "biases")?
                            .into_dimensionality::<Ix1>()?,
                    ),
                    None => None,
                };
                self.shape = vec![num_outputs, new_h, new_w];
                Node::Convolution(ConvolutionLayer::new(
                    weights,
                    biases,
                    pad_stride,
                    self.method,
                ))
            }
            LayerDesc::DepthwiseConvolution {
                kernel_height,
                kernel_width,
                mut weights,
                biases,
                pad_stride,
            } => {
                let (c, h, w) = self.spatial_shape(&name)?;
                let (new_h, new_w) = pad_stride
                    .scaled_dimensions(h, w, kernel_height, kernel_width)
                    .ok_or_else(|| self.invalid(&name, "kernel larger than padded input"))?;
                let weights = access_parameter(
                    &mut weights,
                    &[c, kernel_height, kernel_width],
                    &name,
                    "weights",
                )?
                .into_dimensionality::<Ix3>()?;
                let biases = match biases {
                    Some(mut b) => Some(
                        access_parameter(&mut b, &[c], &name, "biases")?
                            .into_dimensionality::<Ix1>()?,
                    ),
                    None => None,
                };
                self.shape = vec![c, new_h, new_w];
                Node::DepthwiseConvolution(DepthwiseConvolutionLayer::new(
                    weights, biases, pad_stride,
                ))
            }
            LayerDesc::BatchNormalization {
                mut mean,
                mut var,
                mut gamma,
                mut beta,
                epsilon,
            } => {
                let (c, _, _) = self.spatial_shape(&name)?;
                let parameter = |accessor: &mut A, tensor: &'static str| {
                    access_parameter(accessor, &[c], &name, tensor)
                        .and_then(|p| Ok(p.into_dimensionality::<Ix1>()?))
                };
                let mean = parameter(&mut mean, "moving mean")?;
                let var = parameter(&mut var, "moving variance")?;
                let gamma = parameter(&mut gamma, "gamma")?;
                let beta = parameter(&mut beta, "beta")?;
                Node::BatchNormalization(BatchNormalizationLayer::new(
                    &mean, &var, &gamma, &beta, epsilon,
                ))
            }
            LayerDesc::Activation(function) => Node::Activation(ActivationLayer::new(function)),
            LayerDesc::Pooling(pooling_type) => {
                let (c, _, _) = self.spatial_shape(&name)?;
                self.shape = vec![c, 1, 1];
                Node::Pooling(PoolingLayer::new(pooling_type))
            }
            LayerDesc::Reshape(target) => {
                let from: usize = self.shape.iter().product();
                let to: usize = target.iter().product();
                if from != to {
                    return Err(self.invalid(
                        &name,
                        &format!("cannot reshape {} elements into {:?}", from, target),
                    ));
                }
                self.shape = target.clone();
                Node::Reshape(target)
            }
            LayerDesc::Softmax => Node::Softmax(SoftmaxLayer::new()),
        };

        debug!("Configured {}, output shape {:?}", name, self.shape);
        self.nodes.push(node);
        Ok(())
    }
}

/// An executable graph. Input and output tensors carry the batch axis first.
pub struct Graph<A> {
    input: A,
    output: A,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    nodes: Vec<Node>,
}

impl<A: TensorAccessor> Graph<A> {
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn num_layers(&self) -> usize {
        self.nodes.len()
    }

    pub fn output_accessor(&self) -> &A {
        &self.output
    }

    /// Runs all layers on one batch.
    pub fn forward(&self, input: Tensor) -> GraphResult<Tensor> {
        self.nodes.iter().try_fold(input, |x, node| node.forward(x))
    }

    /// Executes the graph once per batch delivered by the input accessor, until it reports
    /// that no data is left. Returns the number of processed batches.
    pub fn run(&mut self) -> GraphResult<usize> {
        let mut batches = 0;
        loop {
            let mut input = Tensor::zeros(IxDyn(&self.input_shape));
            let has_data = self
                .input
                .access_tensor(&mut input)
                .map_err(GraphError::InputAccessError)?;
            if !has_data {
                break;
            }
            let mut output = self.forward(input)?;
            self.output
                .access_tensor(&mut output)
                .map_err(GraphError::OutputAccessError)?;
            batches += 1;
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::AccessorResult;
    use ndarray::Array;
    use std::collections::VecDeque;

    enum TestAccessor {
        Constant(f32),
        Queue(VecDeque<Tensor>),
        Sink(Vec<Tensor>),
        Broken,
    }

    impl TensorAccessor for TestAccessor {
        fn access_tensor(&mut self, tensor: &mut Tensor) -> AccessorResult<bool> {
            match self {
                TestAccessor::Constant(v) => {
                    tensor.fill(*v);
                    Ok(true)
                }
                TestAccessor::Queue(q) => match q.pop_front() {
                    Some(t) => {
                        tensor.assign(&t);
                        Ok(true)
                    }
                    None => Ok(false),
                },
                TestAccessor::Sink(outputs) => {
                    outputs.push(tensor.clone());
                    Ok(true)
                }
                TestAccessor::Broken => Err(AccessorError::Other("broken".to_string())),
            }
        }
    }

    fn tiny_block(name: &str) -> SubGraph<TestAccessor> {
        SubGraph::new(name)
            .then(LayerDesc::depthwise_convolution(
                3,
                3,
                TestAccessor::Constant(0.1),
                None,
                PadStrideInfo::new(1, 1, 1, 1),
            ))
            .then(LayerDesc::batch_normalization(
                TestAccessor::Constant(0.),
                TestAccessor::Constant(1.),
                TestAccessor::Constant(1.),
                TestAccessor::Constant(0.),
                1e-3,
            ))
            .then(LayerDesc::Activation(ActivationFunction::BoundedRelu(6.)))
    }

    #[test]
    fn test_build_and_run() -> GraphResult<()> {
        let batch = Array::from_shape_fn((2, 1, 4, 4), |(n, _, i, j)| (n + i + j) as f32).into_dyn();
        let mut builder = GraphBuilder::new(
            &[1, 4, 4],
            2,
            TestAccessor::Queue(vec![batch].into_iter().collect()),
        );
        builder
            .add(LayerDesc::convolution(
                3,
                3,
                3,
                TestAccessor::Constant(1.),
                Some(TestAccessor::Constant(0.5)),
                PadStrideInfo::with_padding(2, 2, 0, 1, 0, 1),
            ))?
            .add(LayerDesc::SubGraph(tiny_block("block_1")))?
            .add(LayerDesc::Pooling(PoolingType::Avg))?
            .add(LayerDesc::Reshape(vec![3]))?
            .add(LayerDesc::Softmax)?;
        assert_eq!(builder.output_shape(), &[3]);

        let mut graph = builder.finish(TestAccessor::Sink(Vec::new()));
        assert_eq!(graph.input_shape(), &[2, 1, 4, 4]);
        assert_eq!(graph.output_shape(), &[2, 3]);
        assert_eq!(graph.num_layers(), 7);

        assert_eq!(graph.run()?, 1);

        match graph.output_accessor() {
            TestAccessor::Sink(outputs) => {
                assert_eq!(outputs.len(), 1);
                assert_eq!(outputs[0].shape(), &[2, 3]);
                // All filters are identical, so every class gets the same probability
                for p in outputs[0].iter() {
                    assert!((p - 1. / 3.).abs() < 1e-6);
                }
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    #[test]
    fn test_run_without_data() {
        let mut builder = GraphBuilder::new(&[2], 1, TestAccessor::Queue(VecDeque::new()));
        builder.add(LayerDesc::Softmax).unwrap();
        let mut graph = builder.finish(TestAccessor::Broken);

        // The output accessor is never reached
        assert_eq!(graph.run().unwrap(), 0);
    }

    #[test]
    fn test_output_failure_is_propagated() {
        let mut builder = GraphBuilder::new(&[2], 1, TestAccessor::Constant(1.));
        builder.add(LayerDesc::Softmax).unwrap();
        let mut graph = builder.finish(TestAccessor::Broken);

        assert!(matches!(graph.run(), Err(GraphError::OutputAccessError(_))));
    }

    #[test]
    fn test_weight_failure_names_the_layer() {
        let mut builder = GraphBuilder::new(&[2, 8, 8], 1, TestAccessor::Constant(0.));
        let block = SubGraph::new("Conv2d_7").then(LayerDesc::depthwise_convolution(
            3,
            3,
            TestAccessor::Broken,
            None,
            PadStrideInfo::new(1, 1, 1, 1),
        ));

        match builder.add(LayerDesc::SubGraph(block)) {
            Err(GraphError::WeightAccessError { layer, tensor, .. }) => {
                assert_eq!(layer, "Conv2d_7/DepthwiseConvolution");
                assert_eq!(tensor, "weights");
            }
            _ => panic!("expected a weight access error"),
        }
    }

    #[test]
    fn test_shape_errors() {
        let mut builder = GraphBuilder::new(&[2, 2, 2], 1, TestAccessor::Constant(0.));
        assert!(matches!(
            builder.add(LayerDesc::convolution(
                5,
                5,
                4,
                TestAccessor::Constant(1.),
                None,
                PadStrideInfo::new(1, 1, 0, 0),
            )),
            Err(GraphError::InvalidLayerError { .. })
        ));
        assert!(matches!(
            builder.add(LayerDesc::Reshape(vec![7])),
            Err(GraphError::InvalidLayerError { .. })
        ));

        builder.add(LayerDesc::Reshape(vec![8])).unwrap();
        assert!(matches!(
            builder.add(LayerDesc::Pooling(PoolingType::Avg)),
            Err(GraphError::InvalidLayerError { .. })
        ));
    }
}
