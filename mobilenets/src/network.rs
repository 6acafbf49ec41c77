//! MobileNet v1 topology and the names of its weight files.
//!
//! The network is a 3x3 stem convolution followed by thirteen depthwise-separable blocks,
//! global average pooling and a 1x1 convolution to the 1001 ImageNet classes (class 0 is the
//! background class). Howard et al. 2017, <https://arxiv.org/abs/1704.04861>
use crate::{
    accessors::{Accessor, BatchFeeder, ResultWriter},
    config::RunConfig,
    errors::MobilenetResult,
    session::SharedSession,
    weights::WeightResolver,
};
use log::info;
use ml::{
    activation_functions::ActivationFunction, convolutions::PadStrideInfo, pooling::PoolingType,
    Graph, GraphBuilder, LayerDesc, SubGraph,
};

pub const NUM_CLASSES: usize = 1001;
pub const INPUT_CHANNELS: usize = 3;
pub const STEM_CHANNELS: usize = 32;
pub const BATCH_NORM_EPSILON: f32 = 1e-3;

const RELU6: ActivationFunction = ActivationFunction::BoundedRelu(6.0);
const STEM_SCOPE: &str = "Conv2d_0";
const LOGITS_SCOPE: &str = "Logits_Conv2d_1c_1x1";
const BATCH_NORM_PARAMETERS: [&str; 4] = ["moving_mean", "moving_variance", "gamma", "beta"];

/// (output channels, stride) of the blocks `Conv2d_1` to `Conv2d_13`
pub const MOBILENET_V1_BLOCKS: [(usize, usize); 13] = [
    (64, 1),
    (128, 2),
    (128, 1),
    (256, 2),
    (256, 1),
    (512, 2),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (1024, 2),
    (1024, 1),
];

/// Channel count after applying the width multiplier, never less than one channel.
pub fn apply_multiplier(channels: usize, multiplier: f32) -> usize {
    ((channels as f32 * multiplier).round() as usize).max(1)
}

/// One depthwise-separable block with its channel counts already scaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDescriptor {
    /// Prefix of every weight file of the block, e.g. `Conv2d_3`
    pub name: String,
    pub input_channels: usize,
    pub output_channels: usize,
    pub stride: usize,
}

impl BlockDescriptor {
    pub fn depthwise_pad_stride(&self) -> PadStrideInfo {
        if self.stride == 1 {
            PadStrideInfo::new(1, 1, 1, 1)
        } else {
            PadStrideInfo::with_padding(self.stride, self.stride, 0, 1, 0, 1)
        }
    }

    fn depthwise_scope(&self) -> String {
        format!("{}_depthwise", self.name)
    }

    fn pointwise_scope(&self) -> String {
        format!("{}_pointwise", self.name)
    }
}

/// The thirteen blocks of MobileNet v1 for the given width multiplier.
pub fn mobilenet_blocks(multiplier: f32) -> Vec<BlockDescriptor> {
    let mut input_channels = apply_multiplier(STEM_CHANNELS, multiplier);
    MOBILENET_V1_BLOCKS
        .iter()
        .enumerate()
        .map(|(i, &(channels, stride))| {
            let output_channels = apply_multiplier(channels, multiplier);
            let block = BlockDescriptor {
                name: format!("Conv2d_{}", i + 1),
                input_channels,
                output_channels,
                stride,
            };
            input_channels = output_channels;
            block
        })
        .collect()
}

fn weights_file(scope: &str) -> String {
    format!("{}_weights.npy", scope)
}

fn biases_file(scope: &str) -> String {
    format!("{}_biases.npy", scope)
}

fn batch_norm_files(scope: &str) -> Vec<String> {
    BATCH_NORM_PARAMETERS
        .iter()
        .map(|p| format!("{}_BatchNorm_{}.npy", scope, p))
        .collect()
}

fn batch_norm(resolver: &mut WeightResolver, scope: &str) -> LayerDesc<Accessor> {
    let files = batch_norm_files(scope);
    let mut resolve = |i: usize| resolver.resolve(&files[i]);
    LayerDesc::batch_normalization(
        resolve(0),
        resolve(1),
        resolve(2),
        resolve(3),
        BATCH_NORM_EPSILON,
    )
}

/// Depthwise 3x3 convolution, batch norm, ReLU6, pointwise 1x1 convolution, batch norm, ReLU6.
pub fn depthwise_separable_block(
    resolver: &mut WeightResolver,
    block: &BlockDescriptor,
) -> SubGraph<Accessor> {
    let depthwise = block.depthwise_scope();
    let pointwise = block.pointwise_scope();
    SubGraph::new(block.name.clone())
        .then(LayerDesc::depthwise_convolution(
            3,
            3,
            resolver.resolve(&weights_file(&format!("{}_depthwise", depthwise))),
            None,
            block.depthwise_pad_stride(),
        ))
        .then(batch_norm(resolver, &depthwise))
        .then(LayerDesc::Activation(RELU6))
        .then(LayerDesc::convolution(
            1,
            1,
            block.output_channels,
            resolver.resolve(&weights_file(&pointwise)),
            None,
            PadStrideInfo::new(1, 1, 0, 0),
        ))
        .then(batch_norm(resolver, &pointwise))
        .then(LayerDesc::Activation(RELU6))
}

/// Builds the complete classifier. The graph pulls its batches from `session` and writes
/// one result file per image to the configured result directory.
pub fn assemble_mobilenet(
    config: &RunConfig,
    resolver: &mut WeightResolver,
    session: &SharedSession,
) -> MobilenetResult<Graph<Accessor>> {
    let multiplier = config.width_multiplier;
    let mut builder = GraphBuilder::new(
        &[INPUT_CHANNELS, config.image_size, config.image_size],
        config.batch_size,
        Accessor::BatchFeeder(BatchFeeder::new(session.clone())),
    );
    builder.convolution_method(config.convolution_method);

    builder
        .add(LayerDesc::convolution(
            3,
            3,
            apply_multiplier(STEM_CHANNELS, multiplier),
            resolver.resolve(&weights_file(STEM_SCOPE)),
            None,
            PadStrideInfo::with_padding(2, 2, 0, 1, 0, 1),
        ))?
        .add(batch_norm(resolver, STEM_SCOPE))?
        .add(LayerDesc::Activation(RELU6))?;

    for block in mobilenet_blocks(multiplier) {
        builder.add(LayerDesc::SubGraph(depthwise_separable_block(
            resolver, &block,
        )))?;
    }

    builder
        .add(LayerDesc::Pooling(PoolingType::Avg))?
        .add(LayerDesc::convolution(
            1,
            1,
            NUM_CLASSES,
            resolver.resolve(&weights_file(LOGITS_SCOPE)),
            Some(resolver.resolve(&biases_file(LOGITS_SCOPE))),
            PadStrideInfo::new(1, 1, 0, 0),
        ))?
        .add(LayerDesc::Reshape(vec![NUM_CLASSES]))?
        .add(LayerDesc::Softmax)?;

    let graph = builder.finish(Accessor::ResultWriter(ResultWriter::new(
        session.clone(),
        config.result_dir.clone(),
    )));
    info!(
        "MobileNet v1 {} with {} layers, input {:?}, output {:?}",
        multiplier,
        graph.num_layers(),
        graph.input_shape(),
        graph.output_shape()
    );
    Ok(graph)
}

/// A weight file the network reads, with the shape it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredWeight {
    pub file: String,
    pub shape: Vec<usize>,
}

impl RequiredWeight {
    fn new(file: String, shape: &[usize]) -> RequiredWeight {
        RequiredWeight {
            file,
            shape: shape.to_vec(),
        }
    }
}

fn batch_norm_weights(scope: &str, channels: usize) -> impl Iterator<Item = RequiredWeight> {
    batch_norm_files(scope)
        .into_iter()
        .map(move |file| RequiredWeight::new(file, &[channels]))
}

/// Every weight file of the network, in the order the graph requests them.
pub fn required_weights(multiplier: f32) -> Vec<RequiredWeight> {
    let stem_channels = apply_multiplier(STEM_CHANNELS, multiplier);
    let mut required = vec![RequiredWeight::new(
        weights_file(STEM_SCOPE),
        &[stem_channels, INPUT_CHANNELS, 3, 3],
    )];
    required.extend(batch_norm_weights(STEM_SCOPE, stem_channels));

    let mut last_channels = stem_channels;
    for block in mobilenet_blocks(multiplier) {
        let (depthwise, pointwise) = (block.depthwise_scope(), block.pointwise_scope());
        required.push(RequiredWeight::new(
            weights_file(&format!("{}_depthwise", depthwise)),
            &[block.input_channels, 3, 3],
        ));
        required.extend(batch_norm_weights(&depthwise, block.input_channels));
        required.push(RequiredWeight::new(
            weights_file(&pointwise),
            &[block.output_channels, block.input_channels, 1, 1],
        ));
        required.extend(batch_norm_weights(&pointwise, block.output_channels));
        last_channels = block.output_channels;
    }

    required.push(RequiredWeight::new(
        weights_file(LOGITS_SCOPE),
        &[NUM_CLASSES, last_channels, 1, 1],
    ));
    required.push(RequiredWeight::new(biases_file(LOGITS_SCOPE), &[NUM_CLASSES]));
    required
}
