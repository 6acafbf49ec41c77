use crate::{ImagePrecision, InternalDataRepresentation, WeightPrecision};
use ndarray::*;
use std::{fmt, str::FromStr};

/// Stride and (possibly asymmetric) zero padding of a convolution.
/// Output sizes are always rounded down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadStrideInfo {
    pub stride_x: usize,
    pub stride_y: usize,
    pub pad_left: usize,
    pub pad_right: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
}

impl PadStrideInfo {
    /// Same padding on both sides of each axis.
    pub fn new(stride_x: usize, stride_y: usize, pad_x: usize, pad_y: usize) -> PadStrideInfo {
        PadStrideInfo::with_padding(stride_x, stride_y, pad_x, pad_x, pad_y, pad_y)
    }

    pub fn with_padding(
        stride_x: usize,
        stride_y: usize,
        pad_left: usize,
        pad_right: usize,
        pad_top: usize,
        pad_bottom: usize,
    ) -> PadStrideInfo {
        debug_assert!(stride_x > 0 && stride_y > 0, "Stride of 0 passed");
        PadStrideInfo {
            stride_x,
            stride_y,
            pad_left,
            pad_right,
            pad_top,
            pad_bottom,
        }
    }

    /// Output (height, width) of a convolution with the given kernel.
    /// Returns None if the kernel does not fit into the padded input.
    pub fn scaled_dimensions(
        &self,
        height: usize,
        width: usize,
        kernel_height: usize,
        kernel_width: usize,
    ) -> Option<(usize, usize)> {
        let padded_height = height + self.pad_top + self.pad_bottom;
        let padded_width = width + self.pad_left + self.pad_right;
        if padded_height < kernel_height || padded_width < kernel_width {
            return None;
        }
        Some((
            (padded_height - kernel_height) / self.stride_y + 1,
            (padded_width - kernel_width) / self.stride_x + 1,
        ))
    }

    fn has_padding(&self) -> bool {
        self.pad_left + self.pad_right + self.pad_top + self.pad_bottom > 0
    }
}

/// Selects how standard convolutions are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolutionMethodHint {
    /// im2col followed by a matrix product
    Gemm,
    /// One dot product per output element
    Direct,
}

impl Default for ConvolutionMethodHint {
    fn default() -> Self {
        ConvolutionMethodHint::Gemm
    }
}

impl FromStr for ConvolutionMethodHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gemm" => Ok(ConvolutionMethodHint::Gemm),
            "direct" => Ok(ConvolutionMethodHint::Direct),
            other => Err(format!(
                "Unknown convolution method {}, expected gemm or direct",
                other
            )),
        }
    }
}

impl fmt::Display for ConvolutionMethodHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvolutionMethodHint::Gemm => write!(f, "gemm"),
            ConvolutionMethodHint::Direct => write!(f, "direct"),
        }
    }
}

/// Returns a copy of the image surrounded by the zero padding described in `info`.
fn pad_image(image: &ArrayView3<ImagePrecision>, info: &PadStrideInfo) -> Array3<ImagePrecision> {
    if !info.has_padding() {
        return image.to_owned();
    }
    let (channels, height, width) = image.dim();
    let mut padded = Array3::zeros((
        channels,
        height + info.pad_top + info.pad_bottom,
        width + info.pad_left + info.pad_right,
    ));
    padded
        .slice_mut(s![
            ..,
            info.pad_top..info.pad_top + height,
            info.pad_left..info.pad_left + width
        ])
        .assign(image);
    padded
}

fn add_bias(output: &mut Array3<ImagePrecision>, bias: &Option<Array1<WeightPrecision>>) {
    if let Some(bias) = bias {
        for (mut channel, &b) in output.outer_iter_mut().zip(bias.iter()) {
            channel.mapv_inplace(|x| x + b);
        }
    }
}

/// Rust implementation of a convolutional layer.
/// The weight matrix shall have dimension (in that order)
/// output channels x input channels x kernel height x kernel width.
pub struct ConvolutionLayer {
    /// Weight matrix of the kernel
    kernel: Array4<WeightPrecision>,
    /// Kernel flattened to (output channels, input channels * kernel height * kernel width)
    filters: Array2<WeightPrecision>,
    bias: Option<Array1<WeightPrecision>>,
    kernel_height: usize,
    kernel_width: usize,
    num_input_channels: usize,
    num_output_channels: usize,
    pad_stride: PadStrideInfo,
    method: ConvolutionMethodHint,
}

impl ConvolutionLayer {
    pub fn new(
        weights: Array4<WeightPrecision>,
        bias: Option<Array1<WeightPrecision>>,
        pad_stride: PadStrideInfo,
        method: ConvolutionMethodHint,
    ) -> ConvolutionLayer {
        let (num_output_channels, num_input_channels, kernel_height, kernel_width) = weights.dim();
        let window = kernel_height * kernel_width;
        let filters = Array2::from_shape_fn(
            (num_output_channels, num_input_channels * window),
            |(o, p)| weights[[o, p / window, (p % window) / kernel_width, p % kernel_width]],
        );
        debug_assert!(bias
            .as_ref()
            .map_or(true, |b| b.len() == num_output_channels));

        ConvolutionLayer {
            kernel: weights,
            filters,
            bias,
            kernel_height,
            kernel_width,
            num_input_channels,
            num_output_channels,
            pad_stride,
            method,
        }
    }

    pub fn num_output_channels(&self) -> usize {
        self.num_output_channels
    }

    /// Output (channels, height, width) for an input of the given height and width.
    pub fn output_dim(&self, height: usize, width: usize) -> Option<(usize, usize, usize)> {
        self.pad_stride
            .scaled_dimensions(height, width, self.kernel_height, self.kernel_width)
            .map(|(h, w)| (self.num_output_channels, h, w))
    }

    /// Performs a convolution on the given image data using this layers parameters.
    /// The image is expected in (channels, height, width) layout.
    pub fn convolve(&self, image: &ArrayView3<ImagePrecision>) -> InternalDataRepresentation {
        debug_assert_eq!(image.len_of(Axis(0)), self.num_input_channels);
        let (_, height, width) = image.dim();
        let (_, new_height, new_width) = self.output_dim(height, width).unwrap_or((0, 0, 0));

        let padded = pad_image(image, &self.pad_stride);
        let mut output = match self.method {
            ConvolutionMethodHint::Gemm => self.conv_2d_gemm(&padded, new_height, new_width),
            ConvolutionMethodHint::Direct => self.conv_2d_direct(&padded, new_height, new_width),
        };
        add_bias(&mut output, &self.bias);
        output
    }

    /// Naive implementation, used as reference for the im2col version
    fn conv_2d_direct(
        &self,
        padded: &Array3<ImagePrecision>,
        new_height: usize,
        new_width: usize,
    ) -> Array3<ImagePrecision> {
        let (stride_y, stride_x) = (self.pad_stride.stride_y, self.pad_stride.stride_x);
        let mut output = Array3::zeros((self.num_output_channels, new_height, new_width));
        for ((o, i, j), value) in output.indexed_iter_mut() {
            let y = i * stride_y;
            let x = j * stride_x;
            let patch = padded.slice(s![.., y..y + self.kernel_height, x..x + self.kernel_width]);
            *value = (&patch * &self.kernel.index_axis(Axis(0), o)).sum();
        }
        output
    }

    /// Every receptive field becomes one row of a matrix (im2col), the convolution is then a
    /// single matrix product with the flattened filters.
    /// https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
    fn conv_2d_gemm(
        &self,
        padded: &Array3<ImagePrecision>,
        new_height: usize,
        new_width: usize,
    ) -> Array3<ImagePrecision> {
        let (stride_y, stride_x) = (self.pad_stride.stride_y, self.pad_stride.stride_x);
        let mut im_col: Array2<ImagePrecision> =
            Array::zeros((new_height * new_width, self.filters.len_of(Axis(1))));
        for i in 0..new_height {
            let y = i * stride_y;
            for j in 0..new_width {
                let x = j * stride_x;
                let patch =
                    padded.slice(s![.., y..y + self.kernel_height, x..x + self.kernel_width]);
                im_col
                    .row_mut(i * new_width + j)
                    .iter_mut()
                    .zip(patch.iter())
                    .for_each(|(dst, src)| *dst = *src);
            }
        }

        // shape: (new_height * new_width, output channels)
        let mul = im_col.dot(&self.filters.t());

        let mut output = Array3::zeros((self.num_output_channels, new_height, new_width));
        for (pixel, values) in mul.outer_iter().enumerate() {
            output
                .slice_mut(s![.., pixel / new_width, pixel % new_width])
                .assign(&values);
        }
        output
    }
}

/// Convolution that filters every channel separately (groups == channels).
/// The kernel shall have dimension channels x kernel height x kernel width.
pub struct DepthwiseConvolutionLayer {
    kernel: Array3<WeightPrecision>,
    bias: Option<Array1<WeightPrecision>>,
    kernel_height: usize,
    kernel_width: usize,
    pad_stride: PadStrideInfo,
}

impl DepthwiseConvolutionLayer {
    pub fn new(
        weights: Array3<WeightPrecision>,
        bias: Option<Array1<WeightPrecision>>,
        pad_stride: PadStrideInfo,
    ) -> DepthwiseConvolutionLayer {
        let (_, kernel_height, kernel_width) = weights.dim();
        DepthwiseConvolutionLayer {
            kernel: weights,
            bias,
            kernel_height,
            kernel_width,
            pad_stride,
        }
    }

    pub fn output_dim(
        &self,
        channels: usize,
        height: usize,
        width: usize,
    ) -> Option<(usize, usize, usize)> {
        self.pad_stride
            .scaled_dimensions(height, width, self.kernel_height, self.kernel_width)
            .map(|(h, w)| (channels, h, w))
    }

    pub fn convolve(&self, image: &ArrayView3<ImagePrecision>) -> InternalDataRepresentation {
        debug_assert_eq!(image.len_of(Axis(0)), self.kernel.len_of(Axis(0)));
        let (channels, height, width) = image.dim();
        let (_, new_height, new_width) = self
            .output_dim(channels, height, width)
            .unwrap_or((channels, 0, 0));
        let (stride_y, stride_x) = (self.pad_stride.stride_y, self.pad_stride.stride_x);

        let padded = pad_image(image, &self.pad_stride);
        let mut output = Array3::zeros((channels, new_height, new_width));
        for ((c, i, j), value) in output.indexed_iter_mut() {
            let y = i * stride_y;
            let x = j * stride_x;
            let window = padded.slice(s![c, y..y + self.kernel_height, x..x + self.kernel_width]);
            *value = (&window * &self.kernel.index_axis(Axis(0), c)).sum();
        }
        add_bias(&mut output, &self.bias);
        output
    }
}
