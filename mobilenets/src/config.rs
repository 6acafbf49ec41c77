use crate::errors::{MobilenetError, MobilenetResult};
use ml::convolutions::ConvolutionMethodHint;
use std::path::PathBuf;

/// Everything a benchmark run needs besides the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Directory holding one `.npy` file per parameter tensor
    pub weights_dir: PathBuf,
    /// Directory that receives one `<image>.txt` per classified image. Emptied before a run
    /// unless `keep_results` is set.
    pub result_dir: PathBuf,
    pub keep_results: bool,
    /// Scales the channel count of every layer except the classifier
    pub width_multiplier: f32,
    /// Input images are `image_size` x `image_size` pixels
    pub image_size: usize,
    pub batch_size: usize,
    pub convolution_method: ConvolutionMethodHint,
}

impl RunConfig {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(weights_dir: P, result_dir: Q) -> RunConfig {
        RunConfig {
            weights_dir: weights_dir.into(),
            result_dir: result_dir.into(),
            keep_results: false,
            width_multiplier: 1.0,
            image_size: 224,
            batch_size: 1,
            convolution_method: ConvolutionMethodHint::default(),
        }
    }

    pub fn validate(&self) -> MobilenetResult<()> {
        validate_multiplier(self.width_multiplier)?;
        if self.image_size == 0 {
            return Err(MobilenetError::ConfigError(
                "image size must not be 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MobilenetError::ConfigError(
                "batch size must not be 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn validate_multiplier(multiplier: f32) -> MobilenetResult<()> {
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return Err(MobilenetError::ConfigError(format!(
            "width multiplier must be a positive number, got {}",
            multiplier
        )));
    }
    Ok(())
}
