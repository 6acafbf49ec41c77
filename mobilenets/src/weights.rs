use crate::accessors::Accessor;
use log::warn;
use ml::weight_loader::NumpyBinLoader;
use std::path::{Path, PathBuf};

/// Maps weight file names to accessors. Missing files are replaced by zero-filled tensors so
/// that a network can still be built and run with an incomplete set of weights.
#[derive(Debug)]
pub struct WeightResolver {
    weights_dir: PathBuf,
    missing: Vec<PathBuf>,
}

impl WeightResolver {
    pub fn new<P: AsRef<Path>>(weights_dir: P) -> WeightResolver {
        WeightResolver {
            weights_dir: weights_dir.as_ref().to_path_buf(),
            missing: Vec::new(),
        }
    }

    pub fn resolve(&mut self, file: &str) -> Accessor {
        let full_path = self.weights_dir.join(file);
        if full_path.is_file() {
            Accessor::NumpyFile(NumpyBinLoader::new(full_path))
        } else {
            warn!(
                "File not found: {}, dummy accessor will be used!",
                full_path.display()
            );
            self.missing.push(full_path);
            Accessor::Zeros
        }
    }

    /// Every path that was requested but did not exist, in request order.
    pub fn missing(&self) -> &[PathBuf] {
        &self.missing
    }
}
