use crate::{Tensor, WeightPrecision};
use ndarray::ArrayD;
use ndarray_npy::{read_npy, ReadNpyError};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type LoadResult<T> = Result<T, LoadError>;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("File {} is not a readable numpy array. Reader reported error\n {source}.", .path.display())]
    NpyError {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },
    #[error("Wrong shape in {}: expected {expected:?}, found {found:?}.", .path.display())]
    ShapeError {
        path: PathBuf,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Loads a single `.npy` file of 32 bit floats. One loader is bound to exactly one file,
/// so every parameter tensor of a network gets its own loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumpyBinLoader {
    path: PathBuf,
}

impl NumpyBinLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> NumpyBinLoader {
        NumpyBinLoader {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole array with the shape stored in the file.
    pub fn load(&self) -> LoadResult<ArrayD<WeightPrecision>> {
        read_npy(&self.path).map_err(|source| LoadError::NpyError {
            path: self.path.clone(),
            source,
        })
    }

    /// Reads the file into an already allocated tensor. The tensor's shape is authoritative,
    /// see [`assign_compatible`] for which file shapes are accepted.
    pub fn fill(&self, tensor: &mut Tensor) -> LoadResult<()> {
        let values = self.load()?;
        assign_compatible(tensor, &values, &self.path)
    }
}

/// Returns true if both shapes describe the same data once axes of length 1 are dropped,
/// e.g. a (32, 3, 3) depthwise kernel stored as (32, 1, 3, 3).
pub fn shapes_compatible(expected: &[usize], found: &[usize]) -> bool {
    expected
        .iter()
        .filter(|&&d| d != 1)
        .eq(found.iter().filter(|&&d| d != 1))
}

/// Copies `values` into `tensor` element by element in logical order.
/// `path` is only used for error reporting.
pub fn assign_compatible(
    tensor: &mut Tensor,
    values: &ArrayD<WeightPrecision>,
    path: &Path,
) -> LoadResult<()> {
    if !shapes_compatible(tensor.shape(), values.shape()) {
        return Err(LoadError::ShapeError {
            path: path.to_path_buf(),
            expected: tensor.shape().to_vec(),
            found: values.shape().to_vec(),
        });
    }
    tensor
        .iter_mut()
        .zip(values.iter())
        .for_each(|(dst, src)| *dst = *src);
    Ok(())
}
