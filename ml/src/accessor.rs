//! The contract through which a graph exchanges data with the outside world.
//!
//! Every parameter tensor, the graph input and the graph output are bound to an accessor.
//! Parameter accessors are called once while the graph is built, input and output
//! accessors once per executed batch.
use crate::{weight_loader::LoadError, Tensor};
use std::path::PathBuf;
use thiserror::Error;

pub type AccessorResult<T> = Result<T, AccessorError>;

#[derive(Error, Debug)]
pub enum AccessorError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Other(String),
}

pub trait TensorAccessor {
    /// Reads from or writes into the given tensor.
    ///
    /// Returns `Ok(false)` if the accessor has no more data to offer. For an input accessor
    /// this ends the execution of the graph; other accessors return `Ok(true)`.
    fn access_tensor(&mut self, tensor: &mut Tensor) -> AccessorResult<bool>;
}
