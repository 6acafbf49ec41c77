use ml::GraphError;
use ndarray::ShapeError;
use ndarray_npy::WriteNpyError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MobilenetError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Could not read list file {}: {source}", .path.display())]
    ListFileError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Inconsistent manifest: {0}")]
    ManifestError(String),
    #[error("Could not prepare directory {}: {source}", .path.display())]
    DirectoryError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not write {}: {source}", .path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not decode image {}: {source}", .path.display())]
    ImageError {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Could not write batch file {}: {source}", .path.display())]
    BatchWriteError {
        path: PathBuf,
        #[source]
        source: WriteNpyError,
    },
    #[error("Could not serialize the benchmark report: {0}")]
    ReportError(#[from] serde_json::Error),
    #[error("Could not assemble a batch:\n {0}.")]
    BatchShapeError(#[from] ShapeError),
    #[error(transparent)]
    GraphError(#[from] GraphError),
}

pub type MobilenetResult<T> = std::result::Result<T, MobilenetError>;
