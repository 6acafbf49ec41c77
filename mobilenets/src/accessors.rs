//! The tensor accessors used by the MobileNets graph.
use crate::session::SharedSession;
use log::info;
use ml::{
    accessor::{AccessorError, AccessorResult, TensorAccessor},
    weight_loader::{assign_compatible, LoadError, NumpyBinLoader},
    Tensor,
};
use ndarray::{ArrayD, Axis};
use ndarray_npy::read_npy;
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

/// Every tensor of the network is bound to one of these when the graph is assembled.
pub enum Accessor {
    /// Parameter tensor read from a `.npy` file
    NumpyFile(NumpyBinLoader),
    /// Parameter tensor without a file, filled with zeros
    Zeros,
    /// Graph input
    BatchFeeder(BatchFeeder),
    /// Graph output
    ResultWriter(ResultWriter),
}

impl TensorAccessor for Accessor {
    fn access_tensor(&mut self, tensor: &mut Tensor) -> AccessorResult<bool> {
        match self {
            Accessor::NumpyFile(loader) => {
                loader.fill(tensor)?;
                Ok(true)
            }
            Accessor::Zeros => {
                tensor.fill(0.0);
                Ok(true)
            }
            Accessor::BatchFeeder(feeder) => feeder.feed(tensor),
            Accessor::ResultWriter(writer) => writer.write(tensor).map(|_| true),
        }
    }
}

/// Reads a batch file into the graph input. Files of 32 bit floats are used as they are,
/// 8 bit files (as written by `prepare`) are scaled from [0, 255] to [-1, 1].
pub fn load_batch(path: &Path, tensor: &mut Tensor) -> AccessorResult<()> {
    let values: ArrayD<f32> = match read_npy::<_, ArrayD<f32>>(path) {
        Ok(values) => values,
        Err(float_error) => match read_npy::<_, ArrayD<u8>>(path) {
            Ok(pixels) => pixels.mapv(|p| p as f32 / 255.0 * 2.0 - 1.0),
            Err(_) => {
                return Err(LoadError::NpyError {
                    path: path.to_path_buf(),
                    source: float_error,
                }
                .into())
            }
        },
    };
    assign_compatible(tensor, &values, path)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederState {
    Ready,
    Exhausted,
}

/// Feeds the graph one batch file of the session at a time.
pub struct BatchFeeder {
    session: SharedSession,
    state: FeederState,
}

impl BatchFeeder {
    pub fn new(session: SharedSession) -> BatchFeeder {
        BatchFeeder {
            session,
            state: FeederState::Ready,
        }
    }

    pub fn state(&self) -> FeederState {
        self.state
    }

    /// Loads the next batch into `tensor`. Returns false once the session has no batches left.
    pub fn feed(&mut self, tensor: &mut Tensor) -> AccessorResult<bool> {
        if self.state == FeederState::Exhausted {
            return Ok(false);
        }
        let mut session = self.session.borrow_mut();
        let batch_file = match session.next_batch_file() {
            Some(file) => file,
            None => {
                self.state = FeederState::Exhausted;
                return Ok(false);
            }
        };

        info!(
            "Batch {} of {}",
            session.batch_index().map_or(0, |i| i + 1),
            session.batch_count()
        );
        info!("File: {}", batch_file.display());

        session.measure_begin();
        load_batch(&batch_file, tensor)?;
        let t = session.measure_end_load_images();
        info!("Loaded in {:.6} s", t.as_secs_f64());

        // Classification starts right after loading
        session.measure_begin();
        Ok(true)
    }
}

pub fn result_file_path(result_dir: &Path, image: &str) -> PathBuf {
    result_dir.join(format!("{}.txt", image))
}

fn write_probes(path: &Path, probes: &[f32]) -> io::Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    // The first score is the 'background' class, which has no ImageNet label
    for p in probes.iter().skip(1) {
        writeln!(f, "{}", p)?;
    }
    f.flush()
}

/// Writes the class probabilities of every image in a batch to `<result_dir>/<image>.txt`.
pub struct ResultWriter {
    session: SharedSession,
    result_dir: PathBuf,
}

impl ResultWriter {
    pub fn new<P: Into<PathBuf>>(session: SharedSession, result_dir: P) -> ResultWriter {
        ResultWriter {
            session,
            result_dir: result_dir.into(),
        }
    }

    pub fn write(&mut self, tensor: &Tensor) -> AccessorResult<()> {
        let mut session = self.session.borrow_mut();
        let t = session.measure_end_prediction();
        info!("Classified in {:.6} s", t.as_secs_f64());

        let images = session.current_images();
        if images.len() != tensor.len_of(Axis(0)) {
            return Err(AccessorError::Other(format!(
                "got results for {} images, but the current batch holds {}",
                tensor.len_of(Axis(0)),
                images.len()
            )));
        }

        for (image, probes) in images.iter().zip(tensor.outer_iter()) {
            let path = result_file_path(&self.result_dir, image);
            let probes: Vec<f32> = probes.iter().copied().collect();
            write_probes(&path, &probes).map_err(|source| AccessorError::Io { path, source })?;
        }
        Ok(())
    }
}
