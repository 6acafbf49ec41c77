//! MobileNet v1 batch inference benchmark.
//!
//! A run builds the classifier with [`network::assemble_mobilenet`], feeds it every batch file
//! listed in a [`Session`] and writes the class probabilities of every image to its own text
//! file. Setup and inference are timed separately, per-batch timings are kept in the session.
pub mod accessors;
pub mod config;
pub mod errors;
pub mod network;
pub mod preprocess;
pub mod report;
pub mod session;
pub mod timing;
pub mod weights;

pub use config::RunConfig;
pub use errors::{MobilenetError, MobilenetResult};
pub use report::BenchmarkReport;
pub use session::{Session, SharedSession};

use accessors::Accessor;
use log::{info, warn};
use ml::weight_loader::shapes_compatible;
use std::{fs, path::Path};
use timing::{Timers, RUN_TIMER, SETUP_TIMER};
use weights::WeightResolver;

/// Classifies every batch of `session` and returns timings and bookkeeping of the run.
pub fn run_mobilenet(config: &RunConfig, session: Session) -> MobilenetResult<BenchmarkReport> {
    config.validate()?;
    if session.batch_size() != config.batch_size {
        return Err(MobilenetError::ConfigError(format!(
            "the session holds batches of {} images, but the network expects {}",
            session.batch_size(),
            config.batch_size
        )));
    }
    if config.keep_results {
        fs::create_dir_all(&config.result_dir).map_err(|source| {
            MobilenetError::DirectoryError {
                path: config.result_dir.clone(),
                source,
            }
        })?;
    } else {
        preprocess::recreate_dir(&config.result_dir)?;
    }

    let session = session.into_shared();
    let mut timers = Timers::new();
    let mut resolver = WeightResolver::new(&config.weights_dir);

    info!("Prepare graph...");
    let mut graph = timers.time(SETUP_TIMER, || {
        network::assemble_mobilenet(config, &mut resolver, &session)
    })?;

    info!("Run graph...");
    let processed_batches = timers.time(RUN_TIMER, || graph.run())?;
    info!("Processed {} batches", processed_batches);

    let statistics = session.borrow().statistics();
    Ok(BenchmarkReport {
        timers: timers.records().to_vec(),
        statistics,
        processed_batches,
        missing_weights: resolver
            .missing()
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    })
}

/// Outcome of [`check_weights`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightCheck {
    pub present: usize,
    pub missing: Vec<String>,
    /// Files that exist but cannot be read or have the wrong shape
    pub invalid: Vec<String>,
}

/// Checks every weight file a network with the given width multiplier reads.
pub fn check_weights(weights_dir: &Path, multiplier: f32) -> MobilenetResult<WeightCheck> {
    config::validate_multiplier(multiplier)?;
    let mut resolver = WeightResolver::new(weights_dir);
    let mut check = WeightCheck::default();

    for weight in network::required_weights(multiplier) {
        match resolver.resolve(&weight.file) {
            Accessor::NumpyFile(loader) => match loader.load() {
                Ok(values) if shapes_compatible(&weight.shape, values.shape()) => {
                    check.present += 1
                }
                Ok(values) => {
                    warn!(
                        "{}: expected shape {:?}, found {:?}",
                        weight.file,
                        weight.shape,
                        values.shape()
                    );
                    check.invalid.push(weight.file);
                }
                Err(e) => {
                    warn!("{}", e);
                    check.invalid.push(weight.file);
                }
            },
            _ => check.missing.push(weight.file),
        }
    }

    info!(
        "{} weight files present, {} missing, {} invalid",
        check.present,
        check.missing.len(),
        check.invalid.len()
    );
    Ok(check)
}
