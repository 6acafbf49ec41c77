//! Command line interface of the MobileNets benchmark: prepares batch files from images, runs
//! the classifier over them and checks weight directories.

use env_logger::Builder;
use ml::convolutions::ConvolutionMethodHint;
use mobilenets::{
    check_weights,
    preprocess::{prepare_batches, ImageSource, PrepareConfig},
    run_mobilenet, MobilenetError, RunConfig, Session,
};
use quicli::prelude::*;
use std::path::PathBuf;
use structopt::StructOpt;

/// Classifies prepared batches with MobileNet v1
#[derive(Debug, StructOpt)]
struct RunOpts {
    /// Directory with one .npy file per weight tensor. Missing files are replaced by zeros.
    #[structopt(long = "weights", parse(from_os_str))]
    weights: PathBuf,
    /// Directory that receives one <image>.txt per classified image, emptied before the run
    #[structopt(long = "results", parse(from_os_str))]
    results: PathBuf,
    /// Keeps result files of earlier runs in the result directory
    #[structopt(long = "keep-results")]
    keep_results: bool,
    /// File listing one batch file per line
    #[structopt(long = "batch-list", parse(from_os_str))]
    batch_list: PathBuf,
    /// File listing one image per line. Without it, images are named after their batch files.
    #[structopt(long = "image-list", parse(from_os_str))]
    image_list: Option<PathBuf>,
    /// Width multiplier of the network
    #[structopt(long = "multiplier", default_value = "1.0")]
    multiplier: f32,
    /// Input resolution
    #[structopt(long = "image-size", default_value = "224")]
    image_size: usize,
    #[structopt(long = "batch-size", default_value = "1")]
    batch_size: usize,
    /// Either gemm or direct
    #[structopt(long = "convolution-method", default_value = "gemm")]
    convolution_method: ConvolutionMethodHint,
    /// Writes timings and statistics of the run as JSON
    #[structopt(long = "report", parse(from_os_str))]
    report: Option<PathBuf>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Converts images into batch files
#[derive(Debug, StructOpt)]
struct PrepareOpts {
    /// Directory with .jpg/.jpeg images
    #[structopt(long = "images", parse(from_os_str), required_unless = "image_file")]
    images: Option<PathBuf>,
    /// A single image, overrides --images
    #[structopt(long = "image-file", parse(from_os_str))]
    image_file: Option<PathBuf>,
    /// Output directory for the batch files, recreated on every run unless --reuse is given
    #[structopt(long = "batches", parse(from_os_str))]
    batches: PathBuf,
    /// Keeps the batches of an earlier preparation if the batch directory exists
    #[structopt(long = "reuse")]
    reuse: bool,
    #[structopt(long = "image-list", parse(from_os_str))]
    image_list: PathBuf,
    #[structopt(long = "batch-list", parse(from_os_str))]
    batch_list: PathBuf,
    #[structopt(long = "image-size", default_value = "224")]
    image_size: usize,
    #[structopt(long = "batch-size", default_value = "1")]
    batch_size: usize,
    #[structopt(long = "batch-count", default_value = "1")]
    batch_count: usize,
    /// Number of images to skip, in file name order
    #[structopt(long = "skip", default_value = "0")]
    skip: usize,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Lists which weight files are present
#[derive(Debug, StructOpt)]
struct CheckWeightsOpts {
    #[structopt(long = "weights", parse(from_os_str))]
    weights: PathBuf,
    #[structopt(long = "multiplier", default_value = "1.0")]
    multiplier: f32,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Batch image classification benchmark with MobileNet v1.
#[derive(Debug, StructOpt)]
#[structopt(name = "MobileNets")]
enum Mobilenets {
    #[structopt(name = "run", about = "Classifies all batches of a batch list.")]
    Run(RunOpts),
    #[structopt(
        name = "prepare",
        about = "Crops and resizes images and writes them as .npy batch files \
        together with the image and batch lists."
    )]
    Prepare(PrepareOpts),
    #[structopt(
        name = "check-weights",
        about = "Checks that every weight file of the network exists and has the right shape."
    )]
    CheckWeights(CheckWeightsOpts),
}

/// Trait for the subcommands of the benchmark
trait MobilenetsOpts {
    /// Performs the subcommand
    fn run(&self) -> CliResult;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

impl MobilenetsOpts for RunOpts {
    fn run(&self) -> CliResult {
        let mut config = RunConfig::new(&self.weights, &self.results);
        config.keep_results = self.keep_results;
        config.width_multiplier = self.multiplier;
        config.image_size = self.image_size;
        config.batch_size = self.batch_size;
        config.convolution_method = self.convolution_method;

        let session =
            Session::from_list_files(self.image_list.as_deref(), &self.batch_list, self.batch_size)?;
        let report = run_mobilenet(&config, session)?;

        for timer in &report.timers {
            println!("{}: {:.6} s", timer.name, timer.seconds);
        }
        println!(
            "Average prediction time: {:.6} s",
            report.statistics.avg_prediction_time
        );
        if !report.missing_weights.is_empty() {
            println!(
                "{} weight files were missing and replaced by zeros",
                report.missing_weights.len()
            );
        }
        if let Some(path) = &self.report {
            report.write(path)?;
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl MobilenetsOpts for PrepareOpts {
    fn run(&self) -> CliResult {
        let source = match (&self.image_file, &self.images) {
            (Some(file), _) => ImageSource::File(file.clone()),
            (None, Some(dir)) => ImageSource::Directory(dir.clone()),
            (None, None) => {
                return Err(MobilenetError::ConfigError(
                    "either --images or --image-file is required".to_string(),
                )
                .into())
            }
        };
        let prepared = prepare_batches(&PrepareConfig {
            source,
            batches_dir: self.batches.clone(),
            image_list: self.image_list.clone(),
            batch_list: self.batch_list.clone(),
            image_size: self.image_size,
            batch_size: self.batch_size,
            batch_count: self.batch_count,
            skip_images: self.skip,
            reuse_existing: self.reuse,
        })?;
        println!(
            "Prepared {} images in {} batches",
            prepared.images.len(),
            prepared.batch_files.len()
        );
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl MobilenetsOpts for CheckWeightsOpts {
    fn run(&self) -> CliResult {
        let check = check_weights(&self.weights, self.multiplier)?;
        for file in &check.missing {
            println!("missing: {}", file);
        }
        for file in &check.invalid {
            println!("invalid: {}", file);
        }
        println!(
            "{} present, {} missing, {} invalid",
            check.present,
            check.missing.len(),
            check.invalid.len()
        );
        if !check.invalid.is_empty() {
            return Err(MobilenetError::ConfigError(format!(
                "{} weight files cannot be used",
                check.invalid.len()
            ))
            .into());
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl MobilenetsOpts for Mobilenets {
    fn run(&self) -> CliResult {
        match self {
            Mobilenets::Run(c) => c.run(),
            Mobilenets::Prepare(c) => c.run(),
            Mobilenets::CheckWeights(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            Mobilenets::Run(c) => c.get_verbosity(),
            Mobilenets::Prepare(c) => c.get_verbosity(),
            Mobilenets::CheckWeights(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = Mobilenets::from_args();
    args.setup_env_logger()?;
    args.run()
}
