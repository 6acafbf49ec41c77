use image::{Rgb, RgbImage};
use ml::{convolutions::ConvolutionMethodHint, GraphError};
use mobilenets::{
    network::required_weights,
    preprocess::{prepare_batches, ImageSource, PrepareConfig},
    run_mobilenet, MobilenetError, RunConfig, Session,
};
use ndarray::{Array4, ArrayD, IxDyn};
use ndarray_npy::write_npy;
use std::{fs, path::Path};
use tempfile::tempdir;

const MULTIPLIER: f32 = 0.25;
const IMAGE_SIZE: usize = 32;

/// Writes every weight file except `skip`. Batch norms are identities, all other weights small
/// constants.
fn write_weights(dir: &Path, skip: Option<&str>) {
    for weight in required_weights(MULTIPLIER) {
        if Some(weight.file.as_str()) == skip {
            continue;
        }
        let value = if weight.file.ends_with("moving_variance.npy") || weight.file.ends_with("gamma.npy")
        {
            1.0
        } else if weight.file.contains("BatchNorm") {
            0.0
        } else {
            0.01
        };
        let weights = ArrayD::<f32>::from_elem(IxDyn(&weight.shape), value);
        write_npy(dir.join(&weight.file), &weights).unwrap();
    }
}

fn config(weights: &Path, results: &Path) -> RunConfig {
    let mut config = RunConfig::new(weights, results);
    config.width_multiplier = MULTIPLIER;
    config.image_size = IMAGE_SIZE;
    config
}

fn read_result(path: &Path) -> Vec<f32> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| l.parse().unwrap())
        .collect()
}

#[test]
fn test_single_batch_with_all_weights() {
    let weights = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_weights(weights.path(), None);

    let batch = work.path().join("img001.npy");
    write_npy(
        &batch,
        &Array4::<f32>::from_elem((1, 3, IMAGE_SIZE, IMAGE_SIZE), 0.5),
    )
    .unwrap();
    let results = work.path().join("results");

    let report = run_mobilenet(
        &config(weights.path(), &results),
        Session::from_batch_files(vec![&batch]).unwrap(),
    )
    .unwrap();

    let timers: Vec<_> = report.timers.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(timers, vec!["setup", "run"]);
    assert_eq!(report.processed_batches, 1);
    assert_eq!(report.statistics.loaded_batches, 1);
    assert_eq!(report.statistics.processed_batches, 1);
    assert!(report.statistics.total_load_images_time > 0.0);
    assert!(report.missing_weights.is_empty());

    let probes = read_result(&results.join("img001.npy.txt"));
    assert_eq!(probes.len(), 1000);
    assert!(probes.iter().all(|p| *p >= 0.0 && *p <= 1.0));
    assert!(probes.iter().sum::<f32>() < 1.0);
    assert_eq!(fs::read_dir(&results).unwrap().count(), 1);
}

#[test]
fn test_empty_manifest() {
    let weights = tempdir().unwrap();
    let work = tempdir().unwrap();
    let results = work.path().join("results");

    let report = run_mobilenet(
        &config(weights.path(), &results),
        Session::from_batch_files(Vec::<String>::new()).unwrap(),
    )
    .unwrap();

    assert_eq!(report.processed_batches, 0);
    assert_eq!(report.statistics.loaded_batches, 0);
    assert_eq!(report.timers.len(), 2);
    assert_eq!(report.missing_weights.len(), 137);
    assert_eq!(fs::read_dir(&results).unwrap().count(), 0);
}

#[test]
fn test_missing_weight_is_replaced() {
    let weights = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_weights(weights.path(), Some("Conv2d_5_pointwise_weights.npy"));

    let batch = work.path().join("img001.npy");
    write_npy(
        &batch,
        &Array4::<f32>::zeros((1, 3, IMAGE_SIZE, IMAGE_SIZE)),
    )
    .unwrap();
    let results = work.path().join("results");

    let report = run_mobilenet(
        &config(weights.path(), &results),
        Session::from_batch_files(vec![&batch]).unwrap(),
    )
    .unwrap();

    assert_eq!(
        report.missing_weights,
        vec![weights
            .path()
            .join("Conv2d_5_pointwise_weights.npy")
            .display()
            .to_string()]
    );
    assert_eq!(read_result(&results.join("img001.npy.txt")).len(), 1000);
}

#[test]
fn test_misshaped_weight_is_fatal() {
    let weights = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_weights(weights.path(), None);
    write_npy(
        weights.path().join("Conv2d_0_weights.npy"),
        &Array4::<f32>::zeros((3, 3, 3, 3)),
    )
    .unwrap();

    let res = run_mobilenet(
        &config(weights.path(), &work.path().join("results")),
        Session::from_batch_files(Vec::<String>::new()).unwrap(),
    );
    assert!(matches!(
        res,
        Err(MobilenetError::GraphError(GraphError::WeightAccessError { .. }))
    ));
}

#[test]
fn test_missing_batch_file_is_fatal() {
    let weights = tempdir().unwrap();
    let work = tempdir().unwrap();
    let results = work.path().join("results");

    let res = run_mobilenet(
        &config(weights.path(), &results),
        Session::from_batch_files(vec![work.path().join("nothing.npy")]).unwrap(),
    );
    assert!(matches!(
        res,
        Err(MobilenetError::GraphError(GraphError::InputAccessError(_)))
    ));
    assert_eq!(fs::read_dir(&results).unwrap().count(), 0);
}

#[test]
fn test_prepared_batches_of_two() {
    let weights = tempdir().unwrap();
    let images = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_weights(weights.path(), None);
    for (name, color) in &[("a.jpg", [250, 10, 10]), ("b.jpg", [10, 10, 250])] {
        RgbImage::from_pixel(48, 40, Rgb(*color))
            .save(images.path().join(name))
            .unwrap();
    }

    let prepare = PrepareConfig {
        source: ImageSource::Directory(images.path().to_path_buf()),
        batches_dir: work.path().join("batches"),
        image_list: work.path().join("images.txt"),
        batch_list: work.path().join("batches.txt"),
        image_size: IMAGE_SIZE,
        batch_size: 2,
        batch_count: 1,
        skip_images: 0,
        reuse_existing: false,
    };
    prepare_batches(&prepare).unwrap();

    let results = work.path().join("results");
    let mut config = config(weights.path(), &results);
    config.batch_size = 2;
    config.convolution_method = ConvolutionMethodHint::Direct;
    let session =
        Session::from_list_files(Some(&prepare.image_list), &prepare.batch_list, 2).unwrap();

    let report = run_mobilenet(&config, session).unwrap();
    assert_eq!(report.processed_batches, 1);
    assert_eq!(report.statistics.batch_size, 2);
    assert_eq!(report.statistics.loaded_batches, 1);
    assert_eq!(read_result(&results.join("a.jpg.txt")).len(), 1000);
    assert_eq!(read_result(&results.join("b.jpg.txt")).len(), 1000);
}

#[test]
fn test_rerun_replaces_earlier_results() {
    let weights = tempdir().unwrap();
    let work = tempdir().unwrap();
    write_weights(weights.path(), None);

    let batches: Vec<_> = ["a.npy", "b.npy"]
        .iter()
        .map(|name| {
            let path = work.path().join(name);
            write_npy(
                &path,
                &Array4::<f32>::zeros((1, 3, IMAGE_SIZE, IMAGE_SIZE)),
            )
            .unwrap();
            path
        })
        .collect();
    let results = work.path().join("results");
    let mut config = config(weights.path(), &results);

    let report = run_mobilenet(&config, Session::from_batch_files(&batches).unwrap()).unwrap();
    assert_eq!(report.processed_batches, 2);
    assert_eq!(report.statistics.loaded_batches, 2);
    assert_eq!(report.statistics.processed_batches, 2);
    assert_eq!(fs::read_dir(&results).unwrap().count(), 2);

    let report =
        run_mobilenet(&config, Session::from_batch_files(&batches[..1]).unwrap()).unwrap();
    assert_eq!(report.processed_batches, 1);
    assert_eq!(fs::read_dir(&results).unwrap().count(), 1);
    assert!(results.join("a.npy.txt").is_file());
    assert!(!results.join("b.npy.txt").exists());

    fs::write(results.join("b.npy.txt"), "earlier run").unwrap();
    config.keep_results = true;
    run_mobilenet(&config, Session::from_batch_files(&batches[..1]).unwrap()).unwrap();
    assert_eq!(fs::read_dir(&results).unwrap().count(), 2);
}
