//! Turns JPEG images into `.npy` batch files and writes the list files a run is driven by.
//!
//! The preprocessing follows the Inception/MobileNet evaluation recipe: the central 87.5% of
//! the image is cropped and resized to the network resolution. Pixels stay 8 bit, the batch
//! feeder maps them to [-1, 1] when loading.
use crate::{
    errors::{MobilenetError, MobilenetResult},
    session::read_list,
};
use image::{
    imageops::{self, FilterType},
    io::Reader as ImageReader,
    ImageError,
};
use log::{info, warn};
use ndarray::{stack, Array3, Axis};
use ndarray_npy::write_npy;
use nshare::ToNdarray3;
use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};

const CENTRAL_FRACTION: f32 = 0.875;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Every `.jpg`/`.jpeg` file in the directory
    Directory(PathBuf),
    /// A single image, processed as one batch of one image
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareConfig {
    pub source: ImageSource,
    /// Recreated on every call unless `reuse_existing` is set and it already exists
    pub batches_dir: PathBuf,
    pub image_list: PathBuf,
    pub batch_list: PathBuf,
    pub image_size: usize,
    pub batch_size: usize,
    pub batch_count: usize,
    pub skip_images: usize,
    /// Keeps the batches of an earlier preparation instead of decoding the images again
    pub reuse_existing: bool,
}

/// What [`prepare_batches`] wrote, in the order of the list files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBatches {
    pub images: Vec<String>,
    pub batch_files: Vec<PathBuf>,
}

fn is_jpeg(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(OsStr::to_str)
        .map_or(false, |ext| {
            ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg")
        })
}

/// Sorted JPEG file names of `dir` after skipping `skip`, exactly `count` of them.
/// If too few are left, the last one is repeated.
pub fn select_images(dir: &Path, skip: usize, count: usize) -> MobilenetResult<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|source| MobilenetError::DirectoryError {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .filter_map(|e| match e.file_name().into_string() {
            Ok(name) => Some(name),
            Err(name) => {
                warn!("Skipping {:?}, the file name is not valid UTF-8", name);
                None
            }
        })
        .filter(|name| is_jpeg(name))
        .collect();
    files.sort();

    let mut images: Vec<String> = files.into_iter().skip(skip).take(count).collect();
    match images.last().cloned() {
        Some(last) => {
            images.resize(count, last);
            Ok(images)
        }
        None => Err(MobilenetError::ManifestError(format!(
            "{} contains no images after skipping {}",
            dir.display(),
            skip
        ))),
    }
}

/// Decodes an image and returns it as (3, `image_size`, `image_size`) pixels.
pub fn load_image(path: &Path, image_size: usize) -> MobilenetResult<Array3<u8>> {
    let img = ImageReader::open(path)
        .map_err(ImageError::from)
        .and_then(|reader| reader.decode())
        .map_err(|source| MobilenetError::ImageError {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    let (width, height) = img.dimensions();
    let crop_width = ((width as f32 * CENTRAL_FRACTION) as u32).max(1);
    let crop_height = ((height as f32 * CENTRAL_FRACTION) as u32).max(1);
    let cropped = imageops::crop_imm(
        &img,
        (width - crop_width) / 2,
        (height - crop_height) / 2,
        crop_width,
        crop_height,
    )
    .to_image();

    let size = image_size as u32;
    Ok(imageops::resize(&cropped, size, size, FilterType::CatmullRom).into_ndarray3())
}

pub fn recreate_dir(dir: &Path) -> MobilenetResult<()> {
    let to_error = |source| MobilenetError::DirectoryError {
        path: dir.to_path_buf(),
        source,
    };
    if dir.is_dir() {
        fs::remove_dir_all(dir).map_err(to_error)?;
    }
    fs::create_dir_all(dir).map_err(to_error)
}

fn write_list<S: AsRef<str>>(path: &Path, entries: &[S]) -> MobilenetResult<()> {
    let content: String = entries
        .iter()
        .map(|e| format!("{}\n", e.as_ref()))
        .collect();
    fs::write(path, content).map_err(|source| MobilenetError::WriteError {
        path: path.to_path_buf(),
        source,
    })
}

/// The batches written by an earlier call, if its batch directory and list files still exist.
fn existing_batches(config: &PrepareConfig) -> MobilenetResult<Option<PreparedBatches>> {
    if !config.batches_dir.is_dir() || !config.image_list.is_file() || !config.batch_list.is_file()
    {
        return Ok(None);
    }
    Ok(Some(PreparedBatches {
        images: read_list(&config.image_list)?,
        batch_files: read_list(&config.batch_list)?
            .into_iter()
            .map(PathBuf::from)
            .collect(),
    }))
}

pub fn prepare_batches(config: &PrepareConfig) -> MobilenetResult<PreparedBatches> {
    if config.batch_size == 0 || config.batch_count == 0 || config.image_size == 0 {
        return Err(MobilenetError::ConfigError(
            "batch size, batch count and image size must not be 0".to_string(),
        ));
    }
    if config.reuse_existing {
        if let Some(prepared) = existing_batches(config)? {
            info!(
                "Reusing {} batches in {}",
                prepared.batch_files.len(),
                config.batches_dir.display()
            );
            return Ok(prepared);
        }
    }

    let (image_dir, images, batch_size) = match &config.source {
        ImageSource::File(file) => {
            let name = file
                .file_name()
                .and_then(OsStr::to_str)
                .ok_or_else(|| {
                    MobilenetError::ConfigError(format!("{} is not an image file", file.display()))
                })?
                .to_string();
            info!("Single file mode");
            let dir = file.parent().map(Path::to_path_buf).unwrap_or_default();
            (dir, vec![name], 1)
        }
        ImageSource::Directory(dir) => (
            dir.clone(),
            select_images(
                dir,
                config.skip_images,
                config.batch_count * config.batch_size,
            )?,
            config.batch_size,
        ),
    };
    info!("Image dir: {}", image_dir.display());
    info!("Batch size: {}", batch_size);
    info!("Batch count: {}", images.len() / batch_size);
    info!("Batches dir: {}", config.batches_dir.display());

    write_list(&config.image_list, &images)?;
    recreate_dir(&config.batches_dir)?;

    let mut batch_files = Vec::with_capacity(images.len() / batch_size);
    for (i, batch) in images.chunks(batch_size).enumerate() {
        let pixels = batch
            .iter()
            .map(|image| load_image(&image_dir.join(image), config.image_size))
            .collect::<MobilenetResult<Vec<_>>>()?;
        let views: Vec<_> = pixels.iter().map(|p| p.view()).collect();
        let stacked = stack(Axis(0), &views)?;

        let path = config.batches_dir.join(format!("{}.npy", batch[0]));
        write_npy(&path, &stacked).map_err(|source| MobilenetError::BatchWriteError {
            path: path.clone(),
            source,
        })?;
        batch_files.push(path);

        if (i + 1) % 10 == 0 {
            info!("Prepared batches: {} of {}", i + 1, images.len() / batch_size);
        }
    }

    let batch_list: Vec<String> = batch_files
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    write_list(&config.batch_list, &batch_list)?;

    Ok(PreparedBatches {
        images,
        batch_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use ndarray::Array4;
    use ndarray_npy::read_npy;
    use tempfile::tempdir;

    fn save_image(path: &Path, color: [u8; 3]) {
        RgbImage::from_pixel(40, 30, Rgb(color)).save(path).unwrap();
    }

    fn config(source: ImageSource, out: &Path) -> PrepareConfig {
        PrepareConfig {
            source,
            batches_dir: out.join("batches"),
            image_list: out.join("images.txt"),
            batch_list: out.join("batches.txt"),
            image_size: 16,
            batch_size: 2,
            batch_count: 2,
            skip_images: 0,
            reuse_existing: false,
        }
    }

    #[test]
    fn test_is_jpeg() {
        assert!(is_jpeg("cat.jpg"));
        assert!(is_jpeg("cat.JPEG"));
        assert!(!is_jpeg("cat.png"));
        assert!(!is_jpeg("jpg"));
    }

    #[test]
    fn test_load_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("red.png");
        save_image(&path, [200, 10, 0]);

        let pixels = load_image(&path, 8).unwrap();
        assert_eq!(pixels.dim(), (3, 8, 8));
        assert!(pixels.index_axis(Axis(0), 0).iter().all(|&p| p >= 199 && p <= 201));
        assert!(pixels.index_axis(Axis(0), 2).iter().all(|&p| p <= 1));

        assert!(matches!(
            load_image(&dir.path().join("missing.png"), 8),
            Err(MobilenetError::ImageError { .. })
        ));
    }

    #[test]
    fn test_select_images() {
        let dir = tempdir().unwrap();
        for name in &["c.jpg", "a.jpeg", "b.jpg"] {
            save_image(&dir.path().join(name), [0, 0, 0]);
        }
        fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        assert_eq!(
            select_images(dir.path(), 1, 2).unwrap(),
            vec!["b.jpg", "c.jpg"]
        );
        assert_eq!(
            select_images(dir.path(), 2, 3).unwrap(),
            vec!["c.jpg", "c.jpg", "c.jpg"]
        );
        assert!(matches!(
            select_images(dir.path(), 3, 1),
            Err(MobilenetError::ManifestError(_))
        ));
    }

    #[test]
    fn test_prepare_directory() {
        let images = tempdir().unwrap();
        let out = tempdir().unwrap();
        save_image(&images.path().join("a.jpg"), [255, 255, 255]);
        save_image(&images.path().join("b.jpg"), [0, 0, 0]);

        let config = config(ImageSource::Directory(images.path().to_path_buf()), out.path());
        // Stale content is removed
        fs::create_dir_all(&config.batches_dir).unwrap();
        fs::write(config.batches_dir.join("old.npy"), "").unwrap();

        let prepared = prepare_batches(&config).unwrap();
        assert_eq!(prepared.images, vec!["a.jpg", "b.jpg", "b.jpg", "b.jpg"]);
        assert_eq!(
            prepared.batch_files,
            vec![
                config.batches_dir.join("a.jpg.npy"),
                config.batches_dir.join("b.jpg.npy")
            ]
        );
        assert!(!config.batches_dir.join("old.npy").exists());

        let batch: Array4<u8> = read_npy(&prepared.batch_files[0]).unwrap();
        assert_eq!(batch.dim(), (2, 3, 16, 16));

        assert_eq!(
            fs::read_to_string(&config.image_list).unwrap(),
            "a.jpg\nb.jpg\nb.jpg\nb.jpg\n"
        );
        assert_eq!(
            fs::read_to_string(&config.batch_list).unwrap().lines().count(),
            2
        );
    }

    #[test]
    fn test_reuse_existing_batches() {
        let images = tempdir().unwrap();
        let out = tempdir().unwrap();
        save_image(&images.path().join("a.jpg"), [255, 255, 255]);

        let mut config = config(ImageSource::Directory(images.path().to_path_buf()), out.path());
        config.batch_size = 1;
        config.batch_count = 1;
        config.reuse_existing = true;
        // Nothing to reuse yet
        let first = prepare_batches(&config).unwrap();
        assert_eq!(first.images, vec!["a.jpg"]);

        // A new image is not picked up while the old batches are reused
        save_image(&images.path().join("0.jpg"), [0, 0, 0]);
        assert_eq!(prepare_batches(&config).unwrap(), first);

        config.reuse_existing = false;
        let rebuilt = prepare_batches(&config).unwrap();
        assert_eq!(rebuilt.images, vec!["0.jpg"]);
        assert_eq!(rebuilt.batch_files, vec![config.batches_dir.join("0.jpg.npy")]);
        assert!(!config.batches_dir.join("a.jpg.npy").exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_select_images_skips_undecodable_names() {
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        save_image(&dir.path().join("b.jpg"), [0, 0, 0]);
        fs::write(dir.path().join(OsStr::from_bytes(b"a\xff.jpg")), "").unwrap();

        assert_eq!(select_images(dir.path(), 0, 1).unwrap(), vec!["b.jpg"]);
    }

    #[test]
    fn test_prepare_single_file() {
        let images = tempdir().unwrap();
        let out = tempdir().unwrap();
        let image = images.path().join("cat.jpg");
        save_image(&image, [10, 20, 30]);

        let prepared = prepare_batches(&config(ImageSource::File(image), out.path())).unwrap();
        assert_eq!(prepared.images, vec!["cat.jpg"]);
        let batch: Array4<u8> = read_npy(&prepared.batch_files[0]).unwrap();
        assert_eq!(batch.dim(), (1, 3, 16, 16));
    }
}
