//! The state of one benchmark run: which images are classified, which batch is currently in
//! flight and how long loading and classification took so far.
use crate::errors::{MobilenetError, MobilenetResult};
use serde_derive::Serialize;
use std::{
    cell::RefCell,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
    time::{Duration, Instant},
};

/// The session is shared between the batch feeder and the result writer, which are both
/// driven from the single thread executing the graph.
pub type SharedSession = Rc<RefCell<Session>>;

#[derive(Debug)]
pub struct Session {
    image_files: Vec<String>,
    batch_files: Vec<PathBuf>,
    batch_size: usize,
    /// Number of batches handed out so far
    fetched: usize,
    measure_start: Option<Instant>,
    load_times: Vec<Duration>,
    prediction_times: Vec<Duration>,
}

/// Timing summary of a session, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatistics {
    pub batch_count: usize,
    pub batch_size: usize,
    pub loaded_batches: usize,
    pub processed_batches: usize,
    pub total_load_images_time: f64,
    pub avg_load_images_time: f64,
    pub total_prediction_time: f64,
    pub avg_prediction_time: f64,
    /// The first batch usually includes warm-up costs
    pub avg_prediction_time_without_first: f64,
}

pub(crate) fn read_list(path: &Path) -> MobilenetResult<Vec<String>> {
    let content = fs::read_to_string(path).map_err(|source| MobilenetError::ListFileError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn average(times: &[Duration]) -> f64 {
    if times.is_empty() {
        0.0
    } else {
        total(times) / times.len() as f64
    }
}

fn total(times: &[Duration]) -> f64 {
    times.iter().map(Duration::as_secs_f64).sum()
}

impl Session {
    /// Batch `i` contains the images `image_files[i * batch_size..(i + 1) * batch_size]`.
    pub fn new(
        image_files: Vec<String>,
        batch_files: Vec<PathBuf>,
        batch_size: usize,
    ) -> MobilenetResult<Session> {
        if batch_size == 0 {
            return Err(MobilenetError::ManifestError(
                "batch size must not be 0".to_string(),
            ));
        }
        let needed = batch_files.len() * batch_size;
        if image_files.len() < needed {
            return Err(MobilenetError::ManifestError(format!(
                "{} batches of size {} need {} images, but only {} are listed",
                batch_files.len(),
                batch_size,
                needed,
                image_files.len()
            )));
        }
        Ok(Session {
            image_files,
            batch_files,
            batch_size,
            fetched: 0,
            measure_start: None,
            load_times: Vec::new(),
            prediction_times: Vec::new(),
        })
    }

    /// One image per batch file, identified by the batch file's name.
    pub fn from_batch_files<I, P>(batch_files: I) -> MobilenetResult<Session>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let batch_files: Vec<PathBuf> = batch_files.into_iter().map(Into::into).collect();
        let image_files = batch_files
            .iter()
            .map(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        MobilenetError::ManifestError(format!(
                            "batch file {} has no file name",
                            p.display()
                        ))
                    })
            })
            .collect::<MobilenetResult<Vec<_>>>()?;
        Session::new(image_files, batch_files, 1)
    }

    /// Reads newline separated list files. Without an image list, images are named after
    /// their batch files and the batch size has to be 1.
    pub fn from_list_files(
        image_list: Option<&Path>,
        batch_list: &Path,
        batch_size: usize,
    ) -> MobilenetResult<Session> {
        let batch_files = read_list(batch_list)?;
        match image_list {
            Some(image_list) => Session::new(
                read_list(image_list)?,
                batch_files.into_iter().map(PathBuf::from).collect(),
                batch_size,
            ),
            None if batch_size == 1 => Session::from_batch_files(batch_files),
            None => Err(MobilenetError::ManifestError(
                "an image list is required for batch sizes other than 1".to_string(),
            )),
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Rc::new(RefCell::new(self))
    }

    pub fn batch_count(&self) -> usize {
        self.batch_files.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn image_files(&self) -> &[String] {
        &self.image_files
    }

    /// Index of the batch handed out last, None before the first batch.
    pub fn batch_index(&self) -> Option<usize> {
        self.fetched.checked_sub(1)
    }

    /// Advances to the next batch. Returns None once every batch was handed out.
    pub fn next_batch_file(&mut self) -> Option<PathBuf> {
        let next = self.batch_files.get(self.fetched)?.clone();
        self.fetched += 1;
        Some(next)
    }

    /// Image identifiers of the batch handed out last.
    pub fn current_images(&self) -> &[String] {
        match self.batch_index() {
            Some(i) => &self.image_files[i * self.batch_size..(i + 1) * self.batch_size],
            None => &[],
        }
    }

    pub fn measure_begin(&mut self) {
        self.measure_start = Some(Instant::now());
    }

    fn measure_end(&mut self) -> Option<Duration> {
        self.measure_start.take().map(|start| start.elapsed())
    }

    /// Records the time since [`Session::measure_begin`] as loading time.
    pub fn measure_end_load_images(&mut self) -> Duration {
        let t = self.measure_end();
        self.load_times.extend(t);
        t.unwrap_or_default()
    }

    /// Records the time since [`Session::measure_begin`] as classification time.
    pub fn measure_end_prediction(&mut self) -> Duration {
        let t = self.measure_end();
        self.prediction_times.extend(t);
        t.unwrap_or_default()
    }

    pub fn statistics(&self) -> SessionStatistics {
        SessionStatistics {
            batch_count: self.batch_count(),
            batch_size: self.batch_size,
            loaded_batches: self.load_times.len(),
            processed_batches: self.prediction_times.len(),
            total_load_images_time: total(&self.load_times),
            avg_load_images_time: average(&self.load_times),
            total_prediction_time: total(&self.prediction_times),
            avg_prediction_time: average(&self.prediction_times),
            avg_prediction_time_without_first: average(
                self.prediction_times.get(1..).unwrap_or(&[]),
            ),
        }
    }
}
