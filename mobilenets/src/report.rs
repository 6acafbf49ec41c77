use crate::{
    errors::{MobilenetError, MobilenetResult},
    session::SessionStatistics,
    timing::TimerRecord,
};
use serde_derive::Serialize;
use std::{fs, path::Path};

/// Outcome of one benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub timers: Vec<TimerRecord>,
    pub statistics: SessionStatistics,
    pub processed_batches: usize,
    /// Weight files that were replaced by zeros
    pub missing_weights: Vec<String>,
}

impl BenchmarkReport {
    pub fn to_json(&self) -> MobilenetResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> MobilenetResult<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?).map_err(|source| MobilenetError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn test_written_as_json() {
        let report = BenchmarkReport {
            timers: vec![TimerRecord {
                name: "setup".to_string(),
                seconds: 0.5,
            }],
            statistics: Session::from_batch_files(vec!["a.npy"]).unwrap().statistics(),
            processed_batches: 0,
            missing_weights: vec!["Conv2d_0_weights.npy".to_string()],
        };
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write(&path).unwrap();

        let json: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["timers"][0]["name"], "setup");
        assert_eq!(json["statistics"]["batch_count"], 1);
        assert_eq!(json["missing_weights"][0], "Conv2d_0_weights.npy");

        assert!(matches!(
            report.write(dir.path().join("missing/report.json")),
            Err(MobilenetError::WriteError { .. })
        ));
    }
}
