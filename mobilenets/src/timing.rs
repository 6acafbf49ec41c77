use log::info;
use serde_derive::Serialize;
use std::time::Instant;

pub const SETUP_TIMER: &str = "setup";
pub const RUN_TIMER: &str = "run";

/// A finished wall-clock bracket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerRecord {
    pub name: String,
    pub seconds: f64,
}

/// Named wall-clock brackets, kept in the order they finished.
#[derive(Debug, Default)]
pub struct Timers {
    records: Vec<TimerRecord>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` and records how long it took under `name`.
    pub fn time<T, F>(&mut self, name: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start = Instant::now();
        let result = f();
        let seconds = start.elapsed().as_secs_f64();
        info!("Timer {}: {:.6} s", name, seconds);
        self.records.push(TimerRecord {
            name: name.to_string(),
            seconds,
        });
        result
    }

    pub fn records(&self) -> &[TimerRecord] {
        &self.records
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.records
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.seconds)
    }
}
