//! Scalar logging for training runs.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: usize,
    pub value: f32,
    pub wall_time: f64,
}

/// Appends one JSON object per line, readable by any plotting front end.
pub struct ScalarLog {
    writer: BufWriter<File>,
}

impl ScalarLog {
    pub fn open(run_dir: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(METRICS_FILE))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()> {
        let wall_time = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        let event = ScalarEvent {
            tag: tag.to_string(),
            step,
            value,
            wall_time,
        };
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

pub fn read_scalars(run_dir: &Path) -> Result<Vec<ScalarEvent>> {
    let raw = std::fs::read_to_string(run_dir.join(METRICS_FILE))?;
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Error::from))
        .collect()
}

/// Exponential moving average over roughly `window` values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothedLoss {
    pub window: f32,
    pub value: f32,
}

impl SmoothedLoss {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1) as f32,
            value: 0.0,
        }
    }

    pub fn update(&mut self, x: f32) -> f32 {
        self.value = (self.window - 1.0) / self.window * self.value + x / self.window;
        self.value
    }
}

/// Remaining time as `HH:MM:SS`, extrapolated from the mean time per iteration.
pub fn time_left(elapsed: Duration, n_iters: usize, i_iter: usize) -> String {
    if i_iter == 0 {
        return "--:--:--".to_string();
    }
    let iters_left = n_iters.saturating_sub(i_iter) as f64;
    let secs = (elapsed.as_secs_f64() / i_iter as f64 * iters_left).round() as u64;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scalars_append_as_json_lines() {
        let dir = tempdir().unwrap();
        {
            let mut log = ScalarLog::open(dir.path()).unwrap();
            log.add_scalar("train/loss", 1.5, 1).unwrap();
            log.add_scalar("train/loss", 1.25, 2).unwrap();
            log.flush().unwrap();
        }
        {
            let mut log = ScalarLog::open(dir.path()).unwrap();
            log.add_scalar("val/loss", 2.0, 1).unwrap();
            log.flush().unwrap();
        }

        let events = read_scalars(dir.path()).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].value, 1.25);
        assert_eq!(events[2].tag, "val/loss");

        let now = chrono::Utc::now().timestamp() as f64;
        for event in &events {
            assert!((now - event.wall_time).abs() < 60.0, "{}", event.wall_time);
        }
        assert!(events[0].wall_time <= events[2].wall_time);
    }

    #[test]
    fn smoothed_loss_follows_ema() {
        let mut avg = SmoothedLoss::new(100);
        assert!((avg.update(100.0) - 1.0).abs() < 1e-5);
        assert!((avg.update(100.0) - 1.99).abs() < 1e-4);

        let mut instant = SmoothedLoss::new(1);
        assert_eq!(instant.update(3.0), 3.0);
    }

    #[test]
    fn time_left_extrapolates() {
        let s = time_left(Duration::from_secs(10), 100, 10);
        assert_eq!(s, "00:01:30");
        let long = time_left(Duration::from_secs(3600), 3, 1);
        assert_eq!(long, "02:00:00");
        assert_eq!(time_left(Duration::from_secs(1), 5, 0), "--:--:--");
    }
}
