use crate::training::MetricsRecord;
use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File the metrics stream is written to, under the logs directory
pub const METRICS_FILE: &str = "metrics.jsonl";

/// One logged record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub namespace: String,
    pub metrics: MetricsRecord,
}

/// Metrics stream recorder
///
/// Every record is appended as one JSON line to `<logs>/metrics.jsonl` and
/// mirrored to the tracing output. A bounded window of recent entries is
/// kept in memory only when requested with [`MetricsLogger::with_history`].
pub struct MetricsLogger {
    log_file: Option<PathBuf>,
    history: VecDeque<LogEntry>,
    history_limit: usize,
}

impl MetricsLogger {
    /// Create new metrics logger writing under `log_dir`
    ///
    /// An existing `metrics.jsonl` from an earlier run is truncated.
    pub fn new<P: AsRef<Path>>(log_dir: P) -> anyhow::Result<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

        let log_file = log_dir.join(METRICS_FILE);
        File::create(&log_file).with_context(|| format!("Failed to create {:?}", log_file))?;

        Ok(Self {
            log_file: Some(log_file),
            ..Self::tracing_only()
        })
    }

    /// Logger that only mirrors to tracing, for non-main replicas
    pub fn tracing_only() -> Self {
        Self {
            log_file: None,
            history: VecDeque::new(),
            history_limit: 0,
        }
    }

    /// Keep the most recent `limit` entries in memory
    pub fn with_history(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self.history = VecDeque::with_capacity(limit);
        self
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Record `metrics` at `step` under `namespace`
    ///
    /// Non-finite values have no JSON representation and are dropped.
    pub fn log_metrics(&mut self, metrics: &MetricsRecord, step: usize, namespace: &str) {
        let metrics: MetricsRecord = metrics
            .iter()
            .filter(|(name, value)| {
                let finite = value.is_finite();
                if !finite {
                    warn!("[{}] step {}: dropping non-finite {}={}", namespace, step, name, value);
                }
                finite
            })
            .map(|(name, value)| (name.clone(), *value))
            .collect();

        info!("[{}] step {}: {}", namespace, step, format_metrics(&metrics));

        let entry = LogEntry {
            step,
            namespace: namespace.to_string(),
            metrics,
        };

        if let Some(path) = &self.log_file {
            if let Err(e) = append_entry(path, &entry) {
                warn!("Failed to save metrics: {:#}", e);
            }
        }

        if self.history_limit > 0 {
            if self.history.len() == self.history_limit {
                self.history.pop_front();
            }
            self.history.push_back(entry);
        }
    }

    /// Recent entries, oldest first
    pub fn history(&self) -> impl Iterator<Item = &LogEntry> {
        self.history.iter()
    }

    /// Recent entries logged under exactly `namespace`
    pub fn entries<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.history.iter().filter(move |e| e.namespace == namespace)
    }

    /// Read a metrics stream written by a logger
    pub fn read_log<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<LogEntry>> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;

        BufReader::new(file)
            .lines()
            .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
            .map(|line| {
                let line = line?;
                serde_json::from_str(&line).context("Malformed metrics line")
            })
            .collect()
    }
}

fn append_entry(path: &Path, entry: &LogEntry) -> anyhow::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// `name=value` pairs, params as an integer
pub fn format_metrics(metrics: &MetricsRecord) -> String {
    metrics
        .iter()
        .map(|(name, value)| {
            if name == crate::training::PARAMS_KEY {
                format!("{name}={}", *value as u64)
            } else {
                format!("{name}={value:.4}")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Progress bar over training steps, hidden when disabled
pub fn progress_bar(total: u64, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_metrics_appends_lines() {
        let temp_dir = TempDir::new().unwrap();
        let mut logger = MetricsLogger::new(temp_dir.path().join("logs"))
            .unwrap()
            .with_history(8);

        let mut record = MetricsRecord::with_params(10);
        record.insert("train_loss", 0.25);
        logger.log_metrics(&record, 0, "steps/supernet");
        logger.log_metrics(&record, 0, "steps/subnet");
        logger.log_metrics(&record, 1, "steps/supernet");

        assert_eq!(logger.entries("steps/supernet").count(), 2);
        assert_eq!(logger.entries("steps/subnet").count(), 1);

        let written = MetricsLogger::read_log(logger.log_file().unwrap()).unwrap();
        assert_eq!(written, logger.history().cloned().collect::<Vec<_>>());
        assert_eq!(written[2].step, 1);
    }

    #[test]
    fn test_history_is_off_by_default_and_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let mut logger = MetricsLogger::new(temp_dir.path()).unwrap();
        for step in 0..5 {
            logger.log_metrics(&MetricsRecord::with_params(1), step, "steps/supernet");
        }
        assert_eq!(logger.history().count(), 0);
        assert_eq!(MetricsLogger::read_log(logger.log_file().unwrap()).unwrap().len(), 5);

        let mut logger = MetricsLogger::tracing_only().with_history(2);
        for step in 0..5 {
            logger.log_metrics(&MetricsRecord::with_params(1), step, "steps/supernet");
        }
        let steps: Vec<usize> = logger.history().map(|e| e.step).collect();
        assert_eq!(steps, vec![3, 4]);
    }

    #[test]
    fn test_tracing_only_logger_writes_nothing() {
        let mut logger = MetricsLogger::tracing_only();
        logger.log_metrics(&MetricsRecord::with_params(1), 3, "eval/supernet");
        assert!(logger.log_file().is_none());
        assert_eq!(logger.history().count(), 0);
    }

    #[test]
    fn test_non_finite_values_are_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let mut logger = MetricsLogger::new(temp_dir.path()).unwrap();

        let mut record = MetricsRecord::with_params(10);
        record.insert("train_loss", f64::NAN);
        record.insert("lr", f64::INFINITY);
        record.insert("accuracy", 0.5);
        logger.log_metrics(&record, 2, "eval/supernet");
        logger.log_metrics(&MetricsRecord::with_params(10), 3, "eval/supernet");

        let written = MetricsLogger::read_log(logger.log_file().unwrap()).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].metrics.get("accuracy"), Some(0.5));
        assert_eq!(written[0].metrics.params(), Some(10));
        assert_eq!(written[0].metrics.get("train_loss"), None);
        assert_eq!(written[0].metrics.get("lr"), None);
    }

    #[test]
    fn test_new_run_truncates_previous_stream() {
        let temp_dir = TempDir::new().unwrap();
        let mut first = MetricsLogger::new(temp_dir.path()).unwrap();
        first.log_metrics(&MetricsRecord::with_params(1), 0, "steps/supernet");
        first.log_metrics(&MetricsRecord::with_params(1), 1, "steps/supernet");

        let mut second = MetricsLogger::new(temp_dir.path()).unwrap();
        second.log_metrics(&MetricsRecord::with_params(2), 0, "steps/supernet");

        let written = MetricsLogger::read_log(temp_dir.path().join(METRICS_FILE)).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].metrics.params(), Some(2));
    }

    #[test]
    fn test_format_metrics() {
        let mut record = MetricsRecord::with_params(1234);
        record.insert("accuracy", 0.5);
        assert_eq!(format_metrics(&record), "accuracy=0.5000 params=1234");
    }
}
