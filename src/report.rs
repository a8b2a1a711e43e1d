//! # Run Report
//!
//! Append-only JSON-lines log of a run, one [`ReportEvent`] per line. Besides
//! documenting the run, the report is what a restart replays: every
//! `work_start` line marks a page that must not be scheduled again.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const REPORT_FILE: &str = "report.jsonl";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReportEvent {
    RunStart {
        run_id: String,
        tool_version: String,
        config_hash: String,
        command_line: Vec<String>,
        threads: usize,
        page_size: u64,
        margin: u64,
        max_depth: u32,
    },
    /// The input the run was started on. Restarts must match it.
    ProvidedFilename { filename: String },
    /// This run continues the one logged in `previous_report`.
    Restarted { previous_report: String },
    Timestamp {
        name: String,
        at: String,
        elapsed_secs: f64,
    },
    WorkStart { pos: String, thread: usize },
    WorkEnd {
        pos: String,
        thread: usize,
        seconds: f64,
    },
    Comment { text: String },
    DebugException {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pos: Option<String>,
        message: String,
    },
    Source {
        image: String,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash_alg: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        digest: Option<String>,
    },
    FeatureFile { name: String, count: u64 },
    /// Seconds a thread spent waiting. `thread` is absent for the producer.
    ThreadWait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<usize>,
        seconds: f64,
    },
    ScannerStats {
        name: String,
        calls: u64,
        seconds: f64,
        errors: u64,
    },
    Report {
        pages: u64,
        bytes: u64,
        page_errors: u64,
        scanner_errors: u64,
        seconds: f64,
        hint: String,
    },
    RunEnd { at: String },
}

/// Shared writer for `report.jsonl`. Every event is flushed as soon as it is
/// written so an interrupted run leaves a usable log behind.
pub struct RunReport {
    path: PathBuf,
    started: Instant,
    writer: Mutex<BufWriter<File>>,
}

impl std::fmt::Debug for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunReport").field("path", &self.path).finish()
    }
}

impl RunReport {
    /// Start a new report in `outdir`, replacing any existing one.
    pub fn create(outdir: &Path) -> Result<Self, ReportError> {
        let path = outdir.join(REPORT_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            started: Instant::now(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, event: &ReportEvent) -> Result<(), ReportError> {
        let mut guard = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serde_json::to_writer(&mut *guard, event)?;
        guard.write_all(b"\n")?;
        guard.flush()?;
        Ok(())
    }

    /// Like [`record`](Self::record) but only logs failures. Used on paths
    /// where a lost report line must not stop the scan.
    pub fn emit(&self, event: ReportEvent) {
        if let Err(err) = self.record(&event) {
            warn!(path = %self.path.display(), "failed to write report event: {err}");
        }
    }

    pub fn comment(&self, text: impl Into<String>) {
        self.emit(ReportEvent::Comment { text: text.into() });
    }

    pub fn timestamp(&self, name: &str) {
        self.emit(ReportEvent::Timestamp {
            name: name.to_string(),
            at: chrono::Utc::now().to_rfc3339(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        });
    }
}

/// Read every event of a report. A line that does not parse (typically the
/// last line of a crashed run) is skipped with a warning.
pub fn read_events(path: &Path) -> Result<Vec<ReportEvent>, ReportError> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReportEvent>(&line) {
            Ok(event) => events.push(event),
            Err(err) => warn!(
                path = %path.display(),
                line = line_no + 1,
                "skipping unreadable report line: {err}"
            ),
        }
    }
    Ok(events)
}
