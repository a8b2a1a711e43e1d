//! # Restart Checkpoint
//!
//! A run is restarted by pointing it at the output directory of an earlier,
//! interrupted run. The earlier `report.jsonl` is replayed to learn which
//! input it was scanning and which pages it already started; those pages are
//! not scheduled again. Each restart archives the previous report and names
//! it in the new one, so a chain of restarts replays every link.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::report::{REPORT_FILE, ReportError, ReportEvent, read_events};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("report error: {0}")]
    Report(#[from] ReportError),
    #[error("output path {0} exists and is not a directory")]
    OutputIsFile(PathBuf),
    #[error("report {0} does not name the input it was run on")]
    MissingFilename(PathBuf),
    #[error("restart input mismatch: output directory was created for '{recorded}', not '{requested}'")]
    InputMismatch { recorded: String, requested: String },
}

/// What a prior run left behind.
#[derive(Debug, Clone, Default)]
pub struct Replay {
    pub provided_filename: Option<String>,
    /// Position paths of every page the prior run(s) started.
    pub seen: HashSet<String>,
    /// Reports replayed, newest first.
    pub reports: Vec<PathBuf>,
}

/// State of the output directory after [`prepare_output`].
#[derive(Debug)]
pub enum OutputState {
    Fresh,
    Restart {
        seen: HashSet<String>,
        /// Where the previous report was moved to, relative to the output
        /// directory.
        previous_report: String,
    },
}

impl OutputState {
    pub fn is_restart(&self) -> bool {
        matches!(self, OutputState::Restart { .. })
    }

    pub fn seen(&self) -> Option<&HashSet<String>> {
        match self {
            OutputState::Restart { seen, .. } => Some(seen),
            OutputState::Fresh => None,
        }
    }
}

/// Replay `report` and every earlier report it chains to.
pub fn replay(report: &Path) -> Result<Replay, CheckpointError> {
    let dir = report.parent().unwrap_or_else(|| Path::new("."));
    let mut replay = Replay::default();
    let mut next = Some(report.to_path_buf());
    let mut visited: HashSet<PathBuf> = HashSet::new();

    while let Some(path) = next.take() {
        if !visited.insert(path.clone()) || !path.exists() {
            break;
        }
        let events = read_events(&path)?;
        debug!(path = %path.display(), events = events.len(), "replaying report");
        for event in events {
            match event {
                ReportEvent::WorkStart { pos, .. } => {
                    replay.seen.insert(pos);
                }
                ReportEvent::ProvidedFilename { filename } => {
                    replay.provided_filename.get_or_insert(filename);
                }
                ReportEvent::Restarted { previous_report } => {
                    next = Some(dir.join(previous_report));
                }
                _ => {}
            }
        }
        replay.reports.push(path);
    }
    Ok(replay)
}

/// Make `outdir` ready for a run over `input`. A missing directory is
/// created; a directory without a report is used as is. A directory with a
/// report becomes a restart: the report must name the same input, and is
/// then archived as `report.jsonl.<unix-seconds>`. Nothing on disk changes
/// when an error is returned.
pub fn prepare_output(outdir: &Path, input: &str) -> Result<OutputState, CheckpointError> {
    if outdir.exists() && !outdir.is_dir() {
        return Err(CheckpointError::OutputIsFile(outdir.to_path_buf()));
    }
    if !outdir.exists() {
        std::fs::create_dir_all(outdir)?;
        return Ok(OutputState::Fresh);
    }

    let report = outdir.join(REPORT_FILE);
    if !report.exists() {
        return Ok(OutputState::Fresh);
    }

    let replay = replay(&report)?;
    let recorded = replay
        .provided_filename
        .ok_or_else(|| CheckpointError::MissingFilename(report.clone()))?;
    if recorded != input {
        return Err(CheckpointError::InputMismatch {
            recorded,
            requested: input.to_string(),
        });
    }

    let archived = archive_name(outdir);
    std::fs::rename(&report, outdir.join(&archived))?;
    info!(
        pages = replay.seen.len(),
        reports = replay.reports.len(),
        archived = %archived,
        "restarting previous run"
    );
    Ok(OutputState::Restart {
        seen: replay.seen,
        previous_report: archived,
    })
}

fn archive_name(outdir: &Path) -> String {
    let secs = chrono::Utc::now().timestamp();
    let base = format!("{REPORT_FILE}.{secs}");
    if !outdir.join(&base).exists() {
        return base;
    }
    (1u32..)
        .map(|n| format!("{base}.{n}"))
        .find(|name| !outdir.join(name).exists())
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RunReport;

    fn write_report(dir: &Path, events: &[ReportEvent]) {
        let report = RunReport::create(dir).expect("create");
        for event in events {
            report.record(event).expect("record");
        }
    }

    fn started(pos: &str) -> ReportEvent {
        ReportEvent::WorkStart {
            pos: pos.to_string(),
            thread: 0,
        }
    }

    fn filename(name: &str) -> ReportEvent {
        ReportEvent::ProvidedFilename {
            filename: name.to_string(),
        }
    }

    #[test]
    fn missing_directory_is_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out");
        let state = prepare_output(&out, "disk.raw").expect("prepare");
        assert!(!state.is_restart());
        assert!(out.is_dir());
    }

    #[test]
    fn output_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out");
        std::fs::write(&out, b"x").unwrap();
        assert!(matches!(
            prepare_output(&out, "disk.raw"),
            Err(CheckpointError::OutputIsFile(_))
        ));
    }

    #[test]
    fn restart_collects_started_pages_and_archives_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_report(dir.path(), &[filename("disk.raw"), started("0"), started("4096")]);

        let state = prepare_output(dir.path(), "disk.raw").expect("prepare");
        let OutputState::Restart { seen, previous_report } = state else {
            panic!("expected restart");
        };
        assert_eq!(seen.len(), 2);
        assert!(seen.contains("4096"));
        assert!(previous_report.starts_with("report.jsonl."));
        assert!(!dir.path().join(REPORT_FILE).exists());
        assert!(dir.path().join(&previous_report).exists());
    }

    #[test]
    fn mismatch_is_fatal_and_leaves_report_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_report(dir.path(), &[filename("disk.raw"), started("0")]);

        let err = prepare_output(dir.path(), "other.raw").unwrap_err();
        assert!(matches!(err, CheckpointError::InputMismatch { .. }));
        assert!(dir.path().join(REPORT_FILE).exists());
    }

    #[test]
    fn chained_restarts_accumulate() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("report.jsonl.100"),
            format!(
                "{}\n{}\n",
                serde_json::to_string(&filename("disk.raw")).unwrap(),
                serde_json::to_string(&started("0")).unwrap()
            ),
        )
        .unwrap();
        write_report(
            dir.path(),
            &[
                ReportEvent::Restarted {
                    previous_report: "report.jsonl.100".to_string(),
                },
                filename("disk.raw"),
                started("4096"),
            ],
        );

        let replay = replay(&dir.path().join(REPORT_FILE)).expect("replay");
        assert_eq!(replay.reports.len(), 2);
        assert!(replay.seen.contains("0"));
        assert!(replay.seen.contains("4096"));
    }
}
