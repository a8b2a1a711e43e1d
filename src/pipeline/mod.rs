//! # Pipeline Module
//!
//! Phase 1 of a run: walk the image page by page and hand every page to a
//! fixed pool of worker threads that run the scanner set over it.
//!
//! The producer (the calling thread) owns all run state: the page counter,
//! the byte total and the whole-image hash. Pages go to the workers over a
//! zero-capacity channel, so a hand-off blocks until a worker is free and at
//! most one page per worker is in memory.
//!
//! A run moves through `INIT -> ITERATING -> DRAINING -> DONE`.

pub mod sampling;
pub mod workers;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, bounded};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::checkpoint::{self, OutputState};
use crate::config::{Config, ConfigError};
use crate::hashing::ImageHasher;
use crate::image::{ImageError, ImageSource, PageData, PageRef};
use crate::recorder::{FeatureRecorderSet, RecorderOptions, WordList};
use crate::report::{ReportEvent, RunReport};
use crate::scanner::{Scanner, ScannerCommand, ScannerSet};

use sampling::{Sampling, SimpleRng, sample_pages};
use workers::{WorkerHandle, WorkerShared};

/// Polls between drain progress messages.
const DRAIN_REPORT_EVERY: u64 = 60;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("memory exhausted: page {pos} could not be allocated after {attempts} attempts")]
    MemoryExhausted { pos: String, attempts: u32 },
    #[error("all workers exited before the scan finished")]
    WorkersGone,
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Iterating,
    Draining,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::Iterating => "ITERATING",
            Phase::Draining => "DRAINING",
            Phase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Pipeline statistics collected during a run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub pages_scheduled: u64,
    pub pages_skipped_seen: u64,
    pub pages_skipped_window: u64,
    pub bytes_scheduled: u64,
    pub page_errors: u64,
    pub scanner_errors: u64,
    pub alloc_retries: u64,
    pub hash_alg: String,
    /// Whole-image digest; only when every byte was hashed in order.
    pub digest: Option<String>,
    pub producer_wait_secs: f64,
    pub worker_wait_secs: Vec<f64>,
    pub elapsed_secs: f64,
    pub drained: bool,
    pub feature_counts: Vec<(String, u64)>,
}

struct PipelineCounters {
    in_flight: Arc<AtomicUsize>,
    pages_done: Arc<AtomicU64>,
    page_errors: Arc<AtomicU64>,
    scanner_errors: Arc<AtomicU64>,
}

impl PipelineCounters {
    fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            pages_done: Arc::new(AtomicU64::new(0)),
            page_errors: Arc::new(AtomicU64::new(0)),
            scanner_errors: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[derive(Debug, Default)]
struct ScheduleOutcome {
    pages: u64,
    bytes: u64,
    skipped_seen: u64,
    skipped_window: u64,
    alloc_retries: u64,
    producer_wait: Duration,
}

/// The Phase 1 scheduler.
pub struct PageScheduler<'a> {
    cfg: &'a Config,
    image: Arc<dyn ImageSource>,
    scanners: Arc<ScannerSet>,
    recorders: Arc<FeatureRecorderSet>,
    report: Arc<RunReport>,
    seen: HashSet<String>,
    workers: usize,
    phase: Phase,
}

impl<'a> PageScheduler<'a> {
    pub fn new(
        cfg: &'a Config,
        image: Arc<dyn ImageSource>,
        scanners: Arc<ScannerSet>,
        recorders: Arc<FeatureRecorderSet>,
        report: Arc<RunReport>,
        seen: HashSet<String>,
    ) -> Self {
        Self {
            workers: cfg.worker_count(),
            cfg,
            image,
            scanners,
            recorders,
            report,
            seen,
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, next: Phase) {
        info!("phase {} -> {}", self.phase, next);
        self.phase = next;
    }

    pub fn run(mut self) -> Result<PipelineStats, PipelineError> {
        let started = Instant::now();
        let sampling = self.cfg.sampling()?;
        let mut hasher = if sampling.is_some() {
            ImageHasher::disabled(self.cfg.hash_alg)
        } else {
            ImageHasher::new(self.cfg.hash_alg)
        };
        info!(
            image = self.image.image_identifier(),
            size = self.image.image_size(),
            pages = self.image.page_count(),
            workers = self.workers,
            seen = self.seen.len(),
            "starting page scan"
        );

        let counters = PipelineCounters::new();
        let (tx, rx) = bounded::<PageData>(0);
        let shared = WorkerShared {
            scanners: self.scanners.clone(),
            recorders: self.recorders.clone(),
            report: self.report.clone(),
            in_flight: counters.in_flight.clone(),
            pages_done: counters.pages_done.clone(),
            page_errors: counters.page_errors.clone(),
            scanner_errors: counters.scanner_errors.clone(),
        };
        let handles = workers::spawn_page_workers(self.workers, rx, shared);

        self.enter(Phase::Iterating);
        let outcome = self.schedule(&tx, sampling, &mut hasher, &counters);
        drop(tx);
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("{err}");
                self.report.emit(ReportEvent::DebugException {
                    pos: None,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        self.enter(Phase::Draining);
        let drained = self.drain(&counters, &handles);
        let worker_wait_secs: Vec<f64> = handles.iter().map(|h| h.wait_seconds()).collect();
        let worker_ids: Vec<usize> = handles.iter().map(|h| h.id).collect();
        if drained {
            for handle in handles {
                let _ = handle.handle.join();
            }
        }

        self.enter(Phase::Done);
        Ok(self.finalize(
            outcome,
            hasher,
            &counters,
            &worker_ids,
            worker_wait_secs,
            drained,
            started,
        ))
    }

    fn candidate_passes(
        &self,
        sampling: Option<Sampling>,
    ) -> (Vec<Box<dyn Iterator<Item = PageRef> + '_>>, u64) {
        let image = self.image.as_ref();
        match sampling {
            None => {
                let count = image.page_count();
                (vec![image.pages()], count)
            }
            Some(sampling) => {
                let mut rng = match self.cfg.sampling_seed {
                    Some(seed) => SimpleRng::new(seed),
                    None => SimpleRng::from_clock(),
                };
                let passes = sample_pages(image.page_count(), &sampling, &mut rng);
                let target = passes.iter().map(|p| p.len() as u64).sum();
                info!(%sampling, pages = target, "sampling pages");
                let iters = passes
                    .into_iter()
                    .map(|pass| {
                        Box::new(pass.into_iter().filter_map(move |i| image.page(i)))
                            as Box<dyn Iterator<Item = PageRef> + '_>
                    })
                    .collect();
                (iters, target)
            }
        }
    }

    fn schedule(
        &self,
        tx: &Sender<PageData>,
        sampling: Option<Sampling>,
        hasher: &mut ImageHasher,
        counters: &PipelineCounters,
    ) -> Result<ScheduleOutcome, PipelineError> {
        let is_sampling = sampling.is_some();
        let (passes, target) = self.candidate_passes(sampling);
        let mut outcome = ScheduleOutcome::default();
        let start = Instant::now();

        for pass in passes {
            for page in pass {
                if self.cfg.offset_end != 0 && self.cfg.offset_end <= page.raw_offset {
                    break;
                }
                if page.index < self.cfg.page_start || page.raw_offset < self.cfg.offset_start {
                    outcome.skipped_window += 1;
                    continue;
                }
                let pos = page.pos.to_string();
                if self.seen.contains(&pos) {
                    outcome.skipped_seen += 1;
                    continue;
                }

                let Some(data) = self.read_with_retry(&page, &pos, &mut outcome, counters)? else {
                    continue;
                };

                hasher.feed(page.raw_offset, &data.data[..data.pagesize]);
                outcome.pages += 1;
                outcome.bytes += data.pagesize as u64;

                if outcome.pages % self.cfg.notify_rate == 0 {
                    self.notify(&pos, outcome.pages, target, start, is_sampling);
                }

                counters.in_flight.fetch_add(1, Ordering::AcqRel);
                let waiting = Instant::now();
                if tx.send(data).is_err() {
                    counters.in_flight.fetch_sub(1, Ordering::AcqRel);
                    return Err(PipelineError::WorkersGone);
                }
                outcome.producer_wait += waiting.elapsed();
            }
        }

        info!(
            pages = outcome.pages,
            bytes = outcome.bytes,
            skipped_seen = outcome.skipped_seen,
            skipped_window = outcome.skipped_window,
            "all pages scheduled"
        );
        Ok(outcome)
    }

    /// Read one page. Allocation failures are retried after a fixed interval
    /// and become fatal once the retry budget is spent; any other read error
    /// is reported and the page is skipped.
    fn read_with_retry(
        &self,
        page: &PageRef,
        pos: &str,
        outcome: &mut ScheduleOutcome,
        counters: &PipelineCounters,
    ) -> Result<Option<PageData>, PipelineError> {
        let interval = Duration::from_millis(self.cfg.alloc_retry_interval_ms);
        let mut failures = 0u32;
        loop {
            match self.image.read_page(page) {
                Ok(data) => return Ok(Some(data)),
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    self.report.emit(ReportEvent::DebugException {
                        pos: Some(pos.to_string()),
                        message: format!("{err} (attempt {failures})"),
                    });
                    if failures > self.cfg.max_alloc_retries {
                        return Err(PipelineError::MemoryExhausted {
                            pos: pos.to_string(),
                            attempts: failures,
                        });
                    }
                    outcome.alloc_retries += 1;
                    warn!(
                        pos,
                        attempt = failures,
                        "{err}; retrying in {} ms",
                        interval.as_millis()
                    );
                    thread::sleep(interval);
                }
                Err(err) => {
                    log_read_error(pos, &err);
                    counters.page_errors.fetch_add(1, Ordering::Relaxed);
                    self.report.emit(ReportEvent::DebugException {
                        pos: Some(pos.to_string()),
                        message: err.to_string(),
                    });
                    return Ok(None);
                }
            }
        }
    }

    fn notify(&self, pos: &str, done: u64, target: u64, start: Instant, is_sampling: bool) {
        let fraction = if target > 0 {
            done as f64 / target as f64
        } else {
            0.0
        };
        let elapsed = start.elapsed().as_secs_f64();
        if !is_sampling && fraction > 0.0 && fraction < 1.0 {
            let eta = elapsed * (1.0 - fraction) / fraction;
            info!(
                "page {pos} ({done}/{target}, {:.1}% done, eta {:.0}s)",
                fraction * 100.0,
                eta
            );
        } else {
            info!("page {pos} ({done}/{target}, {:.1}% done)", fraction * 100.0);
        }
    }

    /// Wait for in-flight pages. Returns `false` when the wait ceiling was
    /// hit and workers were left running.
    fn drain(&self, counters: &PipelineCounters, handles: &[WorkerHandle]) -> bool {
        let poll = Duration::from_millis(self.cfg.drain_poll_interval_ms);
        let ceiling = Duration::from_secs(self.cfg.max_drain_wait_secs);
        let start = Instant::now();
        let mut polls = 0u64;
        loop {
            let busy = counters.in_flight.load(Ordering::Acquire);
            if busy == 0 && handles.iter().all(|h| h.handle.is_finished()) {
                return true;
            }
            if start.elapsed() >= ceiling {
                error!(
                    busy,
                    waited_secs = start.elapsed().as_secs(),
                    "workers did not finish in time; giving up on them"
                );
                self.report
                    .comment(format!("drain gave up with {busy} pages in flight"));
                return false;
            }
            polls += 1;
            if polls % DRAIN_REPORT_EVERY == 0 {
                let msg = format!(
                    "waiting for {busy} pages in flight ({:.1}s)",
                    start.elapsed().as_secs_f64()
                );
                info!("{msg}");
                self.report.comment(msg);
            }
            thread::sleep(poll);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        outcome: ScheduleOutcome,
        hasher: ImageHasher,
        counters: &PipelineCounters,
        worker_ids: &[usize],
        worker_wait_secs: Vec<f64>,
        drained: bool,
        started: Instant,
    ) -> PipelineStats {
        self.scanners.shutdown(&self.recorders);
        if let Err(err) = self.recorders.flush_all() {
            warn!("failed to flush feature files: {err}");
        }

        let digest = hasher.finish(self.image.image_size());
        self.report.emit(ReportEvent::Source {
            image: self.image.image_identifier().to_string(),
            size: self.image.image_size(),
            hash_alg: digest.as_ref().map(|(alg, _)| alg.name().to_string()),
            digest: digest.as_ref().map(|(_, d)| d.clone()),
        });

        let feature_counts = self.recorders.counts();
        for (name, count) in &feature_counts {
            self.report.emit(ReportEvent::FeatureFile {
                name: name.clone(),
                count: *count,
            });
        }

        let producer_wait_secs = outcome.producer_wait.as_secs_f64();
        self.report.emit(ReportEvent::ThreadWait {
            thread: None,
            seconds: producer_wait_secs,
        });
        for (id, seconds) in worker_ids.iter().zip(&worker_wait_secs) {
            self.report.emit(ReportEvent::ThreadWait {
                thread: Some(*id),
                seconds: *seconds,
            });
        }

        for stat in self.scanners.stats() {
            self.report.emit(ReportEvent::ScannerStats {
                name: stat.name,
                calls: stat.calls,
                seconds: stat.seconds,
                errors: stat.errors,
            });
        }

        let hint = bound_hint(producer_wait_secs, &worker_wait_secs);
        let elapsed_secs = started.elapsed().as_secs_f64();
        let page_errors = counters.page_errors.load(Ordering::Relaxed);
        let scanner_errors = counters.scanner_errors.load(Ordering::Relaxed);
        self.report.emit(ReportEvent::Report {
            pages: outcome.pages,
            bytes: outcome.bytes,
            page_errors,
            scanner_errors,
            seconds: elapsed_secs,
            hint: hint.to_string(),
        });
        self.report.timestamp("phase1 end");

        info!(
            "run_summary pages={} bytes={} page_errors={} scanner_errors={} seconds={:.2}",
            outcome.pages, outcome.bytes, page_errors, scanner_errors, elapsed_secs
        );
        info!("{hint}");

        PipelineStats {
            pages_scheduled: outcome.pages,
            pages_skipped_seen: outcome.skipped_seen,
            pages_skipped_window: outcome.skipped_window,
            bytes_scheduled: outcome.bytes,
            page_errors,
            scanner_errors,
            alloc_retries: outcome.alloc_retries,
            hash_alg: self.cfg.hash_alg.name().to_string(),
            digest: digest.map(|(_, d)| d),
            producer_wait_secs,
            worker_wait_secs,
            elapsed_secs,
            drained,
            feature_counts,
        }
    }
}

fn log_read_error(pos: &str, err: &ImageError) {
    warn!(pos, "page read failed: {err}");
}

/// Producer blocked on busy workers means the scanners are the bottleneck;
/// workers idling for pages means the input is.
fn bound_hint(producer_wait: f64, worker_waits: &[f64]) -> &'static str {
    let avg_worker_wait = if worker_waits.is_empty() {
        0.0
    } else {
        worker_waits.iter().sum::<f64>() / worker_waits.len() as f64
    };
    if producer_wait > avg_worker_wait {
        "workers were the bottleneck (CPU-bound); more threads or faster cores would help"
    } else {
        "workers waited for pages (I/O-bound); faster storage would help"
    }
}

/// Everything a run needs besides the image and the scanners.
#[derive(Debug, Clone)]
pub struct RunOptions<'a> {
    pub cfg: &'a Config,
    pub config_hash: &'a str,
    pub outdir: &'a Path,
    pub scanner_commands: &'a [ScannerCommand],
    pub command_line: Vec<String>,
}

/// Set up the output directory, scanners, recorders and report for
/// `image`, then run Phase 1. Configuration and restart-consistency errors
/// are returned before anything in the output directory is touched.
pub fn run_scan(
    opts: &RunOptions<'_>,
    image: Arc<dyn ImageSource>,
    scanners: Vec<Box<dyn Scanner>>,
) -> Result<PipelineStats> {
    let cfg = opts.cfg;
    cfg.validate()?;

    let scanner_set = ScannerSet::load(
        scanners,
        &cfg.scanner_config(),
        opts.scanner_commands,
        cfg.max_depth,
    )
    .context("failed to load scanners")?;
    let allow = cfg
        .allow_list
        .as_deref()
        .map(WordList::read_file)
        .transpose()
        .context("failed to read allow list")?;
    let deny = cfg
        .deny_list
        .as_deref()
        .map(WordList::read_file)
        .transpose()
        .context("failed to read deny list")?;

    let input = image.image_identifier().to_string();
    let state = checkpoint::prepare_output(opts.outdir, &input)?;
    crate::util::ensure_output_dir(opts.outdir)?;

    let recorders = FeatureRecorderSet::new(
        &scanner_set.sinks(),
        RecorderOptions {
            outdir: Some(opts.outdir.to_path_buf()),
            image_id: input.clone(),
            append: state.is_restart(),
            hash_alg: cfg.hash_alg,
            allow,
            deny,
            disabled: false,
        },
    )
    .context("failed to open feature files")?;

    let report = RunReport::create(opts.outdir).context("failed to create run report")?;
    if let OutputState::Restart {
        previous_report, ..
    } = &state
    {
        report.record(&ReportEvent::Restarted {
            previous_report: previous_report.clone(),
        })?;
    }
    report.record(&ReportEvent::RunStart {
        run_id: cfg.run_id.clone(),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        config_hash: opts.config_hash.to_string(),
        command_line: opts.command_line.clone(),
        threads: cfg.worker_count(),
        page_size: cfg.page_size,
        margin: cfg.margin,
        max_depth: cfg.max_depth,
    })?;
    report.record(&ReportEvent::ProvidedFilename {
        filename: input.clone(),
    })?;
    report.timestamp("phase1 start");

    let seen = match state {
        OutputState::Restart { seen, .. } => seen,
        OutputState::Fresh => HashSet::new(),
    };
    let report = Arc::new(report);
    let stats = PageScheduler::new(
        cfg,
        image,
        Arc::new(scanner_set),
        Arc::new(recorders),
        report.clone(),
        seen,
    )
    .run()?;

    report.emit(ReportEvent::RunEnd {
        at: chrono::Utc::now().to_rfc3339(),
    });
    Ok(stats)
}
