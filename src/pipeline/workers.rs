//! # Pipeline Workers
//!
//! Page worker threads. Each worker takes one page at a time from the
//! scheduler, marks it started in the run report, runs the scanner set over
//! it and marks it finished. A failure or panic while processing a page is
//! confined to that page.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::Receiver;
use tracing::{debug, error, warn};

use crate::image::PageData;
use crate::recorder::FeatureRecorderSet;
use crate::report::{ReportEvent, RunReport};
use crate::scanner::{ScannerSet, panic_message};

/// State shared by every worker.
#[derive(Clone)]
pub struct WorkerShared {
    pub scanners: Arc<ScannerSet>,
    pub recorders: Arc<FeatureRecorderSet>,
    pub report: Arc<RunReport>,
    /// Pages handed off and not yet finished.
    pub in_flight: Arc<AtomicUsize>,
    pub pages_done: Arc<AtomicU64>,
    pub page_errors: Arc<AtomicU64>,
    pub scanner_errors: Arc<AtomicU64>,
}

pub struct WorkerHandle {
    pub id: usize,
    pub handle: thread::JoinHandle<()>,
    /// Nanoseconds spent waiting for the next page.
    pub wait_nanos: Arc<AtomicU64>,
}

impl WorkerHandle {
    pub fn wait_seconds(&self) -> f64 {
        self.wait_nanos.load(Ordering::Relaxed) as f64 / 1e9
    }
}

pub fn spawn_page_workers(
    workers: usize,
    rx: Receiver<PageData>,
    shared: WorkerShared,
) -> Vec<WorkerHandle> {
    let worker_count = workers.max(1);
    let mut handles = Vec::with_capacity(worker_count);

    for id in 0..worker_count {
        let rx = rx.clone();
        let shared = shared.clone();
        let wait_nanos = Arc::new(AtomicU64::new(0));
        let wait = wait_nanos.clone();

        let handle = thread::spawn(move || {
            loop {
                let waiting = Instant::now();
                let Ok(page) = rx.recv() else {
                    break;
                };
                wait.fetch_add(waiting.elapsed().as_nanos() as u64, Ordering::Relaxed);
                process_page(id, page, &shared);
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            debug!(worker = id, "worker exiting");
        });

        handles.push(WorkerHandle {
            id,
            handle,
            wait_nanos,
        });
    }

    handles
}

fn process_page(id: usize, page: PageData, shared: &WorkerShared) {
    let pos = page.page.pos.to_string();
    shared.report.emit(ReportEvent::WorkStart {
        pos: pos.clone(),
        thread: id,
    });
    let start = Instant::now();
    let sbuf = page.into_sbuf();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        shared.scanners.process(&sbuf, &shared.recorders)
    }));
    match result {
        Ok(errors) => {
            if errors > 0 {
                shared.scanner_errors.fetch_add(errors, Ordering::Relaxed);
            }
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            shared.page_errors.fetch_add(1, Ordering::Relaxed);
            error!(pos = %pos, worker = id, "page processing panicked: {message}");
            shared.report.emit(ReportEvent::DebugException {
                pos: Some(pos.clone()),
                message: format!("panic: {message}"),
            });
        }
    }

    // Records must be on disk before work_end; a restart trusts work_start.
    if let Err(err) = shared.recorders.flush_all() {
        shared.page_errors.fetch_add(1, Ordering::Relaxed);
        warn!(pos = %pos, worker = id, "feature flush error: {err}");
    }

    shared.pages_done.fetch_add(1, Ordering::Relaxed);
    shared.report.emit(ReportEvent::WorkEnd {
        pos,
        thread: id,
        seconds: start.elapsed().as_secs_f64(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_render() {
        let caught = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 7");
        let caught = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static");
    }
}
