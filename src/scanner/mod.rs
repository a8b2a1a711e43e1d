//! # Scanner Registry & Dispatcher
//!
//! Scanners are plugins with three phases. STARTUP runs once per scanner
//! while the registry is built and returns its [`ScannerInfo`]. SCAN runs
//! concurrently on different buffers. SHUTDOWN runs once after all pages are
//! done.
//!
//! Recursive scanners never call each other directly. They ask the
//! [`ScanContext`] whether an embedded object may be expanded
//! ([`ScanContext::admit`]) and hand the child buffer back to the dispatcher
//! ([`ScanContext::recurse`]), which enforces the depth limit and content
//! dedup for every scanner in the same way.

pub mod zip;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::position::PositionPath;
use crate::recorder::{FeatureRecorder, FeatureRecorderSet, RecorderError, SinkSpec};
use crate::sbuf::{Sbuf, SbufError};

pub const DEFAULT_MAX_DEPTH: u32 = 7;

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("unknown scanner: {0}")]
    UnknownScanner(String),
    #[error("invalid scanner setting: {0}")]
    InvalidSetting(String),
    #[error("buffer error: {0}")]
    Sbuf(#[from] SbufError),
    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),
    #[error("scanner failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScannerFlags {
    /// Produces child buffers.
    pub recurse: bool,
    /// Child buffers are expansions (decompressed or decoded data).
    pub recurse_expand: bool,
}

/// What a scanner reports about itself during STARTUP.
#[derive(Debug, Clone)]
pub struct ScannerInfo {
    pub name: String,
    pub description: String,
    pub sinks: Vec<SinkSpec>,
    pub flags: ScannerFlags,
    /// Overrides the global recursion limit for this scanner.
    pub max_depth: Option<u32>,
    pub default_enabled: bool,
}

impl ScannerInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            sinks: Vec::new(),
            flags: ScannerFlags::default(),
            max_depth: None,
            default_enabled: true,
        }
    }
}

pub trait Scanner: Send + Sync {
    fn startup(&mut self, config: &ScannerConfig) -> ScannerInfo;

    fn scan(&self, sbuf: &Sbuf<'_>, ctx: &mut ScanContext<'_>) -> Result<(), ScannerError>;

    fn shutdown(&self, _recorders: &FeatureRecorderSet) -> Result<(), ScannerError> {
        Ok(())
    }
}

/// Flat `name -> value` settings, filled from the config file's
/// `scanner_settings` map and `-S name=value` flags.
#[derive(Debug, Clone, Default)]
pub struct ScannerConfig {
    values: BTreeMap<String, String>,
}

impl ScannerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    /// Apply a `name=value` assignment.
    pub fn apply_assignment(&mut self, assignment: &str) -> Result<(), ScannerError> {
        let (name, value) = assignment
            .split_once('=')
            .ok_or_else(|| ScannerError::InvalidSetting(assignment.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ScannerError::InvalidSetting(assignment.to_string()));
        }
        self.set(name, value.trim());
        Ok(())
    }

    pub fn raw(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Typed lookup. A value that does not parse is reported and the default
    /// is kept.
    pub fn get<T: FromStr>(&self, name: &str, default: T) -> T {
        match self.values.get(name) {
            None => default,
            Some(raw) => match raw.parse::<T>() {
                Ok(value) => value,
                Err(_) => {
                    warn!(setting = name, value = %raw, "unparsable scanner setting, keeping default");
                    default
                }
            },
        }
    }

    /// Like [`get`](Self::get) for byte sizes; accepts `k`/`m`/`g`/`t` suffixes.
    pub fn get_size(&self, name: &str, default: u64) -> u64 {
        match self.values.get(name) {
            None => default,
            Some(raw) => match crate::util::parse_scaled_size(raw) {
                Ok(value) => value,
                Err(_) => {
                    warn!(setting = name, value = %raw, "unparsable scanner setting, keeping default");
                    default
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerCommand {
    /// Disable every scanner, then enable this one.
    EnableOnly(String),
    Enable(String),
    Disable(String),
}

/// Outcome of [`ScanContext::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    MaxDepth,
    PreviouslyProcessed,
}

#[derive(Debug, Default)]
struct ScannerStats {
    calls: AtomicU64,
    nanos: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScannerStat {
    pub name: String,
    pub calls: u64,
    pub seconds: f64,
    pub errors: u64,
}

struct Registered {
    scanner: Box<dyn Scanner>,
    info: ScannerInfo,
    enabled: bool,
    stats: ScannerStats,
}

/// Immutable after [`ScannerSet::load`]; shared by all workers through `Arc`.
pub struct ScannerSet {
    scanners: Vec<Registered>,
    max_depth: u32,
}

impl std::fmt::Debug for ScannerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerSet")
            .field("enabled", &self.enabled_names())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

/// Every scanner this crate ships, in dispatch order.
pub fn builtin_scanners() -> Vec<Box<dyn Scanner>> {
    vec![Box::new(zip::ZipScanner::default())]
}

impl ScannerSet {
    /// Run STARTUP on each scanner and apply the enable/disable commands in
    /// order.
    pub fn load(
        scanners: Vec<Box<dyn Scanner>>,
        config: &ScannerConfig,
        commands: &[ScannerCommand],
        max_depth: u32,
    ) -> Result<Self, ScannerError> {
        let mut registered: Vec<Registered> = scanners
            .into_iter()
            .map(|mut scanner| {
                let info = scanner.startup(config);
                debug!(scanner = %info.name, sinks = info.sinks.len(), "scanner started");
                Registered {
                    enabled: info.default_enabled,
                    scanner,
                    info,
                    stats: ScannerStats::default(),
                }
            })
            .collect();

        for command in commands {
            let (name, enable) = match command {
                ScannerCommand::EnableOnly(name) => {
                    for reg in registered.iter_mut() {
                        reg.enabled = false;
                    }
                    (name, true)
                }
                ScannerCommand::Enable(name) => (name, true),
                ScannerCommand::Disable(name) => (name, false),
            };
            let reg = registered
                .iter_mut()
                .find(|r| r.info.name == *name)
                .ok_or_else(|| ScannerError::UnknownScanner(name.clone()))?;
            reg.enabled = enable;
        }

        let set = Self {
            scanners: registered,
            max_depth,
        };
        info!(enabled = ?set.enabled_names(), max_depth, "scanner set loaded");
        Ok(set)
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn enabled_names(&self) -> Vec<&str> {
        self.scanners
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.info.name.as_str())
            .collect()
    }

    pub fn info(&self, name: &str) -> Option<&ScannerInfo> {
        self.scanners
            .iter()
            .find(|r| r.info.name == name)
            .map(|r| &r.info)
    }

    /// Sinks of the enabled scanners. The recorder set adds `alert`.
    pub fn sinks(&self) -> Vec<SinkSpec> {
        let mut by_name: HashMap<&str, SinkSpec> = HashMap::new();
        for reg in self.scanners.iter().filter(|r| r.enabled) {
            for sink in &reg.info.sinks {
                by_name
                    .entry(sink.name.as_str())
                    .and_modify(|s| s.xml |= sink.xml)
                    .or_insert_with(|| sink.clone());
            }
        }
        let mut sinks: Vec<SinkSpec> = by_name.into_values().collect();
        sinks.sort_by(|a, b| a.name.cmp(&b.name));
        sinks
    }

    /// Run every enabled scanner on `sbuf`. A scanner's error is logged and
    /// counted and the remaining scanners still run. Returns the number of
    /// scanner errors on this buffer, including those of nested children.
    ///
    /// Per-scanner time excludes the time spent in child buffers, which is
    /// charged to the scanners that process them.
    pub fn process(&self, sbuf: &Sbuf<'_>, recorders: &FeatureRecorderSet) -> u64 {
        let mut errors = 0u64;
        for (idx, reg) in self.scanners.iter().enumerate() {
            if !reg.enabled {
                continue;
            }
            let mut ctx = ScanContext {
                set: self,
                recorders,
                pos0: &sbuf.pos0,
                scanner: idx,
                depth: sbuf.depth(),
                alerted: false,
                child_errors: 0,
                child_nanos: 0,
            };
            let start = Instant::now();
            let result = reg.scanner.scan(sbuf, &mut ctx);
            let own = (start.elapsed().as_nanos() as u64).saturating_sub(ctx.child_nanos);
            reg.stats.calls.fetch_add(1, Ordering::Relaxed);
            reg.stats.nanos.fetch_add(own, Ordering::Relaxed);
            errors += ctx.child_errors;
            if let Err(err) = result {
                reg.stats.errors.fetch_add(1, Ordering::Relaxed);
                errors += 1;
                warn!(pos = %sbuf.pos0, scanner = %reg.info.name, "scanner error: {err}");
            }
        }
        errors
    }

    /// SHUTDOWN phase for every enabled scanner.
    pub fn shutdown(&self, recorders: &FeatureRecorderSet) {
        for reg in self.scanners.iter().filter(|r| r.enabled) {
            if let Err(err) = reg.scanner.shutdown(recorders) {
                warn!(scanner = %reg.info.name, "scanner shutdown failed: {err}");
            }
        }
    }

    pub fn stats(&self) -> Vec<ScannerStat> {
        self.scanners
            .iter()
            .filter(|r| r.enabled)
            .map(|r| ScannerStat {
                name: r.info.name.clone(),
                calls: r.stats.calls.load(Ordering::Relaxed),
                seconds: r.stats.nanos.load(Ordering::Relaxed) as f64 / 1e9,
                errors: r.stats.errors.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Per-scanner, per-buffer view of the dispatcher.
pub struct ScanContext<'a> {
    set: &'a ScannerSet,
    recorders: &'a FeatureRecorderSet,
    pos0: &'a PositionPath,
    scanner: usize,
    depth: u32,
    alerted: bool,
    child_errors: u64,
    child_nanos: u64,
}

impl<'a> ScanContext<'a> {
    pub fn recorders(&self) -> &'a FeatureRecorderSet {
        self.recorders
    }

    pub fn recorder(&self, name: &str) -> Result<&'a FeatureRecorder, ScannerError> {
        Ok(self.recorders.get(name)?)
    }

    /// Depth of the buffer being scanned.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn info(&self) -> &'a ScannerInfo {
        &self.set.scanners[self.scanner].info
    }

    /// Recursion limit for the running scanner.
    pub fn max_depth(&self) -> u32 {
        self.info().max_depth.unwrap_or(self.set.max_depth)
    }

    /// Decide whether an embedded object found at `pos` may be expanded.
    /// `payload` is the object's raw bytes, used for content dedup. The depth
    /// limit is checked first; the first refusal on a buffer writes the
    /// `MAX DEPTH DETECTED` alert at the buffer's start.
    pub fn admit(&mut self, pos: &PositionPath, payload: &[u8]) -> Admission {
        if pos.depth() >= self.max_depth() {
            if !self.alerted {
                self.alerted = true;
                let feature = format!("{}: MAX DEPTH DETECTED", self.info().name);
                if let Err(err) = self.recorders.alert().write(self.pos0, &feature, "") {
                    warn!(pos = %self.pos0, "failed to write alert: {err}");
                }
            }
            return Admission::MaxDepth;
        }
        if self.recorders.check_previously_processed(payload) {
            return Admission::PreviouslyProcessed;
        }
        Admission::Proceed
    }

    /// Dispatch `child` to every enabled scanner on this thread. Returns
    /// `false` without scanning when the child is deeper than the limit.
    /// A panic while scanning the child is contained to the child: it is
    /// logged, counted as an error and the caller keeps scanning.
    pub fn recurse(&mut self, child: &Sbuf<'_>) -> bool {
        if child.depth() > self.max_depth() {
            warn!(
                pos = %child.pos0,
                scanner = %self.info().name,
                "refusing child buffer beyond max depth"
            );
            return false;
        }
        let start = Instant::now();
        let set = self.set;
        let recorders = self.recorders;
        let result = panic::catch_unwind(AssertUnwindSafe(|| set.process(child, recorders)));
        self.child_nanos += start.elapsed().as_nanos() as u64;
        match result {
            Ok(errors) => self.child_errors += errors,
            Err(payload) => {
                self.child_errors += 1;
                error!(
                    pos = %child.pos0,
                    scanner = %self.info().name,
                    "child buffer processing panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        true
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
