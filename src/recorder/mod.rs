//! # Feature Recorders
//!
//! Named output sinks shared by every worker thread. Each sink appends
//! `path\tfeature\tcontext` lines to `<outdir>/<name>.txt`, filtered through
//! the allow and deny lists, and keeps a running count. The set also owns the
//! content-dedup table recursive scanners consult before re-scanning an
//! embedded object.

pub mod wordlist;

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::hashing::HashAlg;
use crate::position::PositionPath;

pub use wordlist::WordList;

pub const ALERT_RECORDER_NAME: &str = "alert";
const FEATURE_FILE_VERSION: &str = "1.1";

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("feature recorder not found: {0}")]
    NotFound(String),
    #[error("word list error: {0}")]
    WordList(String),
}

/// Declares a sink a scanner writes to. `xml` marks sinks whose context
/// column carries structured markup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SinkSpec {
    pub name: String,
    pub xml: bool,
}

impl SinkSpec {
    pub fn plain(name: &str) -> Self {
        Self {
            name: name.to_string(),
            xml: false,
        }
    }

    pub fn xml(name: &str) -> Self {
        Self {
            name: name.to_string(),
            xml: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureRecord {
    pub pos: String,
    pub feature: String,
    pub context: String,
}

enum Output {
    File(Mutex<BufWriter<File>>),
    Memory(Mutex<Vec<FeatureRecord>>),
    /// Dry run: counted, never stored.
    Discard,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Output {
    fn append(&self, record: FeatureRecord) -> Result<(), RecorderError> {
        match self {
            Output::File(writer) => {
                let mut guard = lock(writer);
                writeln!(
                    guard,
                    "{}\t{}\t{}",
                    record.pos, record.feature, record.context
                )?;
            }
            Output::Memory(records) => lock(records).push(record),
            Output::Discard => {}
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), RecorderError> {
        if let Output::File(writer) = self {
            lock(writer).flush()?;
        }
        Ok(())
    }
}

pub struct FeatureRecorder {
    name: String,
    xml: bool,
    output: Output,
    stopped: Option<Output>,
    allow: Option<Arc<WordList>>,
    deny: Option<Arc<WordList>>,
    count: AtomicU64,
    stopped_count: AtomicU64,
}

impl std::fmt::Debug for FeatureRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureRecorder")
            .field("name", &self.name)
            .field("xml", &self.xml)
            .field("count", &self.count())
            .finish()
    }
}

impl FeatureRecorder {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_xml(&self) -> bool {
        self.xml
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn stopped_count(&self) -> u64 {
        self.stopped_count.load(Ordering::Relaxed)
    }

    /// Append one feature. Safe to call from any worker thread.
    pub fn write(
        &self,
        pos: &PositionPath,
        feature: &str,
        context: &str,
    ) -> Result<(), RecorderError> {
        let record = FeatureRecord {
            pos: pos.to_string(),
            feature: if self.xml {
                quote(&xml_escape(feature))
            } else {
                quote(feature)
            },
            context: quote(context),
        };

        if let Some(deny) = &self.deny {
            if deny.matches(feature) {
                self.stopped_count.fetch_add(1, Ordering::Relaxed);
                if let Some(stopped) = &self.stopped {
                    stopped.append(record)?;
                }
                return Ok(());
            }
        }
        if let Some(allow) = &self.allow {
            if !allow.matches(feature) {
                return Ok(());
            }
        }

        self.output.append(record)?;
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Records captured by an in-memory recorder; empty for file recorders.
    pub fn records(&self) -> Vec<FeatureRecord> {
        match &self.output {
            Output::Memory(records) => lock(records).clone(),
            Output::File(_) | Output::Discard => Vec::new(),
        }
    }

    pub fn flush(&self) -> Result<(), RecorderError> {
        self.output.flush()?;
        if let Some(stopped) = &self.stopped {
            stopped.flush()?;
        }
        Ok(())
    }
}

/// Where and how a recorder set writes.
#[derive(Debug, Clone, Default)]
pub struct RecorderOptions {
    /// `None` keeps records in memory.
    pub outdir: Option<PathBuf>,
    pub image_id: String,
    /// Keep existing feature files (restart) instead of truncating them.
    pub append: bool,
    pub hash_alg: HashAlg,
    pub allow: Option<WordList>,
    pub deny: Option<WordList>,
    /// Count features without writing them anywhere.
    pub disabled: bool,
}

/// Per-sink flags settable before the set is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Features are XML-escaped before quoting.
    Xml,
}

pub struct FeatureRecorderSet {
    recorders: HashMap<String, FeatureRecorder>,
    seen: Mutex<HashSet<String>>,
    hash_alg: HashAlg,
}

impl FeatureRecorderSet {
    /// Build one recorder per spec, plus the `alert` recorder.
    pub fn new(specs: &[SinkSpec], opts: RecorderOptions) -> Result<Self, RecorderError> {
        let allow = opts.allow.filter(|l| !l.is_empty()).map(Arc::new);
        let deny = opts.deny.filter(|l| !l.is_empty()).map(Arc::new);

        let mut all: Vec<SinkSpec> = specs.to_vec();
        if !all.iter().any(|s| s.name == ALERT_RECORDER_NAME) {
            all.push(SinkSpec::plain(ALERT_RECORDER_NAME));
        }

        let mut recorders = HashMap::new();
        for spec in all {
            if let Some(existing) = recorders.get_mut(&spec.name) {
                let existing: &mut FeatureRecorder = existing;
                existing.xml |= spec.xml;
                continue;
            }
            let (output, stopped) = match &opts.outdir {
                _ if opts.disabled => (Output::Discard, deny.as_ref().map(|_| Output::Discard)),
                Some(dir) => {
                    let output = open_feature_file(
                        &dir.join(format!("{}.txt", spec.name)),
                        &spec.name,
                        &opts.image_id,
                        opts.append,
                    )?;
                    let stopped = if deny.is_some() {
                        Some(open_feature_file(
                            &dir.join(format!("{}_stopped.txt", spec.name)),
                            &spec.name,
                            &opts.image_id,
                            opts.append,
                        )?)
                    } else {
                        None
                    };
                    (output, stopped)
                }
                None => (
                    Output::Memory(Mutex::new(Vec::new())),
                    deny.as_ref().map(|_| Output::Memory(Mutex::new(Vec::new()))),
                ),
            };
            // The alert sink reports everything it is given.
            let is_alert = spec.name == ALERT_RECORDER_NAME;
            recorders.insert(
                spec.name.clone(),
                FeatureRecorder {
                    name: spec.name.clone(),
                    xml: spec.xml,
                    output,
                    stopped,
                    allow: if is_alert { None } else { allow.clone() },
                    deny: if is_alert { None } else { deny.clone() },
                    count: AtomicU64::new(0),
                    stopped_count: AtomicU64::new(0),
                },
            );
        }

        Ok(Self {
            recorders,
            seen: Mutex::new(HashSet::new()),
            hash_alg: opts.hash_alg,
        })
    }

    /// In-memory set, handy for tests and dry runs.
    pub fn in_memory(specs: &[SinkSpec]) -> Self {
        let mut recorders: HashMap<String, FeatureRecorder> = HashMap::new();
        let alert = SinkSpec::plain(ALERT_RECORDER_NAME);
        for spec in specs.iter().chain(std::iter::once(&alert)) {
            recorders
                .entry(spec.name.clone())
                .and_modify(|r| r.xml |= spec.xml)
                .or_insert_with(|| FeatureRecorder {
                    name: spec.name.clone(),
                    xml: spec.xml,
                    output: Output::Memory(Mutex::new(Vec::new())),
                    stopped: None,
                    allow: None,
                    deny: None,
                    count: AtomicU64::new(0),
                    stopped_count: AtomicU64::new(0),
                });
        }
        Self {
            recorders,
            seen: Mutex::new(HashSet::new()),
            hash_alg: HashAlg::default(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&FeatureRecorder, RecorderError> {
        self.recorders
            .get(name)
            .ok_or_else(|| RecorderError::NotFound(name.to_string()))
    }

    pub fn set_flag(&mut self, name: &str, flag: Flag) -> Result<(), RecorderError> {
        let recorder = self
            .recorders
            .get_mut(name)
            .ok_or_else(|| RecorderError::NotFound(name.to_string()))?;
        match flag {
            Flag::Xml => recorder.xml = true,
        }
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.recorders.contains_key(name)
    }

    pub fn alert(&self) -> &FeatureRecorder {
        // Always inserted by `new`.
        &self.recorders[ALERT_RECORDER_NAME]
    }

    pub fn hash_alg(&self) -> HashAlg {
        self.hash_alg
    }

    /// Record `bytes` as processed. Returns `false` for the first caller with
    /// a given content and `true` for every later one.
    pub fn check_previously_processed(&self, bytes: &[u8]) -> bool {
        let digest = self.hash_alg.hash_hex(bytes);
        !lock(&self.seen).insert(digest)
    }

    /// `(name, count)` for every sink, sorted by name.
    pub fn counts(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self
            .recorders
            .values()
            .map(|r| (r.name.clone(), r.count()))
            .collect();
        counts.sort();
        counts
    }

    pub fn flush_all(&self) -> Result<(), RecorderError> {
        for recorder in self.recorders.values() {
            recorder.flush()?;
        }
        Ok(())
    }
}

fn open_feature_file(
    path: &Path,
    name: &str,
    image_id: &str,
    append: bool,
) -> Result<Output, RecorderError> {
    let existed = path.exists();
    let file = if append {
        OpenOptions::new().create(true).append(true).open(path)?
    } else {
        File::create(path)?
    };
    let mut writer = BufWriter::new(file);
    if !append || !existed {
        writeln!(writer, "# pagesift {}", env!("CARGO_PKG_VERSION"))?;
        writeln!(writer, "# Feature-Recorder: {name}")?;
        writeln!(writer, "# Filename: {image_id}")?;
        writeln!(writer, "# Feature-File-Version: {FEATURE_FILE_VERSION}")?;
    }
    Ok(Output::File(Mutex::new(writer)))
}

pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape control characters and backslashes as `\xHH` so every record
/// stays on one tab-separated line.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch == '\\' || (ch as u32) < 0x20 || ch == '\u{7f}' {
            out.push_str(&format!("\\x{:02X}", ch as u32));
        } else {
            out.push(ch);
        }
    }
    out
}
