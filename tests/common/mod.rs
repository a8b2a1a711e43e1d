//! Shared helpers for the end-to-end scan tests: synthetic ZIP members,
//! small-page configurations and readers for the files a run leaves behind.

#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::DeflateEncoder;
use serde_json::Value;

use pagesift::config::Config;
use pagesift::image::{ImageSource, PageGeometry, RawImage};
use pagesift::pipeline::{self, PipelineStats, RunOptions};
use pagesift::scanner::{self, Scanner, ScannerCommand};

pub const PAGE: u64 = 4096;
pub const MARGIN: u64 = 1024;

/// A local file header followed by `data` as stored.
pub fn stored_entry(name: &str, data: &[u8]) -> Vec<u8> {
    local_entry(name, 0, data, data.len() as u32)
}

/// A local file header followed by raw-deflated `content`.
pub fn deflated_entry(name: &str, content: &[u8]) -> Vec<u8> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(content).expect("deflate");
    let compressed = enc.finish().expect("deflate finish");
    local_entry(name, 8, &compressed, content.len() as u32)
}

/// Deflated member written by a streaming archiver: both sizes left at zero.
pub fn streamed_entry(name: &str, content: &[u8]) -> Vec<u8> {
    let mut entry = deflated_entry(name, content);
    entry[18..26].fill(0);
    entry
}

fn local_entry(name: &str, method: u16, data: &[u8], uncompr: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"PK\x03\x04");
    out.extend_from_slice(&20u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&method.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&uncompr.to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(data);
    out
}

pub fn insert_bytes(target: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if end > target.len() {
        target.resize(end, 0u8);
    }
    target[offset..end].copy_from_slice(data);
}

/// Small pages so a few kilobytes make a multi-page image.
pub fn test_config() -> Config {
    Config {
        run_id: "test_run".to_string(),
        page_size: PAGE,
        margin: MARGIN,
        threads: 2,
        alloc_retry_interval_ms: 1,
        drain_poll_interval_ms: 5,
        max_drain_wait_secs: 30,
        ..Config::default()
    }
}

pub fn open_raw(path: &Path, cfg: &Config) -> Arc<dyn ImageSource> {
    let geometry = PageGeometry::new(cfg.page_size, cfg.margin).expect("geometry");
    Arc::new(RawImage::open(path, geometry).expect("open image"))
}

pub fn run_with(
    cfg: &Config,
    image: Arc<dyn ImageSource>,
    outdir: &Path,
    scanners: Vec<Box<dyn Scanner>>,
    commands: &[ScannerCommand],
) -> anyhow::Result<PipelineStats> {
    let opts = RunOptions {
        cfg,
        config_hash: "test",
        outdir,
        scanner_commands: commands,
        command_line: vec!["pagesift".to_string()],
    };
    pipeline::run_scan(&opts, image, scanners)
}

/// Run the built-in scanners over the raw image at `input`.
pub fn run_raw(cfg: &Config, input: &Path, outdir: &Path) -> anyhow::Result<PipelineStats> {
    run_with(
        cfg,
        open_raw(input, cfg),
        outdir,
        scanner::builtin_scanners(),
        &[],
    )
}

/// `(pos, feature, context)` for every record in a feature file.
pub fn read_features(outdir: &Path, name: &str) -> Vec<(String, String, String)> {
    let path = outdir.join(format!("{name}.txt"));
    let content = fs::read_to_string(path).expect("feature file read");
    content
        .lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.splitn(3, '\t');
            let pos = fields.next().unwrap_or_default().to_string();
            let feature = fields.next().unwrap_or_default().to_string();
            let context = fields.next().unwrap_or_default().to_string();
            (pos, feature, context)
        })
        .collect()
}

pub fn read_report(outdir: &Path) -> Vec<Value> {
    let content = fs::read_to_string(outdir.join("report.jsonl")).expect("report read");
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("json"))
        .collect()
}

pub fn events<'a>(report: &'a [Value], kind: &str) -> Vec<&'a Value> {
    report.iter().filter(|e| e["event"] == kind).collect()
}
