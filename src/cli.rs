use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;

use crate::config::Config;
use crate::hashing::HashAlg;
use crate::scanner::ScannerCommand;
use crate::util;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    /// Input image: a raw image file or a directory of files
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output directory for feature files and the run report
    #[arg(short, long)]
    pub output: PathBuf,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Number of worker threads (0 = one per CPU)
    #[arg(short = 'j', long)]
    pub threads: Option<usize>,

    /// Page size, with optional k/m/g suffix
    #[arg(short = 'G', long, value_parser = parse_size)]
    pub page_size: Option<u64>,

    /// Margin read past each page, with optional k/m/g suffix
    #[arg(short = 'g', long, value_parser = parse_size)]
    pub margin: Option<u64>,

    /// Maximum recursion depth for container scanners
    #[arg(short = 'M', long)]
    pub max_depth: Option<u32>,

    /// Attempts to allocate a page before giving up
    #[arg(long)]
    pub max_alloc_retries: Option<u32>,

    /// Random sampling as fraction[:passes]
    #[arg(short = 's', long)]
    pub sampling: Option<String>,

    /// Seed for sampling (default: clock)
    #[arg(long)]
    pub sampling_seed: Option<u64>,

    /// Only scan offsets start[-end], with optional k/m/g/t suffixes
    #[arg(short = 'Y', long)]
    pub offsets: Option<String>,

    /// Page index to start from
    #[arg(long)]
    pub page_start: Option<u64>,

    /// Only record features matching this word list
    #[arg(short = 'w', long)]
    pub allow_list: Option<PathBuf>,

    /// Divert features matching this word list to the stopped files
    #[arg(short = 'W', long)]
    pub deny_list: Option<PathBuf>,

    /// Hash algorithm for the image digest and feature dedup (md5, sha1, sha256)
    #[arg(long)]
    pub hash_alg: Option<HashAlg>,

    /// Scanner setting name=value
    #[arg(short = 'S', long = "set")]
    pub settings: Vec<String>,

    /// Disable all scanners, then enable this one
    #[arg(short = 'E', long)]
    pub enable_only: Option<String>,

    /// Enable a scanner
    #[arg(short = 'e', long)]
    pub enable: Vec<String>,

    /// Disable a scanner
    #[arg(short = 'x', long)]
    pub disable: Vec<String>,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

fn parse_size(text: &str) -> Result<u64, String> {
    util::parse_scaled_size(text).map_err(|e| e.to_string())
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}

impl CliOptions {
    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply_to(&self, cfg: &mut Config) -> Result<()> {
        if let Some(threads) = self.threads {
            cfg.threads = threads;
        }
        if let Some(page_size) = self.page_size {
            cfg.page_size = page_size;
        }
        if let Some(margin) = self.margin {
            cfg.margin = margin;
        }
        if let Some(depth) = self.max_depth {
            cfg.max_depth = depth;
        }
        if let Some(retries) = self.max_alloc_retries {
            cfg.max_alloc_retries = retries;
        }
        if let Some(sampling) = &self.sampling {
            cfg.sampling = Some(sampling.clone());
        }
        if let Some(seed) = self.sampling_seed {
            cfg.sampling_seed = Some(seed);
        }
        if let Some(window) = &self.offsets {
            let (start, end) = util::parse_offset_window(window)?;
            cfg.offset_start = start;
            cfg.offset_end = end;
        }
        if let Some(page_start) = self.page_start {
            cfg.page_start = page_start;
        }
        if let Some(path) = &self.allow_list {
            cfg.allow_list = Some(path.clone());
        }
        if let Some(path) = &self.deny_list {
            cfg.deny_list = Some(path.clone());
        }
        if let Some(alg) = self.hash_alg {
            cfg.hash_alg = alg;
        }
        for assignment in &self.settings {
            let (name, value) = assignment
                .split_once('=')
                .ok_or_else(|| anyhow!("scanner setting must be name=value: '{assignment}'"))?;
            cfg.scanner_settings.insert(
                name.trim().to_string(),
                serde_yaml::Value::String(value.to_string()),
            );
        }
        Ok(())
    }

    /// Enable/disable commands: `-E` first, then `-e`, then `-x`.
    pub fn scanner_commands(&self) -> Vec<ScannerCommand> {
        let mut commands = Vec::new();
        if let Some(name) = &self.enable_only {
            commands.push(ScannerCommand::EnableOnly(name.clone()));
        }
        commands.extend(self.enable.iter().cloned().map(ScannerCommand::Enable));
        commands.extend(self.disable.iter().cloned().map(ScannerCommand::Disable));
        commands
    }
}
