//! # Utility Module
//!
//! Size parsing for command-line values and output directory checks.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::warn;

/// Parse a byte count with an optional `k`/`m`/`g`/`t` suffix (powers of
/// 1024, case-insensitive).
pub fn parse_scaled_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (digits, shift) = match text.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&text[..text.len() - 1], 10),
        Some('m') => (&text[..text.len() - 1], 20),
        Some('g') => (&text[..text.len() - 1], 30),
        Some('t') => (&text[..text.len() - 1], 40),
        _ => (text, 0),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid size: '{text}'"))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| anyhow!("size out of range: '{text}'"))
}

/// Parse `start[-end]`. A missing end is returned as 0 (to the end of the
/// image).
pub fn parse_offset_window(text: &str) -> Result<(u64, u64)> {
    match text.split_once('-') {
        Some((start, end)) => {
            let start = parse_scaled_size(start)?;
            let end = parse_scaled_size(end)?;
            if end <= start {
                return Err(anyhow!("offset window end must be after start: '{text}'"));
            }
            Ok((start, end))
        }
        None => Ok((parse_scaled_size(text)?, 0)),
    }
}

/// Check that an existing output directory is writable, warning on unsafe
/// permissions.
pub fn ensure_output_dir(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_dir() {
        return Err(anyhow!("output path is not a directory: {}", path.display()));
    }

    let check_path = path.join(".pagesift_write_check");
    match OpenOptions::new().write(true).create(true).open(&check_path) {
        Ok(_) => {
            let _ = std::fs::remove_file(&check_path);
        }
        Err(err) => {
            return Err(anyhow!(
                "output directory is not writable: {} ({})",
                path.display(),
                err
            ));
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            warn!("output directory is world-writable: {}", path.display());
        }
    }

    Ok(())
}
