//! Allow/deny word lists.
//!
//! A list file holds one entry per line. Lines starting with `#` are
//! comments. A line in feature-file form (`path\tfeature\tcontext`) is
//! reduced to its feature column, so an earlier run's output can be fed back
//! as a list. Entries containing `*`, `?` or `[` are globs; everything else
//! must match the feature exactly.

use std::collections::HashSet;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

use super::RecorderError;

#[derive(Debug, Clone, Default)]
pub struct WordList {
    literals: HashSet<String>,
    globs: Option<GlobSet>,
    glob_count: usize,
}

fn is_glob(entry: &str) -> bool {
    entry.contains('*') || entry.contains('?') || entry.contains('[')
}

impl WordList {
    pub fn from_entries<I, S>(entries: I) -> Result<Self, RecorderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut literals = HashSet::new();
        let mut builder = GlobSetBuilder::new();
        let mut glob_count = 0usize;
        for entry in entries {
            let entry = entry.as_ref();
            if entry.is_empty() {
                continue;
            }
            if is_glob(entry) {
                let glob = Glob::new(entry)
                    .map_err(|e| RecorderError::WordList(format!("bad glob '{entry}': {e}")))?;
                builder.add(glob);
                glob_count += 1;
            } else {
                literals.insert(entry.to_string());
            }
        }
        let globs = if glob_count > 0 {
            Some(
                builder
                    .build()
                    .map_err(|e| RecorderError::WordList(e.to_string()))?,
            )
        } else {
            None
        };
        Ok(Self {
            literals,
            globs,
            glob_count,
        })
    }

    pub fn read_file(path: &Path) -> Result<Self, RecorderError> {
        let content = std::fs::read_to_string(path)?;
        let entries = content.lines().filter_map(|line| {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut cols = line.split('\t');
            let first = cols.next()?;
            Some(cols.next().unwrap_or(first).to_string())
        });
        Self::from_entries(entries)
    }

    pub fn len(&self) -> usize {
        self.literals.len() + self.glob_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn matches(&self, feature: &str) -> bool {
        if self.literals.contains(feature) {
            return true;
        }
        self.globs
            .as_ref()
            .is_some_and(|set| set.is_match(feature))
    }
}
