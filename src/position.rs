//! # Position Paths
//!
//! Hierarchical identity of a byte range. A path is a list of segments;
//! offsets locate bytes inside the innermost container and tags name the
//! container that produced them (a scanner tag such as `ZIP`, or a file
//! name when the input is a directory).
//!
//! Rendering joins segments with `-`, e.g. `4128-ZIP-10` is byte 10 of the
//! object that the ZIP scanner inflated from image offset 4128.

use std::fmt;
use std::str::FromStr;

pub const SEPARATOR: char = '-';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Offset(u64),
    /// Container produced by a recursive scanner. Counts toward depth.
    Tag(String),
    /// Input file name in directory mode. Does not count toward depth.
    File(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PositionPath {
    segments: Vec<Segment>,
}

impl PositionPath {
    /// Path of a top-level page at `offset` in a single-file image.
    pub fn root(offset: u64) -> Self {
        Self {
            segments: vec![Segment::Offset(offset)],
        }
    }

    /// Path of a page at `offset` inside the named file of a directory image.
    pub fn in_file(name: &str, offset: u64) -> Self {
        Self {
            segments: vec![Segment::File(name.to_string()), Segment::Offset(offset)],
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of recursive-container segments.
    pub fn depth(&self) -> u32 {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Tag(_)))
            .count() as u32
    }

    /// Offset of this position inside its innermost container.
    pub fn offset(&self) -> u64 {
        match self.segments.last() {
            Some(Segment::Offset(off)) => *off,
            _ => 0,
        }
    }

    /// Same container, `delta` bytes further in.
    pub fn shift(&self, delta: u64) -> Self {
        let mut segments = self.segments.clone();
        match segments.last_mut() {
            Some(Segment::Offset(off)) => *off = off.saturating_add(delta),
            _ => segments.push(Segment::Offset(delta)),
        }
        Self { segments }
    }

    /// Child container path: this path with one tag segment appended.
    pub fn child(&self, tag: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::Tag(tag.to_string()));
        Self { segments }
    }

    /// True when `self` is `parent` with exactly one segment appended.
    pub fn is_child_of(&self, parent: &PositionPath) -> bool {
        self.segments.len() == parent.segments.len() + 1
            && self.segments[..parent.segments.len()] == parent.segments[..]
    }
}

impl fmt::Display for PositionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                write!(f, "{SEPARATOR}")?;
            }
            first = false;
            match segment {
                Segment::Offset(off) => write!(f, "{off}")?,
                Segment::Tag(tag) => write!(f, "{tag}")?,
                Segment::File(name) => write!(f, "{name}")?,
            }
        }
        Ok(())
    }
}

impl FromStr for PositionPath {
    type Err = std::convert::Infallible;

    /// Numeric tokens become offsets; upper-case tokens become tags; anything
    /// else is taken as a file name. Empty tokens (doubled separators) are
    /// dropped.
    ///
    /// Lossy for directory images: file names are not quoted when rendered,
    /// so a name containing `-` splits into several segments and an
    /// all-upper-case name (`README`) reads back as a tag. Paths rooted at a
    /// raw image offset round-trip exactly.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = s
            .split(SEPARATOR)
            .filter(|tok| !tok.is_empty())
            .map(|tok| {
                if let Ok(off) = tok.parse::<u64>() {
                    Segment::Offset(off)
                } else if tok
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
                {
                    Segment::Tag(tok.to_string())
                } else {
                    Segment::File(tok.to_string())
                }
            })
            .collect();
        Ok(Self { segments })
    }
}
