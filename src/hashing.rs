//! Hash algorithm selection shared by content dedup and the whole-image digest.

use std::fmt;
use std::str::FromStr;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid hash algorithm '{0}'; supported: md5, sha1, sha256")]
pub struct UnknownHashAlg(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlg {
    #[default]
    Md5,
    Sha1,
    Sha256,
}

impl HashAlg {
    pub fn name(self) -> &'static str {
        match self {
            HashAlg::Md5 => "md5",
            HashAlg::Sha1 => "sha1",
            HashAlg::Sha256 => "sha256",
        }
    }

    /// Hex digest of `bytes`.
    pub fn hash_hex(self, bytes: &[u8]) -> String {
        let mut hasher = StreamHasher::new(self);
        hasher.update(bytes);
        hasher.finalize_hex()
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlg {
    type Err = UnknownHashAlg;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(HashAlg::Md5),
            "sha1" | "sha-1" => Ok(HashAlg::Sha1),
            "sha256" | "sha-256" => Ok(HashAlg::Sha256),
            _ => Err(UnknownHashAlg(s.to_string())),
        }
    }
}

impl<'de> serde::Deserialize<'de> for HashAlg {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub enum StreamHasher {
    Md5(md5::Context),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl StreamHasher {
    pub fn new(alg: HashAlg) -> Self {
        match alg {
            HashAlg::Md5 => StreamHasher::Md5(md5::Context::new()),
            HashAlg::Sha1 => StreamHasher::Sha1(Sha1::new()),
            HashAlg::Sha256 => StreamHasher::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            StreamHasher::Md5(ctx) => ctx.consume(bytes),
            StreamHasher::Sha1(h) => h.update(bytes),
            StreamHasher::Sha256(h) => h.update(bytes),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            StreamHasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            StreamHasher::Sha1(h) => hex::encode(h.finalize()),
            StreamHasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Whole-image digest fed in iteration order. The first page that does not
/// start exactly where the previous one ended disables it for good.
pub struct ImageHasher {
    alg: HashAlg,
    state: Option<StreamHasher>,
    next_offset: u64,
}

impl ImageHasher {
    pub fn new(alg: HashAlg) -> Self {
        Self {
            alg,
            state: Some(StreamHasher::new(alg)),
            next_offset: 0,
        }
    }

    pub fn disabled(alg: HashAlg) -> Self {
        Self {
            alg,
            state: None,
            next_offset: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    pub fn disable(&mut self) {
        self.state = None;
    }

    pub fn feed(&mut self, offset: u64, page: &[u8]) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if offset != self.next_offset {
            self.state = None;
            return;
        }
        state.update(page);
        self.next_offset = self.next_offset.saturating_add(page.len() as u64);
    }

    /// Digest, only if exactly `total_len` contiguous bytes were hashed.
    pub fn finish(self, total_len: u64) -> Option<(HashAlg, String)> {
        let state = self.state?;
        if self.next_offset != total_len {
            return None;
        }
        Some((self.alg, state.finalize_hex()))
    }
}
