//! Duplicate filter and content fingerprints
//!
//! The filter is owned by one adapter instance and bounded: records are
//! evicted oldest-first once `capacity` is exceeded, and optionally expire
//! after a rolling window. Items are recorded only after they were fully
//! handed downstream, so a failure mid-processing re-admits them on the
//! next poll.

use crate::{config::DuplicateStrategy, Error, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use tracing::debug;

const BLAKE3_KEY_CONTEXT: &str = "adapter-runtime 2024 content fingerprint";

/// Digest algorithm for fingerprints and checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    /// SHA-256 (default)
    Sha256,
    /// SHA-512
    Sha512,
    /// BLAKE3
    Blake3,
}

impl ChecksumAlgorithm {
    /// Digest length in bytes
    pub fn digest_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 | ChecksumAlgorithm::Blake3 => 32,
            ChecksumAlgorithm::Sha512 => 64,
        }
    }

    /// Suffix of checksum sidecar files
    pub fn file_suffix(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => ".sha256",
            ChecksumAlgorithm::Sha512 => ".sha512",
            ChecksumAlgorithm::Blake3 => ".b3",
        }
    }

    /// Plain (unkeyed) hex digest of `content`
    pub fn checksum(self, content: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(content)),
            ChecksumAlgorithm::Sha512 => hex::encode(Sha512::digest(content)),
            ChecksumAlgorithm::Blake3 => blake3::hash(content).to_hex().to_string(),
        }
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "SHA-256"),
            ChecksumAlgorithm::Sha512 => write!(f, "SHA-512"),
            ChecksumAlgorithm::Blake3 => write!(f, "BLAKE3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            "blake3" => Ok(ChecksumAlgorithm::Blake3),
            _ => Err(Error::config(
                "checksumAlgorithm",
                format!("unsupported algorithm '{}'", s),
            )),
        }
    }
}

/// Computes content fingerprints, keyed when a secret is configured
#[derive(Clone)]
pub struct Fingerprinter {
    algorithm: ChecksumAlgorithm,
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fingerprinter")
            .field("algorithm", &self.algorithm)
            .field("keyed", &self.key.is_some())
            .finish()
    }
}

impl Fingerprinter {
    /// Create a fingerprinter; `key` switches to a keyed digest
    pub fn new(algorithm: ChecksumAlgorithm, key: Option<&str>) -> Self {
        Self {
            algorithm,
            key: key.map(|k| k.as_bytes().to_vec()),
        }
    }

    /// Algorithm in use
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Fixed fingerprint used for empty content
    pub fn empty_fingerprint(&self) -> String {
        "0".repeat(self.algorithm.digest_len() * 2)
    }

    /// Hex fingerprint of `content`
    pub fn fingerprint(&self, content: &[u8]) -> Result<String> {
        if content.is_empty() {
            return Ok(self.empty_fingerprint());
        }

        let key = match &self.key {
            Some(key) => key,
            None => return Ok(self.algorithm.checksum(content)),
        };

        match self.algorithm {
            ChecksumAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .map_err(|e| Error::config("fingerprintKey", e.to_string()))?;
                mac.update(content);
                Ok(hex::encode(mac.finalize().into_bytes()))
            }
            ChecksumAlgorithm::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key)
                    .map_err(|e| Error::config("fingerprintKey", e.to_string()))?;
                mac.update(content);
                Ok(hex::encode(mac.finalize().into_bytes()))
            }
            ChecksumAlgorithm::Blake3 => {
                let derived = blake3::derive_key(BLAKE3_KEY_CONTEXT, key);
                Ok(blake3::keyed_hash(&derived, content).to_hex().to_string())
            }
        }
    }
}

/// Record of an accepted item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintRecord {
    /// Natural key
    pub key: String,
    /// Content fingerprint
    pub fingerprint: String,
    /// Acceptance time (epoch ms)
    pub seen_at_epoch_ms: i64,
}

/// Bounded duplicate filter
#[derive(Debug)]
pub struct DuplicateFilter {
    strategy: DuplicateStrategy,
    capacity: usize,
    window_ms: Option<u64>,
    records: VecDeque<FingerprintRecord>,
    keys: HashMap<String, usize>,
    fingerprints: HashMap<String, usize>,
    pairs: HashMap<(String, String), usize>,
}

impl DuplicateFilter {
    /// Create a filter; `capacity == 0` means unbounded
    pub fn new(strategy: DuplicateStrategy, capacity: usize, window_ms: Option<u64>) -> Self {
        Self {
            strategy,
            capacity,
            window_ms,
            records: VecDeque::new(),
            keys: HashMap::new(),
            fingerprints: HashMap::new(),
            pairs: HashMap::new(),
        }
    }

    /// Strategy in use
    pub fn strategy(&self) -> DuplicateStrategy {
        self.strategy
    }

    /// Whether the filter rejects anything at all
    pub fn is_enabled(&self) -> bool {
        self.strategy != DuplicateStrategy::None
    }

    /// Records currently held
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no record is held
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether an item should be accepted
    pub fn should_accept(&mut self, key: &str, fingerprint: &str) -> bool {
        self.should_accept_at(key, fingerprint, now_epoch_ms())
    }

    /// [`should_accept`](Self::should_accept) at an explicit time
    pub fn should_accept_at(&mut self, key: &str, fingerprint: &str, now_ms: i64) -> bool {
        self.expire(now_ms);
        let seen = match self.strategy {
            DuplicateStrategy::None => false,
            DuplicateStrategy::Key => self.keys.contains_key(key),
            DuplicateStrategy::Fingerprint => self.fingerprints.contains_key(fingerprint),
            DuplicateStrategy::KeyAndFingerprint => self
                .pairs
                .contains_key(&(key.to_string(), fingerprint.to_string())),
        };
        if seen {
            debug!("Duplicate item '{}' ({:?})", key, self.strategy);
        }
        !seen
    }

    /// Record an item that was fully processed
    pub fn record_accepted(&mut self, key: &str, fingerprint: &str) {
        self.record_accepted_at(key, fingerprint, now_epoch_ms());
    }

    /// [`record_accepted`](Self::record_accepted) at an explicit time
    pub fn record_accepted_at(&mut self, key: &str, fingerprint: &str, now_ms: i64) {
        if !self.is_enabled() {
            return;
        }

        *self.keys.entry(key.to_string()).or_insert(0) += 1;
        *self.fingerprints.entry(fingerprint.to_string()).or_insert(0) += 1;
        *self
            .pairs
            .entry((key.to_string(), fingerprint.to_string()))
            .or_insert(0) += 1;
        self.records.push_back(FingerprintRecord {
            key: key.to_string(),
            fingerprint: fingerprint.to_string(),
            seen_at_epoch_ms: now_ms,
        });

        if self.capacity > 0 {
            while self.records.len() > self.capacity {
                self.evict_oldest();
            }
        }
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.records.clear();
        self.keys.clear();
        self.fingerprints.clear();
        self.pairs.clear();
    }

    fn expire(&mut self, now_ms: i64) {
        let window = match self.window_ms {
            Some(window) => window as i64,
            None => return,
        };
        while let Some(oldest) = self.records.front() {
            if now_ms.saturating_sub(oldest.seen_at_epoch_ms) < window {
                break;
            }
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        let record = match self.records.pop_front() {
            Some(record) => record,
            None => return,
        };
        decrement(&mut self.keys, &record.key);
        decrement(&mut self.fingerprints, &record.fingerprint);
        decrement(&mut self.pairs, &(record.key, record.fingerprint));
    }
}

fn decrement<K: std::hash::Hash + Eq>(counts: &mut HashMap<K, usize>, key: &K) {
    if let Some(count) = counts.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            counts.remove(key);
        }
    }
}

fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
