//! Deduplication Module
//!
//! Decides whether a candidate record was already ingested for a source:
//! - Content hash (SHA-256) over the identity fields of the record
//! - Layered lookup: in-scan memory set, then durable storage by hash,
//!   then durable storage by the source's own external id
//!
//! A `Deduplicator` lives for exactly one scan of one source.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

use crate::error::Result;
use crate::schemas::CandidateRecord;
use crate::storage::ScanSession;

/// Computes SHA-256 hash of content
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Identity hash of a candidate.
///
/// Covers the trimmed lowercase title, external id, record number,
/// organization and the source short name. URLs, dates and the raw payload
/// are left out so cosmetic changes upstream do not create new records.
pub fn content_hash(candidate: &CandidateRecord) -> String {
    let key = [
        candidate.title.trim().to_lowercase(),
        candidate.external_id.as_deref().unwrap_or_default().trim().to_string(),
        candidate.record_number.as_deref().unwrap_or_default().trim().to_string(),
        candidate.organization.as_deref().unwrap_or_default().trim().to_string(),
        candidate.source_short_name.clone(),
    ]
    .join("|");
    compute_hash(&key)
}

/// Per-scan duplicate detector
#[derive(Debug)]
pub struct Deduplicator {
    source_id: i64,
    seen: HashSet<String>,
    hits: usize,
}

impl Deduplicator {
    pub fn new(source_id: i64) -> Self {
        Self {
            source_id,
            seen: HashSet::new(),
            hits: 0,
        }
    }

    /// Loads every known hash for the source into memory
    pub async fn preload(&mut self, session: &mut dyn ScanSession) -> Result<usize> {
        let hashes = session.content_hashes(self.source_id).await?;
        self.seen.extend(hashes);
        debug!(source_id = self.source_id, cached = self.seen.len(), "Dedup cache preloaded");
        Ok(self.seen.len())
    }

    /// Returns true if the candidate was already ingested (or seen earlier in
    /// this scan). Storage hits are cached so later lookups skip I/O.
    pub async fn is_duplicate(
        &mut self,
        session: &mut dyn ScanSession,
        candidate: &CandidateRecord,
        hash: &str,
    ) -> Result<bool> {
        if self.seen.contains(hash) {
            self.hits += 1;
            return Ok(true);
        }

        if session.hash_exists(self.source_id, hash).await? {
            self.seen.insert(hash.to_string());
            self.hits += 1;
            return Ok(true);
        }

        if let Some(external_id) = candidate
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            if session.external_id_exists(self.source_id, external_id).await? {
                self.seen.insert(hash.to_string());
                self.hits += 1;
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Marks a hash as seen for the rest of the scan
    pub fn mark_seen(&mut self, hash: &str) {
        self.seen.insert(hash.to_string());
    }

    /// Duplicates detected so far
    pub fn hits(&self) -> usize {
        self.hits
    }
}
