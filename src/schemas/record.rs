//! Tender record schemas
//!
//! Adapters emit `CandidateRecord`s. Only candidates that survive
//! deduplication become `StoredRecord`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::MonitorError;

/// A normalized record as emitted by a source adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CandidateRecord {
    pub title: String,
    pub description: Option<String>,
    pub organization: Option<String>,
    /// Identifier assigned by the source itself, when it has one
    pub external_id: Option<String>,
    pub record_number: Option<String>,
    pub file_number: Option<String>,
    pub contract_type: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub opens_at: Option<DateTime<Utc>>,
    pub closes_at: Option<DateTime<Utc>>,
    pub estimated_amount: Option<f64>,
    pub currency: Option<String>,
    pub detail_url: Option<String>,
    pub document_url: Option<String>,
    /// Keywords the adapter itself believes this record matched
    #[serde(default)]
    pub suggested_keywords: Vec<String>,
    pub raw: Option<serde_json::Value>,
    pub source_short_name: String,
}

impl CandidateRecord {
    pub fn new(title: impl Into<String>, source_short_name: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            source_short_name: source_short_name.into(),
            currency: Some("ARS".to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    New,
    Viewed,
    Discarded,
    Favorite,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::New => "new",
            RecordStatus::Viewed => "viewed",
            RecordStatus::Discarded => "discarded",
            RecordStatus::Favorite => "favorite",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(RecordStatus::New),
            "viewed" => Ok(RecordStatus::Viewed),
            "discarded" => Ok(RecordStatus::Discarded),
            "favorite" => Ok(RecordStatus::Favorite),
            other => Err(MonitorError::StorageError(format!(
                "unknown record status: {other}"
            ))),
        }
    }
}

/// A deduplicated, scored record about to be persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRecord {
    pub source_id: i64,
    pub content_hash: String,
    #[serde(flatten)]
    pub candidate: CandidateRecord,
    pub matched_keywords: Vec<String>,
    pub relevance_score: f64,
    pub status: RecordStatus,
    pub is_new: bool,
}

impl NewRecord {
    pub fn into_stored(self, id: i64, created_at: DateTime<Utc>) -> StoredRecord {
        StoredRecord {
            id,
            source_id: self.source_id,
            content_hash: self.content_hash,
            candidate: self.candidate,
            matched_keywords: self.matched_keywords,
            relevance_score: self.relevance_score,
            status: self.status,
            is_new: self.is_new,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub source_id: i64,
    pub content_hash: String,
    #[serde(flatten)]
    pub candidate: CandidateRecord,
    pub matched_keywords: Vec<String>,
    pub relevance_score: f64,
    pub status: RecordStatus,
    pub is_new: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_defaults() {
        let c = CandidateRecord::new("Adquisición de kit forense", "comprar");
        assert_eq!(c.source_short_name, "comprar");
        assert_eq!(c.currency.as_deref(), Some("ARS"));
        assert!(c.external_id.is_none());
        assert!(c.suggested_keywords.is_empty());
    }

    #[test]
    fn test_record_status_round_trip_text() {
        for status in [
            RecordStatus::New,
            RecordStatus::Viewed,
            RecordStatus::Discarded,
            RecordStatus::Favorite,
        ] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("archived".parse::<RecordStatus>().is_err());
    }
}
