use audiencelens_common::{Confidence, DemographicProfile, SubjectKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source tag for results produced by the research agent.
pub const SOURCE_DEEP_RESEARCH: &str = "deep_research";

/// One cached demographic result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: SubjectKey,
    pub payload: serde_json::Value,
    pub confidence: Confidence,
    pub source_tag: String,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: SubjectKey, payload: serde_json::Value, meta: EntryMeta) -> Self {
        Self {
            key,
            payload,
            confidence: meta.confidence,
            source_tag: meta.source_tag,
            fetched_at: meta.fetched_at,
        }
    }

    /// A row with nothing in it is treated as absent.
    pub fn is_empty(&self) -> bool {
        match &self.payload {
            serde_json::Value::Null => true,
            serde_json::Value::Object(m) => m.is_empty(),
            _ => false,
        }
    }

    pub fn profile(&self) -> Result<DemographicProfile, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Everything about a cache write except the payload itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMeta {
    pub confidence: Confidence,
    pub source_tag: String,
    pub fetched_at: DateTime<Utc>,
}

impl EntryMeta {
    /// Fresh research result fetched at `fetched_at`.
    pub fn research(confidence: Confidence, fetched_at: DateTime<Utc>) -> Self {
        Self {
            confidence,
            source_tag: SOURCE_DEEP_RESEARCH.to_string(),
            fetched_at,
        }
    }
}

/// Raw result of one completed research job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCacheEntry {
    pub key: SubjectKey,
    pub fingerprint: String,
    pub query_text: String,
    pub job_handle: String,
    pub raw_text: String,
    pub result_json: Option<serde_json::Value>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub completed_at: DateTime<Utc>,
}

/// Token counts are stored signed; anything past `i64::MAX` is clamped.
pub(crate) fn tokens_to_db(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

pub(crate) fn tokens_from_db(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}
