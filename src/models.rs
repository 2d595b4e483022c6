//! Core data models used throughout memo-sync.
//!
//! These types represent the memo pages, extracted metadata, upsert records,
//! and the stream events that flow through the sync pipeline. Wire shapes
//! (camelCase event keys, snake_case item keys) match the published sync
//! protocol and must not be changed without versioning the API.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// How many pages a run may fetch: the bounded default page, or everything.
///
/// Accepted request encodings are the JSON number `50`, the string `"50"`,
/// and the string `"all"`. Anything else is rejected before the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncLimit {
    Fifty,
    All,
}

impl SyncLimit {
    /// Parse a raw request value. Returns `None` for anything that is not
    /// `50`, `"50"`, or `"all"`.
    pub fn parse(raw: &serde_json::Value) -> Option<Self> {
        match raw {
            serde_json::Value::Number(n) if n.as_u64() == Some(50) => Some(SyncLimit::Fifty),
            serde_json::Value::String(s) if s == "50" => Some(SyncLimit::Fifty),
            serde_json::Value::String(s) if s == "all" => Some(SyncLimit::All),
            _ => None,
        }
    }
}

impl Serialize for SyncLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SyncLimit::Fifty => serializer.serialize_u64(50),
            SyncLimit::All => serializer.serialize_str("all"),
        }
    }
}

impl<'de> Deserialize<'de> for SyncLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        SyncLimit::parse(&raw)
            .ok_or_else(|| D::Error::custom("limit must be 50, \"50\", or \"all\""))
    }
}

/// Validated options for one sync run.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub limit: SyncLimit,
    pub force_fail: bool,
    /// Already clamped into `[1, 50]`.
    pub preview_count: u32,
}

/// Metadata extracted from a memo page's properties.
///
/// The `book_*` fields come from the related book page (if the memo has a
/// relation property pointing at one) and may all be absent.
#[derive(Debug, Clone, Default)]
pub struct PageMetadata {
    pub memo_title: String,
    pub memo_url: String,
    pub book_id: Option<String>,
    pub book_title: Option<String>,
    pub book_url: Option<String>,
    pub tags: Vec<String>,
    pub note: String,
}

/// The unit persisted to the store. `id` is the natural key; upserts are
/// idempotent on it.
#[derive(Debug, Clone)]
pub struct MemoRecord {
    pub id: String,
    pub memo_url: String,
    pub book_id: Option<String>,
    pub book_title: Option<String>,
    pub book_url: Option<String>,
    pub tags: Vec<String>,
    pub note: String,
    pub content_text: String,
    pub embedding: Vec<f32>,
    pub created_time: String,
    pub last_edited_time: String,
}

/// A successfully synced item surfaced for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewItem {
    pub book_title: Option<String>,
    pub memo_url: String,
}

/// An item whose fetch, embed, or upsert failed. Never aborts the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedItem {
    pub id: String,
    pub book_title: Option<String>,
    pub memo_url: String,
}

/// Structured error carried inside a failed [`SyncResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Succeeded,
    Failed,
}

/// Terminal aggregate for one run, streamed as the `done` event's payload
/// (or returned as the whole response body for non-streaming callers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub ok: bool,
    pub mode: String,
    pub status: SyncStatus,
    pub limit: SyncLimit,
    pub preview_count: u32,
    pub fetched_count: u64,
    pub diff_count: u64,
    pub upsert_attempted_count: u64,
    pub synced_count: u64,
    pub failed_ids: Vec<FailedItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upsert_preview: Option<Vec<PreviewItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SyncError>,
}

/// One record on the progress stream.
///
/// Emission order within a run is strict: at most one `start`, zero or more
/// `progress` (one per processed target), exactly one terminal `done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    Start {
        limit: SyncLimit,
        preview_count: u32,
        fetched_count: u64,
        diff_count: u64,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        upsert_attempted_count: u64,
        synced_count: u64,
        failed_count: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preview_item: Option<PreviewItem>,
    },
    Done { result: SyncResult },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_parse_accepts_enumerated_values() {
        assert_eq!(SyncLimit::parse(&serde_json::json!(50)), Some(SyncLimit::Fifty));
        assert_eq!(SyncLimit::parse(&serde_json::json!("50")), Some(SyncLimit::Fifty));
        assert_eq!(SyncLimit::parse(&serde_json::json!("all")), Some(SyncLimit::All));
    }

    #[test]
    fn test_limit_parse_rejects_everything_else() {
        assert_eq!(SyncLimit::parse(&serde_json::json!(200)), None);
        assert_eq!(SyncLimit::parse(&serde_json::json!("ALL")), None);
        assert_eq!(SyncLimit::parse(&serde_json::json!(null)), None);
        assert_eq!(SyncLimit::parse(&serde_json::json!(50.5)), None);
    }

    #[test]
    fn test_limit_serializes_as_number_or_sentinel() {
        assert_eq!(serde_json::to_string(&SyncLimit::Fifty).unwrap(), "50");
        assert_eq!(serde_json::to_string(&SyncLimit::All).unwrap(), "\"all\"");
    }

    #[test]
    fn test_event_wire_keys_are_camel_case() {
        let event = SyncEvent::Start {
            limit: SyncLimit::Fifty,
            preview_count: 20,
            fetched_count: 12,
            diff_count: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["previewCount"], 20);
        assert_eq!(json["fetchedCount"], 12);
        assert_eq!(json["diffCount"], 3);
    }

    #[test]
    fn test_progress_omits_absent_preview_item() {
        let event = SyncEvent::Progress {
            upsert_attempted_count: 1,
            synced_count: 0,
            failed_count: 1,
            preview_item: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("previewItem").is_none());
    }
}
