//! NDJSON framing for the progress stream.
//!
//! Each [`SyncEvent`] is serialized as one self-contained JSON record
//! terminated by a line break. The transport may split records across
//! arbitrary read boundaries, so consumers feed raw bytes through
//! [`EventDecoder`], which buffers until a full record is observed.

use anyhow::Result;

use crate::models::SyncEvent;

/// Serialize one event as a newline-terminated NDJSON record.
pub fn encode_event(event: &SyncEvent) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(event)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Incremental NDJSON parser for the sync event stream.
///
/// Push bytes in as they arrive; complete events come out in order.
/// Partial trailing records stay buffered until their terminator arrives.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buf: Vec<u8>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and collect every event completed by it.
    ///
    /// Blank lines are ignored. A malformed record is skipped with a
    /// warning rather than poisoning the rest of the stream.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SyncEvent> {
        self.buf.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let record: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &record[..record.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<SyncEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed stream record");
                }
            }
        }
        events
    }

    /// Bytes still waiting for a record terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncLimit, SyncStatus};

    fn start_event() -> SyncEvent {
        SyncEvent::Start {
            limit: SyncLimit::Fifty,
            preview_count: 20,
            fetched_count: 3,
            diff_count: 2,
        }
    }

    #[test]
    fn test_encode_terminates_with_newline() {
        let bytes = encode_event(&start_event()).unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_decode_roundtrip() {
        let bytes = encode_event(&start_event()).unwrap();
        let mut decoder = EventDecoder::new();
        let events = decoder.push(&bytes);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SyncEvent::Start { fetched_count: 3, .. }));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decode_across_arbitrary_split_boundaries() {
        let bytes = encode_event(&start_event()).unwrap();
        let (first, second) = bytes.split_at(bytes.len() / 2);

        let mut decoder = EventDecoder::new();
        assert!(decoder.push(first).is_empty());
        assert!(decoder.pending() > 0);

        let events = decoder.push(second);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_decode_multiple_records_in_one_chunk() {
        let mut bytes = encode_event(&start_event()).unwrap();
        bytes.extend(
            encode_event(&SyncEvent::Progress {
                upsert_attempted_count: 1,
                synced_count: 1,
                failed_count: 0,
                preview_item: None,
            })
            .unwrap(),
        );

        let mut decoder = EventDecoder::new();
        let events = decoder.push(&bytes);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], SyncEvent::Progress { synced_count: 1, .. }));
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let mut decoder = EventDecoder::new();
        let mut bytes = b"{not json}\n".to_vec();
        bytes.extend(encode_event(&start_event()).unwrap());
        let events = decoder.push(&bytes);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_done_event_roundtrips_result() {
        let result = crate::models::SyncResult {
            ok: true,
            mode: "live".to_string(),
            status: SyncStatus::Succeeded,
            limit: SyncLimit::All,
            preview_count: 5,
            fetched_count: 2,
            diff_count: 1,
            upsert_attempted_count: 1,
            synced_count: 1,
            failed_ids: vec![],
            upsert_preview: Some(vec![]),
            error: None,
        };
        let bytes = encode_event(&SyncEvent::Done { result }).unwrap();
        let mut decoder = EventDecoder::new();
        let events = decoder.push(&bytes);
        match &events[0] {
            SyncEvent::Done { result } => {
                assert_eq!(result.status, SyncStatus::Succeeded);
                assert_eq!(result.limit, SyncLimit::All);
            }
            other => panic!("expected done event, got {:?}", other),
        }
    }
}
