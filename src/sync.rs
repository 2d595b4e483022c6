//! Sync pipeline orchestration.
//!
//! Drives one end-to-end run: list memo pages → batch-load persisted edit
//! times → diff → process each target (flatten → normalize → embed →
//! upsert) → emit events → terminal result.
//!
//! A run never propagates an error past [`run_sync`]: failures of a single
//! target are recorded and skipped, and anything that breaks the pipeline
//! before the per-item loop becomes a fatal result carried inside the
//! terminal `done` event. The caller owns the receiving end of the event
//! channel; this module owns ordering and closes the channel by dropping
//! the sender on return. If the consumer disconnects mid-run, the run
//! still completes (no cooperative cancellation).

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;

use crate::diff::is_outdated;
use crate::embedding::Embedder;
use crate::models::{
    FailedItem, MemoRecord, PageMetadata, PreviewItem, SyncError, SyncEvent, SyncOptions,
    SyncResult, SyncStatus,
};
use crate::normalize::normalize_content;
use crate::notion::{Page, PageSource};
use crate::store::MemoStore;

pub const DEFAULT_PREVIEW_COUNT: u32 = 20;
pub const MAX_PREVIEW_COUNT: u32 = 50;

/// Clamp a raw `previewCount` request value into `[1, MAX_PREVIEW_COUNT]`.
/// Anything non-numeric falls back to the default rather than failing.
pub fn clamp_preview_count(raw: Option<f64>) -> u32 {
    let value = match raw {
        Some(v) if v.is_finite() => v.floor(),
        _ => return DEFAULT_PREVIEW_COUNT,
    };
    value.clamp(1.0, MAX_PREVIEW_COUNT as f64) as u32
}

/// Execute one sync run, emitting events on `events` and returning the
/// terminal result (also carried by the final `done` event).
pub async fn run_sync(
    source: &dyn PageSource,
    embedder: &dyn Embedder,
    store: &dyn MemoStore,
    opts: SyncOptions,
    events: mpsc::Sender<SyncEvent>,
) -> SyncResult {
    let result = if opts.force_fail {
        // Operability escape hatch: no external calls at all.
        failure_result(
            &opts,
            Totals::default(),
            Vec::new(),
            SyncError {
                code: "FORCED_FAILURE".to_string(),
                message: "Forced failure is enabled.".to_string(),
            },
        )
    } else {
        match run_pipeline(source, embedder, store, &opts, &events).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "sync run failed before processing");
                failure_result(
                    &opts,
                    Totals::default(),
                    Vec::new(),
                    SyncError {
                        code: "SYNC_FATAL_ERROR".to_string(),
                        message: err.to_string(),
                    },
                )
            }
        }
    };

    // A disconnected consumer must not turn a finished run into a panic.
    let _ = events
        .send(SyncEvent::Done {
            result: result.clone(),
        })
        .await;
    result
}

/// Run to completion without streaming, discarding intermediate events.
pub async fn run_sync_collect(
    source: &dyn PageSource,
    embedder: &dyn Embedder,
    store: &dyn MemoStore,
    opts: SyncOptions,
) -> SyncResult {
    let (tx, mut rx) = mpsc::channel(32);
    let (result, _) = tokio::join!(run_sync(source, embedder, store, opts, tx), async {
        while rx.recv().await.is_some() {}
    });
    result
}

#[derive(Default)]
struct Totals {
    fetched: u64,
    diff: u64,
    attempted: u64,
    synced: u64,
}

async fn run_pipeline(
    source: &dyn PageSource,
    embedder: &dyn Embedder,
    store: &dyn MemoStore,
    opts: &SyncOptions,
    events: &mpsc::Sender<SyncEvent>,
) -> Result<SyncResult> {
    let pages = source.list_pages(opts.limit).await?;
    let ids: Vec<String> = pages.iter().map(|page| page.id.clone()).collect();
    let persisted = store.fetch_edited_times(&ids).await?;

    let targets: Vec<&Page> = pages
        .iter()
        .filter(|page| {
            is_outdated(
                page.last_edited_time.as_deref(),
                persisted.get(&page.id).map(String::as_str),
            )
        })
        .collect();

    let mut totals = Totals {
        fetched: pages.len() as u64,
        diff: targets.len() as u64,
        ..Totals::default()
    };

    let _ = events
        .send(SyncEvent::Start {
            limit: opts.limit,
            preview_count: opts.preview_count,
            fetched_count: totals.fetched,
            diff_count: totals.diff,
        })
        .await;

    let mut failed_ids: Vec<FailedItem> = Vec::new();
    let mut preview: Vec<PreviewItem> = Vec::new();

    for page in targets {
        let metadata = source.page_metadata(page).await;
        // Every processed target is one upsert attempt, success or not.
        totals.attempted += 1;

        let preview_item = match process_target(source, embedder, store, page, &metadata).await {
            Ok(()) => {
                totals.synced += 1;
                if (preview.len() as u32) < opts.preview_count {
                    let item = PreviewItem {
                        book_title: metadata.book_title.clone(),
                        memo_url: metadata.memo_url.clone(),
                    };
                    preview.push(item.clone());
                    Some(item)
                } else {
                    None
                }
            }
            Err(err) => {
                tracing::warn!(page_id = %page.id, error = %err, "memo sync failed, continuing");
                failed_ids.push(FailedItem {
                    id: page.id.clone(),
                    book_title: metadata.book_title.clone(),
                    memo_url: metadata.memo_url.clone(),
                });
                None
            }
        };

        let _ = events
            .send(SyncEvent::Progress {
                upsert_attempted_count: totals.attempted,
                synced_count: totals.synced,
                failed_count: failed_ids.len() as u64,
                preview_item,
            })
            .await;
    }

    if !failed_ids.is_empty() {
        return Ok(failure_result(
            opts,
            totals,
            failed_ids,
            SyncError {
                code: "SYNC_PARTIAL_FAILURE".to_string(),
                message: "Some memo sync operations failed.".to_string(),
            },
        ));
    }

    Ok(SyncResult {
        ok: true,
        mode: "live".to_string(),
        status: SyncStatus::Succeeded,
        limit: opts.limit,
        preview_count: opts.preview_count,
        fetched_count: totals.fetched,
        diff_count: totals.diff,
        upsert_attempted_count: totals.attempted,
        synced_count: totals.synced,
        failed_ids: Vec::new(),
        upsert_preview: Some(preview),
        error: None,
    })
}

/// Fetch, flatten, normalize, embed, and upsert one target.
async fn process_target(
    source: &dyn PageSource,
    embedder: &dyn Embedder,
    store: &dyn MemoStore,
    page: &Page,
    metadata: &PageMetadata,
) -> Result<()> {
    let flattened = source.flatten_content(&page.id).await?;
    let content = normalize_content(&flattened, metadata.book_title.as_deref(), &metadata.note);
    let embedding = embedder.embed(&content).await?;

    let record = MemoRecord {
        id: page.id.clone(),
        memo_url: metadata.memo_url.clone(),
        book_id: metadata.book_id.clone(),
        book_title: metadata.book_title.clone(),
        book_url: metadata.book_url.clone(),
        tags: metadata.tags.clone(),
        note: metadata.note.clone(),
        content_text: content,
        embedding,
        created_time: page.created_time.clone().unwrap_or_else(now_iso),
        last_edited_time: page.last_edited_time.clone().unwrap_or_else(now_iso),
    };

    store.upsert_memo(&record).await
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn failure_result(
    opts: &SyncOptions,
    totals: Totals,
    failed_ids: Vec<FailedItem>,
    error: SyncError,
) -> SyncResult {
    SyncResult {
        ok: false,
        mode: "live".to_string(),
        status: SyncStatus::Failed,
        limit: opts.limit,
        preview_count: opts.preview_count,
        fetched_count: totals.fetched,
        diff_count: totals.diff,
        upsert_attempted_count: totals.attempted,
        synced_count: totals.synced,
        failed_ids,
        upsert_preview: None,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncLimit;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_preview_count_clamped_into_range() {
        assert_eq!(clamp_preview_count(None), DEFAULT_PREVIEW_COUNT);
        assert_eq!(clamp_preview_count(Some(0.0)), 1);
        assert_eq!(clamp_preview_count(Some(-3.0)), 1);
        assert_eq!(clamp_preview_count(Some(7.9)), 7);
        assert_eq!(clamp_preview_count(Some(500.0)), MAX_PREVIEW_COUNT);
        assert_eq!(clamp_preview_count(Some(f64::NAN)), DEFAULT_PREVIEW_COUNT);
    }

    /// Source that counts calls; used to prove forced failure skips I/O.
    struct CountingSource {
        calls: AtomicU64,
    }

    #[async_trait]
    impl PageSource for CountingSource {
        async fn list_pages(&self, _limit: SyncLimit) -> Result<Vec<Page>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
        async fn page_metadata(&self, _page: &Page) -> PageMetadata {
            self.calls.fetch_add(1, Ordering::SeqCst);
            PageMetadata::default()
        }
        async fn flatten_content(&self, _page_id: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        }
    }

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn model_name(&self) -> &str {
            "stub"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0, 0.0, 0.0])
        }
    }

    fn opts(force_fail: bool) -> SyncOptions {
        SyncOptions {
            limit: SyncLimit::Fifty,
            force_fail,
            preview_count: DEFAULT_PREVIEW_COUNT,
        }
    }

    #[tokio::test]
    async fn test_forced_failure_makes_no_external_calls() {
        let source = CountingSource {
            calls: AtomicU64::new(0),
        };
        let store = MemoryStore::new();

        let result = run_sync_collect(&source, &StubEmbedder, &store, opts(true)).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.status, SyncStatus::Failed);
        assert_eq!(result.fetched_count, 0);
        assert_eq!(result.diff_count, 0);
        assert_eq!(result.error.as_ref().unwrap().code, "FORCED_FAILURE");
    }

    struct FailingSource;

    #[async_trait]
    impl PageSource for FailingSource {
        async fn list_pages(&self, _limit: SyncLimit) -> Result<Vec<Page>> {
            anyhow::bail!("notion_api_failed:404:object_not_found:gone")
        }
        async fn page_metadata(&self, _page: &Page) -> PageMetadata {
            PageMetadata::default()
        }
        async fn flatten_content(&self, _page_id: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal_with_zero_counts() {
        let store = MemoryStore::new();
        let result = run_sync_collect(&FailingSource, &StubEmbedder, &store, opts(false)).await;

        assert_eq!(result.status, SyncStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.code, "SYNC_FATAL_ERROR");
        assert!(error.message.contains("object_not_found"));
        assert_eq!(result.fetched_count, 0);
        assert_eq!(result.upsert_attempted_count, 0);
    }

    #[tokio::test]
    async fn test_empty_listing_succeeds_with_zero_diff() {
        let source = CountingSource {
            calls: AtomicU64::new(0),
        };
        let store = MemoryStore::new();
        let result = run_sync_collect(&source, &StubEmbedder, &store, opts(false)).await;

        assert_eq!(result.status, SyncStatus::Succeeded);
        assert!(result.ok);
        assert_eq!(result.diff_count, 0);
        assert_eq!(result.upsert_preview.unwrap().len(), 0);
    }
}
