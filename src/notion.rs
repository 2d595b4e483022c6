//! Notion document source client.
//!
//! Resolves which data source to query, lists memo pages sorted by edit
//! time, extracts typed metadata from a page's property map, and flattens a
//! page's nested block tree into plain text.
//!
//! The Notion API is schema-evolving: property names differ between
//! workspaces and new block/property types appear without notice. Field
//! resolution therefore runs a three-tier strategy (exact key, key
//! fragment, property type), and unknown property types deserialize into a
//! catch-all variant instead of failing the page.
//!
//! The API token is read from the `NOTION_TOKEN` environment variable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::SourceConfig;
use crate::models::{PageMetadata, SyncLimit};

/// Exact property keys used by the memo workspace (Japanese locale).
const TAGS_KEY: &str = "タグ";
const NOTE_KEY: &str = "備考";
const BOOK_RELATION_KEY: &str = "マルチメディアコンテンツリスト";

/// Case-insensitive key fragments tried when the exact key is absent.
const TITLE_FRAGMENTS: &[&str] = &["memo", "title"];
const BOOK_TITLE_FRAGMENTS: &[&str] = &["book", "title"];
const TAGS_FRAGMENTS: &[&str] = &["tag"];
const NOTE_FRAGMENTS: &[&str] = &["note", "page", "memo"];
const BOOK_RELATION_FRAGMENTS: &[&str] = &["book", "multimedia", "content", "media"];

/// Upstream error bodies are quoted at most this many characters.
const ERROR_EXCERPT_CHARS: usize = 200;

/// Bound on block-tree depth. The API contractually returns a tree, but a
/// malformed response must not walk us off a cliff.
const MAX_BLOCK_DEPTH: usize = 32;

// ============ Wire types ============

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RichText {
    #[serde(default)]
    pub plain_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RelationRef {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SelectOption {
    #[serde(default)]
    pub name: Option<String>,
}

/// A page property value, tagged by the API's `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyValue {
    Title {
        #[serde(default)]
        title: Vec<RichText>,
    },
    RichText {
        #[serde(default)]
        rich_text: Vec<RichText>,
    },
    Url {
        #[serde(default)]
        url: Option<String>,
    },
    Relation {
        #[serde(default)]
        relation: Vec<RelationRef>,
    },
    MultiSelect {
        #[serde(default)]
        multi_select: Vec<SelectOption>,
    },
    #[serde(other)]
    Other,
}

/// A memo page as listed or fetched from the source. Ephemeral: fetched
/// fresh each run, never persisted as-is.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Page {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub last_edited_time: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, PropertyValue>,
}

/// A content block. The per-type payload lives under a key named after the
/// block type, so the remainder of the object is kept as raw JSON.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type", default)]
    pub block_type: String,
    #[serde(default)]
    pub has_children: bool,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<Page>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockChildrenResponse {
    #[serde(default)]
    results: Vec<Block>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DatabaseResponse {
    #[serde(default)]
    data_sources: Vec<DataSourceRef>,
}

#[derive(Debug, Deserialize)]
struct DataSourceRef {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// A related book page, resolved through a relation property.
#[derive(Debug, Clone)]
pub struct BookReference {
    pub id: String,
    pub title: String,
    pub url: String,
}

// ============ Traits ============

/// The source of memo pages. The sync orchestrator depends on this seam
/// rather than the concrete client, so runs can be driven by fakes in tests.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// List candidate pages, newest edits first.
    async fn list_pages(&self, limit: SyncLimit) -> Result<Vec<Page>>;
    /// Extract metadata from a listed page. Related-book resolution failures
    /// degrade to absent book fields; this never fails the item.
    async fn page_metadata(&self, page: &Page) -> PageMetadata;
    /// Flatten a page's block tree into newline-joined plain text.
    async fn flatten_content(&self, page_id: &str) -> Result<String>;
}

/// Lists the children of one block. Split out of [`PageSource`] so the
/// traversal in [`flatten_blocks`] can be tested against canned trees.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn block_children(&self, block_id: &str) -> Result<Vec<Block>>;
}

/// The two remote calls behind listing. Split out of the client so
/// candidate resolution and failover in [`resolve_candidates`] and
/// [`list_with_failover`] can be tested against canned responses.
#[async_trait]
pub trait DataSourceQuery: Send + Sync {
    /// First data source id of a container database, if it has any.
    async fn first_data_source_id(&self, database_id: &str) -> Result<Option<String>>;
    /// Run the sorted page listing against one data source.
    async fn query_pages(&self, data_source_id: &str, limit: SyncLimit) -> Result<Vec<Page>>;
}

// ============ Client ============

/// HTTP client for the Notion API, scoped to one sync run.
///
/// Holds the related-book lookup cache, so a client instance must not be
/// reused across runs (the server constructs a fresh one per request).
pub struct NotionClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
    api_version: String,
    database_id: Option<String>,
    data_source_id: Option<String>,
    /// Memoized related-book lookups, including negative entries so a
    /// missing book is fetched at most once per run.
    book_cache: Mutex<HashMap<String, Option<BookReference>>>,
}

impl NotionClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let token = std::env::var("NOTION_TOKEN")
            .map_err(|_| anyhow::anyhow!("NOTION_TOKEN environment variable not set"))?;

        Ok(Self {
            http: reqwest::Client::new(),
            token,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            database_id: config.database_id.clone(),
            data_source_id: config.data_source_id.clone(),
            book_cache: Mutex::new(HashMap::new()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.api_version)
            .header("Content-Type", "application/json")
    }

    /// Send a request and decode the JSON body, shaping API errors into
    /// `notion_api_failed:{status}:{code}:{excerpt}`.
    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let parsed: Option<ApiError> = serde_json::from_str(&raw).ok();
            let code = parsed
                .as_ref()
                .and_then(|e| e.code.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let message = parsed
                .and_then(|e| e.message)
                .unwrap_or_else(|| raw.chars().take(ERROR_EXCERPT_CHARS).collect());
            let message: String = message.chars().take(ERROR_EXCERPT_CHARS).collect();
            bail!("notion_api_failed:{}:{}:{}", status.as_u16(), code, message);
        }

        Ok(response.json().await?)
    }

    async fn query_page(
        &self,
        data_source_id: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<QueryResponse> {
        let mut body = serde_json::json!({
            "page_size": page_size,
            "sorts": [{
                "timestamp": "last_edited_time",
                "direction": "descending"
            }],
            "result_type": "page"
        });
        if let Some(cursor) = cursor {
            body["start_cursor"] = serde_json::Value::String(cursor.to_string());
        }

        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/data_sources/{}/query", data_source_id),
            )
            .json(&body),
        )
        .await
    }

    /// Follow pagination cursors until the data source is exhausted.
    async fn query_all(&self, data_source_id: &str) -> Result<Vec<Page>> {
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let response = self
                .query_page(data_source_id, 100, cursor.as_deref())
                .await?;
            pages.extend(response.results);
            cursor = if response.has_more {
                response.next_cursor
            } else {
                None
            };
            if cursor.is_none() {
                break;
            }
        }

        Ok(pages)
    }

    /// Fetch the related book page, memoized for the client's lifetime.
    /// Failed and not-found lookups are cached as negatives.
    async fn book_reference(&self, book_page_id: &str) -> Option<BookReference> {
        if let Some(cached) = self
            .book_cache
            .lock()
            .expect("book cache poisoned")
            .get(book_page_id)
        {
            return cached.clone();
        }

        let fetched: Result<Page> = self
            .send(self.request(reqwest::Method::GET, &format!("/pages/{}", book_page_id)))
            .await;

        let reference = match fetched {
            Ok(page) => {
                let title = find_by_property_type_title(&page.properties)
                    .or_else(|| find_by_key_includes(&page.properties, BOOK_TITLE_FRAGMENTS))
                    .unwrap_or_else(|| "Untitled".to_string());
                Some(BookReference {
                    id: page.id,
                    title,
                    url: page.url.unwrap_or_default(),
                })
            }
            Err(err) => {
                tracing::debug!(book_page_id, error = %err, "related book lookup failed");
                None
            }
        };

        self.book_cache
            .lock()
            .expect("book cache poisoned")
            .insert(book_page_id.to_string(), reference.clone());
        reference
    }
}

#[async_trait]
impl BlockSource for NotionClient {
    /// List every child of a block, following pagination cursors.
    async fn block_children(&self, block_id: &str) -> Result<Vec<Block>> {
        let mut children = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut path = format!("/blocks/{}/children?page_size=100", block_id);
            if let Some(cursor) = &cursor {
                path.push_str(&format!("&start_cursor={}", cursor));
            }

            let response: BlockChildrenResponse =
                self.send(self.request(reqwest::Method::GET, &path)).await?;
            children.extend(response.results);
            cursor = if response.has_more {
                response.next_cursor
            } else {
                None
            };
            if cursor.is_none() {
                break;
            }
        }

        Ok(children)
    }
}

#[async_trait]
impl DataSourceQuery for NotionClient {
    async fn first_data_source_id(&self, database_id: &str) -> Result<Option<String>> {
        let database: DatabaseResponse = self
            .send(self.request(reqwest::Method::GET, &format!("/databases/{}", database_id)))
            .await?;
        Ok(database.data_sources.first().and_then(|d| d.id.clone()))
    }

    async fn query_pages(&self, data_source_id: &str, limit: SyncLimit) -> Result<Vec<Page>> {
        match limit {
            SyncLimit::Fifty => Ok(self.query_page(data_source_id, 50, None).await?.results),
            SyncLimit::All => self.query_all(data_source_id).await,
        }
    }
}

/// Produce the ordered list of data source ids to try for listing.
///
/// Priority: explicit override from config, then the container database's
/// first data source (tolerating `object_not_found`), then the raw
/// database id itself.
pub async fn resolve_candidates(
    query: &dyn DataSourceQuery,
    data_source_override: Option<&str>,
    database_id: Option<&str>,
) -> Result<Vec<String>> {
    let mut candidates: Vec<String> = Vec::new();

    if let Some(id) = data_source_override {
        candidates.push(id.to_string());
    }

    let Some(database_id) = database_id else {
        if candidates.is_empty() {
            bail!("notion_database_id_missing");
        }
        return Ok(dedup_non_empty(candidates));
    };

    match query.first_data_source_id(database_id).await {
        Ok(Some(id)) => candidates.push(id),
        Ok(None) => {}
        // A database without a data-source sub-resource is usable as-is.
        Err(err) if err.to_string().contains("object_not_found") => {}
        Err(err) => return Err(err),
    }

    candidates.push(database_id.to_string());

    let unique = dedup_non_empty(candidates);
    if unique.is_empty() {
        bail!("notion_data_source_not_found");
    }
    Ok(unique)
}

/// List memo pages from the first candidate that answers. When every
/// candidate fails, the last error propagates.
pub async fn list_with_failover(
    query: &dyn DataSourceQuery,
    candidates: &[String],
    limit: SyncLimit,
) -> Result<Vec<Page>> {
    let mut last_err: Option<anyhow::Error> = None;

    for data_source_id in candidates {
        match query.query_pages(data_source_id, limit).await {
            Ok(pages) => return Ok(pages),
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("notion_data_source_query_failed")))
}

#[async_trait]
impl PageSource for NotionClient {
    async fn list_pages(&self, limit: SyncLimit) -> Result<Vec<Page>> {
        let candidates = resolve_candidates(
            self,
            self.data_source_id.as_deref(),
            self.database_id.as_deref(),
        )
        .await?;
        list_with_failover(self, &candidates, limit).await
    }

    async fn page_metadata(&self, page: &Page) -> PageMetadata {
        let properties = &page.properties;

        let memo_title = find_by_property_type_title(properties)
            .or_else(|| find_by_key_includes(properties, TITLE_FRAGMENTS))
            .unwrap_or_else(|| "Untitled".to_string());

        let book_id = related_book_page_id(page);
        let book = match &book_id {
            Some(id) => self.book_reference(id).await,
            None => None,
        };

        let tags = find_multi_select_by_exact_key(properties, TAGS_KEY)
            .or_else(|| find_multi_select_by_key_includes(properties, TAGS_FRAGMENTS))
            .unwrap_or_default();

        let note = find_by_exact_key(properties, NOTE_KEY)
            .or_else(|| find_by_key_includes(properties, NOTE_FRAGMENTS))
            .unwrap_or_default();

        PageMetadata {
            memo_title,
            memo_url: page.url.clone().unwrap_or_default(),
            book_id,
            book_title: book.as_ref().map(|b| b.title.clone()),
            book_url: book.as_ref().map(|b| b.url.clone()),
            tags,
            note,
        }
    }

    async fn flatten_content(&self, page_id: &str) -> Result<String> {
        flatten_blocks(self, page_id).await
    }
}

// ============ Block flattening ============

/// Depth-first, pre-order flattening of a block tree into plain text.
///
/// Iterative, with a visited-id set and a depth cap: the source gives no
/// structural guarantee, so a cyclic or absurdly deep response must
/// terminate instead of recursing forever.
pub async fn flatten_blocks(source: &dyn BlockSource, root_id: &str) -> Result<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(root_id.to_string());

    let mut stack: Vec<VecDeque<Block>> = vec![source.block_children(root_id).await?.into()];

    while let Some(frame) = stack.last_mut() {
        let Some(block) = frame.pop_front() else {
            stack.pop();
            continue;
        };

        let text = block_plain_text(&block);
        if !text.is_empty() {
            lines.push(text);
        }

        if block.has_children {
            if stack.len() >= MAX_BLOCK_DEPTH {
                tracing::warn!(block_id = %block.id, "block tree exceeds depth cap, skipping subtree");
                continue;
            }
            if !visited.insert(block.id.clone()) {
                tracing::warn!(block_id = %block.id, "cycle in block tree, skipping revisit");
                continue;
            }
            let children = source.block_children(&block.id).await?;
            stack.push(children.into());
        }
    }

    Ok(lines.join("\n").trim().to_string())
}

/// Extract the display text of one block: primary rich text plus caption,
/// and for `embed` blocks also the target URL.
pub fn block_plain_text(block: &Block) -> String {
    #[derive(Deserialize, Default)]
    struct Payload {
        #[serde(default)]
        rich_text: Vec<RichText>,
        #[serde(default)]
        caption: Vec<RichText>,
        #[serde(default)]
        url: Option<String>,
    }

    let Some(entry) = block.payload.get(&block.block_type) else {
        return String::new();
    };
    let payload: Payload = match serde_json::from_value(entry.clone()) {
        Ok(payload) => payload,
        Err(_) => return String::new(),
    };

    let rich = extract_rich_text(&payload.rich_text);
    let caption = extract_rich_text(&payload.caption);

    let mut parts = vec![rich, caption];
    if block.block_type == "embed" {
        if let Some(url) = payload.url {
            parts.push(url);
        }
    }

    parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

// ============ Property resolution ============

fn extract_rich_text(spans: &[RichText]) -> String {
    spans
        .iter()
        .filter_map(|span| span.plain_text.as_deref())
        .collect::<String>()
        .trim()
        .to_string()
}

fn property_by_exact_key<'a>(
    properties: &'a HashMap<String, PropertyValue>,
    exact_key: &str,
) -> Option<&'a PropertyValue> {
    properties
        .iter()
        .find(|(key, _)| key.trim() == exact_key)
        .map(|(_, value)| value)
}

fn text_of(value: &PropertyValue) -> Option<String> {
    match value {
        PropertyValue::Title { title } => Some(extract_rich_text(title)),
        PropertyValue::RichText { rich_text } => Some(extract_rich_text(rich_text)),
        PropertyValue::Url { url } => Some(url.clone().unwrap_or_default()),
        _ => None,
    }
}

fn find_by_exact_key(
    properties: &HashMap<String, PropertyValue>,
    exact_key: &str,
) -> Option<String> {
    property_by_exact_key(properties, exact_key).and_then(text_of)
}

fn key_matches(key: &str, fragments: &[&str]) -> bool {
    let normalized = key.to_lowercase();
    fragments.iter().any(|fragment| normalized.contains(fragment))
}

fn find_by_key_includes(
    properties: &HashMap<String, PropertyValue>,
    fragments: &[&str],
) -> Option<String> {
    properties.iter().find_map(|(key, value)| {
        if !key_matches(key, fragments) {
            return None;
        }
        match value {
            PropertyValue::Title { title } => Some(extract_rich_text(title)),
            PropertyValue::RichText { rich_text } => Some(extract_rich_text(rich_text)),
            _ => None,
        }
    })
}

/// First property of title type, regardless of its name.
fn find_by_property_type_title(properties: &HashMap<String, PropertyValue>) -> Option<String> {
    properties.values().find_map(|value| match value {
        PropertyValue::Title { title } => Some(extract_rich_text(title)),
        _ => None,
    })
}

fn first_relation_id(refs: &[RelationRef]) -> Option<String> {
    refs.iter()
        .filter_map(|r| r.id.clone())
        .find(|id| !id.is_empty())
}

fn find_relation_by_exact_key(
    properties: &HashMap<String, PropertyValue>,
    exact_key: &str,
) -> Option<String> {
    match property_by_exact_key(properties, exact_key)? {
        PropertyValue::Relation { relation } => first_relation_id(relation),
        _ => None,
    }
}

fn find_relation_by_key_includes(
    properties: &HashMap<String, PropertyValue>,
    fragments: &[&str],
) -> Option<String> {
    properties.iter().find_map(|(key, value)| {
        if !key_matches(key, fragments) {
            return None;
        }
        match value {
            PropertyValue::Relation { relation } => first_relation_id(relation),
            _ => None,
        }
    })
}

fn find_multi_select_by_exact_key(
    properties: &HashMap<String, PropertyValue>,
    exact_key: &str,
) -> Option<Vec<String>> {
    match property_by_exact_key(properties, exact_key)? {
        PropertyValue::MultiSelect { multi_select } => Some(
            multi_select
                .iter()
                .filter_map(|option| option.name.clone())
                .filter(|name| !name.is_empty())
                .collect(),
        ),
        _ => None,
    }
}

fn find_multi_select_by_key_includes(
    properties: &HashMap<String, PropertyValue>,
    fragments: &[&str],
) -> Option<Vec<String>> {
    properties.iter().find_map(|(key, value)| {
        if !key_matches(key, fragments) {
            return None;
        }
        match value {
            PropertyValue::MultiSelect { multi_select } => Some(
                multi_select
                    .iter()
                    .filter_map(|option| option.name.clone())
                    .filter(|name| !name.is_empty())
                    .collect(),
            ),
            _ => None,
        }
    })
}

/// Resolve the related book page id from a memo's relation property.
pub fn related_book_page_id(page: &Page) -> Option<String> {
    find_relation_by_exact_key(&page.properties, BOOK_RELATION_KEY)
        .or_else(|| find_relation_by_key_includes(&page.properties, BOOK_RELATION_FRAGMENTS))
}

fn dedup_non_empty(candidates: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| !candidate.is_empty() && seen.insert(candidate.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_from_json(json: serde_json::Value) -> Page {
        serde_json::from_value(json).unwrap()
    }

    fn sample_page() -> Page {
        page_from_json(serde_json::json!({
            "id": "page-1",
            "url": "https://notion.so/page-1",
            "last_edited_time": "2024-06-01T00:00:00Z",
            "properties": {
                "メモ": { "type": "title", "title": [
                    { "plain_text": "読書" }, { "plain_text": "メモ" }
                ]},
                "タグ": { "type": "multi_select", "multi_select": [
                    { "name": "philosophy" }, { "name": "" }, { "name": "history" }
                ]},
                "備考": { "type": "rich_text", "rich_text": [ { "plain_text": "p.42" } ]},
                "マルチメディアコンテンツリスト": { "type": "relation", "relation": [
                    { "id": "book-9" }
                ]},
                "謎のプロパティ": { "type": "rollup", "rollup": { "number": 3 } }
            }
        }))
    }

    #[test]
    fn test_unknown_property_types_deserialize_as_other() {
        let page = sample_page();
        assert!(matches!(
            page.properties.get("謎のプロパティ"),
            Some(PropertyValue::Other)
        ));
    }

    #[test]
    fn test_title_resolved_by_type() {
        let page = sample_page();
        assert_eq!(
            find_by_property_type_title(&page.properties),
            Some("読書メモ".to_string())
        );
    }

    #[test]
    fn test_tags_resolved_by_exact_locale_key() {
        let page = sample_page();
        let tags = find_multi_select_by_exact_key(&page.properties, TAGS_KEY).unwrap();
        assert_eq!(tags, vec!["philosophy".to_string(), "history".to_string()]);
    }

    #[test]
    fn test_tags_fall_back_to_key_fragment() {
        let page = page_from_json(serde_json::json!({
            "id": "p",
            "properties": {
                "Tags": { "type": "multi_select", "multi_select": [ { "name": "x" } ] }
            }
        }));
        assert_eq!(find_multi_select_by_exact_key(&page.properties, TAGS_KEY), None);
        assert_eq!(
            find_multi_select_by_key_includes(&page.properties, TAGS_FRAGMENTS),
            Some(vec!["x".to_string()])
        );
    }

    #[test]
    fn test_note_resolved_by_exact_key() {
        let page = sample_page();
        assert_eq!(
            find_by_exact_key(&page.properties, NOTE_KEY),
            Some("p.42".to_string())
        );
    }

    #[test]
    fn test_exact_key_match_trims_whitespace() {
        let page = page_from_json(serde_json::json!({
            "id": "p",
            "properties": {
                " 備考 ": { "type": "rich_text", "rich_text": [ { "plain_text": "n" } ] }
            }
        }));
        assert_eq!(find_by_exact_key(&page.properties, NOTE_KEY), Some("n".to_string()));
    }

    #[test]
    fn test_related_book_page_id_exact_then_fragment() {
        let page = sample_page();
        assert_eq!(related_book_page_id(&page), Some("book-9".to_string()));

        let fallback = page_from_json(serde_json::json!({
            "id": "p",
            "properties": {
                "Source Book": { "type": "relation", "relation": [ { "id": "book-2" } ] }
            }
        }));
        assert_eq!(related_book_page_id(&fallback), Some("book-2".to_string()));
    }

    #[test]
    fn test_block_plain_text_joins_text_and_caption() {
        let block: Block = serde_json::from_value(serde_json::json!({
            "id": "b1",
            "type": "image",
            "image": {
                "rich_text": [],
                "caption": [ { "plain_text": "a diagram" } ]
            }
        }))
        .unwrap();
        assert_eq!(block_plain_text(&block), "a diagram");
    }

    #[test]
    fn test_block_plain_text_embed_appends_url() {
        let block: Block = serde_json::from_value(serde_json::json!({
            "id": "b2",
            "type": "embed",
            "embed": {
                "caption": [ { "plain_text": "talk" } ],
                "url": "https://example.com/v"
            }
        }))
        .unwrap();
        assert_eq!(block_plain_text(&block), "talk https://example.com/v");
    }

    #[test]
    fn test_block_plain_text_unknown_payload_is_empty() {
        let block: Block = serde_json::from_value(serde_json::json!({
            "id": "b3",
            "type": "divider",
            "divider": {}
        }))
        .unwrap();
        assert_eq!(block_plain_text(&block), "");
    }

    #[test]
    fn test_dedup_non_empty_preserves_order() {
        let out = dedup_non_empty(vec![
            "a".to_string(),
            "".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert_eq!(out, vec!["a".to_string(), "b".to_string()]);
    }

    // ---- candidate resolution and failover ----

    /// How the fake answers the container-database lookup.
    enum Lookup {
        Found(&'static str),
        Empty,
        NotFound,
        Broken,
    }

    struct FakeQuery {
        lookup: Lookup,
        /// Data sources that answer listing; everything else errors.
        good_sources: HashMap<String, Vec<Page>>,
        queried: std::sync::Mutex<Vec<String>>,
    }

    impl FakeQuery {
        fn new(lookup: Lookup) -> Self {
            Self {
                lookup,
                good_sources: HashMap::new(),
                queried: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn with_source(mut self, id: &str, pages: Vec<Page>) -> Self {
            self.good_sources.insert(id.to_string(), pages);
            self
        }

        fn queried(&self) -> Vec<String> {
            self.queried.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DataSourceQuery for FakeQuery {
        async fn first_data_source_id(&self, _database_id: &str) -> Result<Option<String>> {
            match &self.lookup {
                Lookup::Found(id) => Ok(Some(id.to_string())),
                Lookup::Empty => Ok(None),
                Lookup::NotFound => bail!("notion_api_failed:404:object_not_found:gone"),
                Lookup::Broken => bail!("notion_api_failed:500:internal_server_error:boom"),
            }
        }

        async fn query_pages(&self, data_source_id: &str, _limit: SyncLimit) -> Result<Vec<Page>> {
            self.queried.lock().unwrap().push(data_source_id.to_string());
            match self.good_sources.get(data_source_id) {
                Some(pages) => Ok(pages.clone()),
                None => bail!(
                    "notion_api_failed:400:validation_error:{} is not a data source",
                    data_source_id
                ),
            }
        }
    }

    fn bare_page(id: &str) -> Page {
        Page {
            id: id.to_string(),
            ..Page::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_orders_override_then_lookup_then_database() {
        let query = FakeQuery::new(Lookup::Found("ds-found"));
        let candidates = resolve_candidates(&query, Some("ds-override"), Some("db-1"))
            .await
            .unwrap();
        assert_eq!(candidates, vec!["ds-override", "ds-found", "db-1"]);
    }

    #[tokio::test]
    async fn test_resolve_dedups_override_equal_to_lookup() {
        let query = FakeQuery::new(Lookup::Found("ds-1"));
        let candidates = resolve_candidates(&query, Some("ds-1"), Some("db-1"))
            .await
            .unwrap();
        assert_eq!(candidates, vec!["ds-1", "db-1"]);
    }

    #[tokio::test]
    async fn test_resolve_tolerates_missing_database_object() {
        // object_not_found means "no data-source sub-resource", not failure:
        // the raw database id remains queryable.
        let query = FakeQuery::new(Lookup::NotFound);
        let candidates = resolve_candidates(&query, None, Some("db-1")).await.unwrap();
        assert_eq!(candidates, vec!["db-1"]);
    }

    #[tokio::test]
    async fn test_resolve_propagates_other_lookup_errors() {
        let query = FakeQuery::new(Lookup::Broken);
        let err = resolve_candidates(&query, None, Some("db-1")).await.unwrap_err();
        assert!(err.to_string().contains("internal_server_error"));
    }

    #[tokio::test]
    async fn test_resolve_without_any_candidate_errors() {
        let query = FakeQuery::new(Lookup::Empty);
        let err = resolve_candidates(&query, None, None).await.unwrap_err();
        assert!(err.to_string().contains("notion_database_id_missing"));
    }

    #[tokio::test]
    async fn test_listing_fails_over_to_next_candidate() {
        let query = FakeQuery::new(Lookup::Empty)
            .with_source("ds-good", vec![bare_page("p1"), bare_page("p2")]);
        let candidates = vec!["ds-bad".to_string(), "ds-good".to_string()];

        let pages = list_with_failover(&query, &candidates, SyncLimit::Fifty)
            .await
            .unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].id, "p1");
        assert_eq!(query.queried(), vec!["ds-bad", "ds-good"]);
    }

    #[tokio::test]
    async fn test_listing_propagates_last_error_when_all_fail() {
        let query = FakeQuery::new(Lookup::Empty);
        let candidates = vec!["ds-a".to_string(), "ds-b".to_string()];

        let err = list_with_failover(&query, &candidates, SyncLimit::All)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("ds-b"));
        assert_eq!(query.queried(), vec!["ds-a", "ds-b"]);
    }

    // ---- traversal ----

    struct TreeSource {
        children: HashMap<String, Vec<Block>>,
    }

    fn text_block(id: &str, text: &str, has_children: bool) -> Block {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "type": "paragraph",
            "has_children": has_children,
            "paragraph": { "rich_text": [ { "plain_text": text } ] }
        }))
        .unwrap()
    }

    #[async_trait]
    impl BlockSource for TreeSource {
        async fn block_children(&self, block_id: &str) -> Result<Vec<Block>> {
            Ok(self.children.get(block_id).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_flatten_is_preorder_depth_first() {
        let mut children = HashMap::new();
        children.insert(
            "root".to_string(),
            vec![text_block("a", "A", true), text_block("b", "B", false)],
        );
        children.insert("a".to_string(), vec![text_block("a1", "A1", false)]);

        let flattened = flatten_blocks(&TreeSource { children }, "root").await.unwrap();
        assert_eq!(flattened, "A\nA1\nB");
    }

    #[tokio::test]
    async fn test_flatten_skips_empty_blocks() {
        let mut children = HashMap::new();
        children.insert(
            "root".to_string(),
            vec![text_block("a", "", false), text_block("b", "B", false)],
        );
        let flattened = flatten_blocks(&TreeSource { children }, "root").await.unwrap();
        assert_eq!(flattened, "B");
    }

    #[tokio::test]
    async fn test_flatten_terminates_on_cycles() {
        let mut children = HashMap::new();
        children.insert("root".to_string(), vec![text_block("a", "A", true)]);
        // Malformed source: "a" claims itself as a child.
        children.insert("a".to_string(), vec![text_block("a", "A", true)]);

        let flattened = flatten_blocks(&TreeSource { children }, "root").await.unwrap();
        assert_eq!(flattened, "A\nA");
    }
}
