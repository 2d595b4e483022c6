//! # memo-sync CLI (`memosync`)
//!
//! The `memosync` binary drives the memo sync pipeline from the command
//! line: database initialization, one-shot sync runs (local or against a
//! remote sync server), and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! memosync --config ./config/memosync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memosync init` | Create the SQLite database and run schema migrations |
//! | `memosync sync` | Run one sync pass (50 most recent memos by default) |
//! | `memosync sync --limit all` | Full paginated sync |
//! | `memosync serve` | Start the sync HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the local database
//! memosync init --config ./config/memosync.toml
//!
//! # Incremental sync of the latest 50 memos
//! memosync sync
//!
//! # Full sync, raw NDJSON events on stdout
//! memosync sync --limit all --ndjson
//!
//! # Run against a remote sync server instead of syncing locally
//! MEMO_SYNC_TOKEN=... memosync sync --remote https://memos.example.com
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use memo_sync::config::{self, Config};
use memo_sync::embedding::create_embedder;
use memo_sync::models::{SyncEvent, SyncLimit, SyncOptions, SyncResult};
use memo_sync::notion::NotionClient;
use memo_sync::store::{create_store, SqliteStore};
use memo_sync::stream::EventDecoder;
use memo_sync::sync::{clamp_preview_count, run_sync};

/// memo-sync CLI — incremental Notion-to-store sync for a personal
/// reading-memo knowledge base.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/memosync.example.toml` for a full example. Secrets
/// (`NOTION_TOKEN`, `OPENAI_API_KEY`, `SUPABASE_SERVICE_ROLE_KEY`) come
/// from the environment, never from the config file.
#[derive(Parser)]
#[command(
    name = "memosync",
    about = "memo-sync — incremental Notion-to-store sync for a reading-memo knowledge base",
    version,
    long_about = "memo-sync mirrors memo pages from a Notion workspace into a persistent store. \
    Each run lists remote pages, diffs their edit times against previously synced state, flattens \
    changed pages into plain text, embeds them, and idempotently upserts records, streaming typed \
    progress events as NDJSON."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/memosync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the `memos` table. Idempotent —
    /// running it multiple times is safe. Only meaningful for the `sqlite`
    /// store provider; a REST store owns its own schema.
    Init,

    /// Run one sync pass.
    ///
    /// Lists memo pages, diffs against persisted state, and upserts every
    /// changed memo. Progress events are printed per processed page; the
    /// exit code is non-zero when the run ends in a failed status.
    Sync {
        /// How many pages to consider: `50` (most recently edited, single
        /// request) or `all` (full pagination).
        #[arg(long, default_value = "50")]
        limit: String,

        /// Cap on the number of synced memos echoed back in the result
        /// preview (clamped into [1, 50]).
        #[arg(long)]
        preview_count: Option<f64>,

        /// Abort immediately with a forced failure, making no external
        /// calls. For testing failure handling end to end.
        #[arg(long)]
        force_fail: bool,

        /// Emit raw NDJSON events instead of human-readable progress.
        /// This is the default when stdout is not a terminal.
        #[arg(long)]
        ndjson: bool,

        /// Run against a remote sync server at this base URL instead of
        /// syncing locally. Reads the bearer token from `MEMO_SYNC_TOKEN`.
        #[arg(long)]
        remote: Option<String>,
    },

    /// Start the sync HTTP server.
    ///
    /// Binds to the address configured in `[server].bind` and serves
    /// `POST /sync` (NDJSON streaming) and `GET /health`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("memo_sync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            run_init(&cfg).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync {
            limit,
            preview_count,
            force_fail,
            ndjson,
            remote,
        } => {
            let limit = SyncLimit::parse(&serde_json::Value::String(limit.clone()))
                .with_context(|| format!("invalid --limit '{}': must be 50 or all", limit))?;
            let opts = SyncOptions {
                limit,
                force_fail,
                preview_count: clamp_preview_count(preview_count),
            };
            let ndjson = ndjson || !atty::is(atty::Stream::Stdout);

            let result = match remote {
                Some(base_url) => run_remote_sync(&base_url, &opts, ndjson).await?,
                None => run_local_sync(&cfg, opts, ndjson).await?,
            };

            if result.ok {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Serve => {
            memo_sync::server::run_server(&cfg).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_init(cfg: &Config) -> Result<()> {
    if cfg.store.provider != "sqlite" {
        anyhow::bail!(
            "init only applies to the sqlite store provider (configured: '{}')",
            cfg.store.provider
        );
    }
    let path = cfg
        .store
        .path
        .as_ref()
        .context("store.path is required for the sqlite provider")?;
    let store = SqliteStore::connect(path).await?;
    store.migrate().await?;
    println!("Database initialized at {}", path.display());
    Ok(())
}

/// Run the pipeline in-process, printing events as they arrive.
async fn run_local_sync(cfg: &Config, opts: SyncOptions, ndjson: bool) -> Result<SyncResult> {
    let store = create_store(&cfg.store).await?;
    let embedder = create_embedder(&cfg.embedding)?;
    let source = NotionClient::new(&cfg.source)?;

    let (tx, mut rx) = mpsc::channel::<SyncEvent>(32);
    let (result, print_result) = tokio::join!(
        run_sync(&source, embedder.as_ref(), store.as_ref(), opts, tx),
        async {
            while let Some(event) = rx.recv().await {
                print_event(&event, ndjson)?;
            }
            anyhow::Ok(())
        }
    );
    print_result?;

    Ok(result)
}

/// Drive a run on a remote sync server, relaying its event stream.
async fn run_remote_sync(base_url: &str, opts: &SyncOptions, ndjson: bool) -> Result<SyncResult> {
    let token = std::env::var("MEMO_SYNC_TOKEN")
        .context("MEMO_SYNC_TOKEN environment variable not set (required for --remote)")?;

    let body = serde_json::json!({
        "limit": opts.limit,
        "forceFail": opts.force_fail,
        "previewCount": opts.preview_count,
    });

    let url = format!("{}/sync", base_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .bearer_auth(&token)
        .header(reqwest::header::ACCEPT, "application/x-ndjson")
        .json(&body)
        .send()
        .await
        .with_context(|| format!("request to {} failed", url))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("sync server returned {}: {}", status, text);
    }

    let mut decoder = EventDecoder::new();
    let mut final_result: Option<SyncResult> = None;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("error reading event stream")?;
        for event in decoder.push(&chunk) {
            print_event(&event, ndjson)?;
            if let SyncEvent::Done { result } = event {
                final_result = Some(result);
            }
        }
    }

    final_result.context("event stream ended without a terminal done event")
}

fn print_event(event: &SyncEvent, ndjson: bool) -> Result<()> {
    if ndjson {
        let bytes = memo_sync::stream::encode_event(event)?;
        use std::io::Write;
        std::io::stdout().write_all(&bytes)?;
        return Ok(());
    }

    match event {
        SyncEvent::Start {
            fetched_count,
            diff_count,
            ..
        } => {
            println!("Fetched {} pages, {} changed.", fetched_count, diff_count);
        }
        SyncEvent::Progress {
            upsert_attempted_count,
            synced_count,
            failed_count,
            preview_item,
        } => {
            let title = preview_item
                .as_ref()
                .and_then(|item| item.book_title.as_deref())
                .unwrap_or("-");
            println!(
                "  [{}] synced {} failed {}  {}",
                upsert_attempted_count, synced_count, failed_count, title
            );
        }
        SyncEvent::Done { result } => {
            print_summary(result);
        }
    }
    Ok(())
}

fn print_summary(result: &SyncResult) {
    println!();
    println!("Sync {:?}:", result.status);
    println!("  Fetched:   {}", result.fetched_count);
    println!("  Changed:   {}", result.diff_count);
    println!("  Attempted: {}", result.upsert_attempted_count);
    println!("  Synced:    {}", result.synced_count);
    if !result.failed_ids.is_empty() {
        println!("  Failed:    {}", result.failed_ids.len());
        for item in &result.failed_ids {
            println!("    - {} ({})", item.id, item.memo_url);
        }
    }
    if let Some(error) = &result.error {
        println!("  Error:     {}: {}", error.code, error.message);
    }
}
