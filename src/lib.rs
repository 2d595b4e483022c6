//! # memo-sync
//!
//! An incremental Notion-to-store sync pipeline for a personal reading-memo
//! knowledge base.
//!
//! memo-sync mirrors memo pages from a Notion workspace into a persistent
//! store: it lists remote pages, diffs their edit times against previously
//! synced state, flattens each changed page's block tree into plain text,
//! normalizes and embeds that text, and idempotently upserts records —
//! streaming typed progress events back to the caller as NDJSON.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────────────────┐   ┌───────────┐
//! │  Notion  │──▶│        Sync pipeline         │──▶│   Store    │
//! │ list/walk│   │ diff → flatten → normalize   │   │ SQLite or │
//! └──────────┘   │      → embed → upsert        │   │ PostgREST │
//!                └──────────────┬───────────────┘   └───────────┘
//!                               │ events
//!                   ┌───────────┴───────────┐
//!                   ▼                       ▼
//!             ┌──────────┐           ┌──────────┐
//!             │   CLI    │           │   HTTP   │
//!             │(memosync)│           │ (NDJSON) │
//!             └──────────┘           └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! memosync init                    # create the local database
//! memosync sync --limit 50         # sync the 50 most recently edited memos
//! memosync sync --limit all        # full sync
//! memosync serve                   # start the HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and wire shapes |
//! | [`notion`] | Document source client: listing, metadata, block flattening |
//! | [`diff`] | Edit-time change detection |
//! | [`normalize`] | Content normalization |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Persistent store backends |
//! | [`sync`] | Run orchestration and event emission |
//! | [`stream`] | NDJSON event framing |
//! | [`auth`] | Caller identity and allow-list |
//! | [`server`] | Sync HTTP server |

pub mod auth;
pub mod config;
pub mod diff;
pub mod embedding;
pub mod models;
pub mod normalize;
pub mod notion;
pub mod server;
pub mod store;
pub mod stream;
pub mod sync;
