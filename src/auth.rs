//! Caller identity and the static allow-list.
//!
//! Every sync trigger resolves the caller first: a missing bearer token is
//! "authentication required", a token outside the allow-list is "not
//! authorized". Both checks run before any pipeline work. The allow-list
//! comes from the `MEMO_SYNC_ALLOWED_TOKENS` environment variable
//! (comma-separated), never from the config file.

use axum::http::{header, HeaderMap};

pub const ALLOWED_TOKENS_ENV: &str = "MEMO_SYNC_ALLOWED_TOKENS";

/// Extract the caller's bearer token, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Read the configured allow-list from the environment.
pub fn allowed_tokens_from_env() -> Vec<String> {
    std::env::var(ALLOWED_TOKENS_ENV)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(String::from)
        .collect()
}

/// An empty allow-list authorizes nobody.
pub fn is_allowed_token(token: &str, allowed: &[String]) -> bool {
    let token = token.trim();
    if token.is_empty() || allowed.is_empty() {
        return false;
    }
    allowed.iter().any(|candidate| candidate == token)
}
