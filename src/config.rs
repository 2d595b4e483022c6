use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub server: ServerConfig,
}

/// Persistent store backend. `sqlite` keeps the mirror in a local file;
/// `rest` talks to a PostgREST-style endpoint (e.g. Supabase).
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_provider")]
    pub provider: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_store_table")]
    pub table: String,
}

fn default_store_provider() -> String {
    "sqlite".to_string()
}
fn default_store_table() -> String {
    "memos".to_string()
}

/// The Notion workspace the memos live in.
///
/// The API token is read from the `NOTION_TOKEN` environment variable,
/// never from the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Container database id. May be omitted when `data_source_id` is set.
    #[serde(default)]
    pub database_id: Option<String>,
    /// Explicit data source override, tried before database resolution.
    #[serde(default)]
    pub data_source_id: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_api_base() -> String {
    "https://api.notion.com/v1".to_string()
}
fn default_api_version() -> String {
    "2025-09-03".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate store
    match config.store.provider.as_str() {
        "sqlite" => {
            if config.store.path.is_none() {
                anyhow::bail!("store.path is required when store.provider is 'sqlite'");
            }
        }
        "rest" => {
            if config.store.base_url.is_none() {
                anyhow::bail!("store.base_url is required when store.provider is 'rest'");
            }
        }
        other => anyhow::bail!(
            "Unknown store provider: '{}'. Must be sqlite or rest.",
            other
        ),
    }

    // Validate source: listing needs at least one dataset candidate
    if config.source.database_id.is_none() && config.source.data_source_id.is_none() {
        anyhow::bail!("source.database_id or source.data_source_id must be set");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_sqlite_config() {
        let file = write_config(
            r#"
[store]
path = "./data/memos.sqlite"

[source]
database_id = "db-123"

[server]
bind = "127.0.0.1:7878"
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.store.provider, "sqlite");
        assert_eq!(config.store.table, "memos");
        assert_eq!(config.source.api_base, "https://api.notion.com/v1");
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_rest_store_requires_base_url() {
        let file = write_config(
            r#"
[store]
provider = "rest"

[source]
database_id = "db-123"

[server]
bind = "127.0.0.1:7878"
"#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_source_needs_a_candidate() {
        let file = write_config(
            r#"
[store]
path = "./m.sqlite"

[source]

[server]
bind = "127.0.0.1:7878"
"#,
        );
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let file = write_config(
            r#"
[store]
path = "./m.sqlite"

[source]
data_source_id = "ds-9"

[embedding]
provider = "openai"

[server]
bind = "127.0.0.1:7878"
"#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("dims"));
    }
}
