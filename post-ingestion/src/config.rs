use crate::types::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CONFIG_PATH: &str = "INGEST_CONFIG_PATH";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const DEFAULT_CONFIG_PATH: &str = "config/ingest.toml";

/// Static settings, loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Account handles to follow, in the order they are visited each cycle.
    pub sources: Vec<String>,
    pub poll_interval_secs: u64,
    /// Upper bound on candidates pulled per source per cycle.
    pub page_limit: usize,
    pub database_url: String,
    pub max_concurrent_sources: usize,
    /// When set, every newly stored post is also dumped here as JSON.
    pub export_dir: Option<PathBuf>,
    pub url_base: String,
    pub http: HttpFeedConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            poll_interval_secs: 30,
            page_limit: 10,
            database_url: "sqlite://data/posts.db".to_string(),
            max_concurrent_sources: 1,
            export_dir: None,
            url_base: "https://twitter.com".to_string(),
            http: HttpFeedConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpFeedConfig {
    pub base_url: String,
    pub credentials_path: PathBuf,
    /// Sent as `Authorization: Bearer …` when set.
    pub bearer_token: Option<String>,
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    /// Items requested per HTTP page; a fetch may span several pages.
    pub page_size: usize,
}

impl Default for HttpFeedConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            credentials_path: PathBuf::from("cookies/accounts.json"),
            bearer_token: None,
            user_agent: "post-ingestion/0.1".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_seconds: 2,
            page_size: 20,
        }
    }
}

impl IngestConfig {
    /// Parse, normalise and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut config: IngestConfig = toml::from_str(s)?;
        config.sources = clean_sources(std::mem::take(&mut config.sources))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("reading config from {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// `$INGEST_CONFIG_PATH`, falling back to `config/ingest.toml`.
    /// Environment overrides are applied on top.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        if !path.exists() {
            return Err(IngestError::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|u| !u.trim().is_empty()) {
            self.database_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(IngestError::Config("no sources configured".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(IngestError::Config("poll_interval_secs must be positive".to_string()));
        }
        if self.page_limit == 0 {
            return Err(IngestError::Config("page_limit must be positive".to_string()));
        }
        if self.max_concurrent_sources == 0 {
            return Err(IngestError::Config(
                "max_concurrent_sources must be at least 1".to_string(),
            ));
        }
        if self.database_url.trim().is_empty() {
            return Err(IngestError::Config("database_url is empty".to_string()));
        }
        url::Url::parse(&self.url_base)?;
        if self.http.page_size == 0 {
            return Err(IngestError::Config("http.page_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Trim, strip a leading `@`, drop blanks and repeats. Handles compare
/// case-insensitively; the first spelling wins so the configured visiting
/// order is kept.
fn clean_sources(items: Vec<String>) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let handle = item.trim().trim_start_matches('@');
        if handle.is_empty() {
            continue;
        }
        if !handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(IngestError::Config(format!("invalid source handle: {:?}", item)));
        }
        if !out.iter().any(|h| h.eq_ignore_ascii_case(handle)) {
            out.push(handle.to_string());
        }
    }
    Ok(out)
}
