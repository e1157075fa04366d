use chrono::{DateTime, Utc};
use interfaces::PostId;
use serde::{Deserialize, Serialize};

// Shared data model lives in the interfaces crate
pub use interfaces::{PostCandidate, PostRecord, ProcessingState};

/// How one source fared within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Pulled, persisted and watermark committed.
    Ingested,
    /// Provider failed; watermark untouched, retried next cycle.
    FeedFailed(String),
    /// Storage failed; nothing committed, retried next cycle.
    PersistFailed(String),
    /// Watermark could not be recovered; the source was not pulled.
    Skipped(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub status: SourceStatus,
    /// Candidates read before hitting the seen boundary or the page end.
    pub examined: usize,
    pub inserted: usize,
    pub reposts_skipped: usize,
    pub rejected: usize,
    pub watermark_before: PostId,
    pub watermark_after: PostId,
}

impl SourceReport {
    pub fn new(source: &str, watermark: PostId, status: SourceStatus) -> Self {
        Self {
            source: source.to_string(),
            status,
            examined: 0,
            inserted: 0,
            reposts_skipped: 0,
            rejected: 0,
            watermark_before: watermark,
            watermark_after: watermark,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, SourceStatus::Ingested)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub sources: Vec<SourceReport>,
    /// True when shutdown was requested before every source was visited.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }

    pub fn reposts_skipped(&self) -> usize {
        self.sources.iter().map(|s| s.reposts_skipped).sum()
    }

    pub fn succeeded(&self) -> usize {
        self.sources.iter().filter(|s| s.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| matches!(s.status, SourceStatus::FeedFailed(_) | SourceStatus::PersistFailed(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| matches!(s.status, SourceStatus::Skipped(_)))
            .count()
    }

    pub fn source(&self, name: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.source == name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Feed error for {source_id}: {message}")]
    Feed { source_id: String, message: String },

    #[error("Persistence error for {source_id}: {message}")]
    Persistence { source_id: String, message: String },

    #[error("Watermark recovery failed for {source_id}: {message}")]
    Recovery { source_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl IngestError {
    pub fn feed(source_id: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Feed { source_id: source_id.to_string(), message: format!("{:#}", err) }
    }

    pub fn persistence(source_id: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Persistence { source_id: source_id.to_string(), message: format!("{:#}", err) }
    }

    pub fn recovery(source_id: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Recovery { source_id: source_id.to_string(), message: format!("{:#}", err) }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
