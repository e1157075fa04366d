use crate::types::{IngestError, Result};
use interfaces::{PostId, PostSink};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Per-source "highest id already ingested".
///
/// The sink is the recovery source of truth: the first time a source is
/// needed its mark is read back from storage, after that it is held in
/// memory and only ever moves up. A source whose recovery failed has no
/// mark at all and must not be pulled. Handles are matched
/// case-insensitively, the same way storage matches them.
pub struct WatermarkStore {
    sink: Arc<dyn PostSink>,
    marks: RwLock<HashMap<String, PostId>>,
}

impl WatermarkStore {
    pub fn new(sink: Arc<dyn PostSink>) -> Self {
        Self {
            sink,
            marks: RwLock::new(HashMap::new()),
        }
    }

    /// Read the persisted high id for `source` and merge it into memory.
    /// Returns `PostId::ZERO` for a source that never stored anything.
    pub async fn recover(&self, source: &str) -> Result<PostId> {
        let persisted = self
            .sink
            .max_id(source)
            .await
            .map_err(|e| IngestError::recovery(source, e))?;

        let mark = self.advance(source, persisted).await;
        info!(source, watermark = %mark, "Recovered watermark");
        Ok(mark)
    }

    /// In-memory mark, recovering it from storage on first use.
    pub async fn ensure(&self, source: &str) -> Result<PostId> {
        if let Some(mark) = self.current(source).await {
            return Ok(mark);
        }
        self.recover(source).await
    }

    /// `None` until the source has been recovered.
    pub async fn current(&self, source: &str) -> Option<PostId> {
        self.marks.read().await.get(&source_key(source)).copied()
    }

    /// Raise the mark for `source` to `candidate` if it is higher.
    /// Returns the mark after the update.
    pub async fn advance(&self, source: &str, candidate: PostId) -> PostId {
        let mut marks = self.marks.write().await;
        let mark = marks.entry(source_key(source)).or_insert(PostId::ZERO);
        if candidate > *mark {
            debug!(source, from = %mark, to = %candidate, "Watermark advanced");
            *mark = candidate;
        }
        *mark
    }

    /// Marks keyed by lowercased handle.
    pub async fn snapshot(&self) -> HashMap<String, PostId> {
        self.marks.read().await.clone()
    }
}

fn source_key(source: &str) -> String {
    source.to_ascii_lowercase()
}
