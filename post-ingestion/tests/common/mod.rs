#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{stream, StreamExt};
use interfaces::{CandidateStream, FeedProvider, PostCandidate, PostId, PostRecord, PostSink, ScriptedFeedProvider};
use post_ingestion::{IngestConfig, PostStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub async fn memory_store() -> Result<Arc<PostStore>> {
    Ok(Arc::new(PostStore::new("sqlite::memory:").await?))
}

pub fn config(sources: &[&str]) -> IngestConfig {
    IngestConfig {
        sources: sources.iter().map(|s| s.to_string()).collect(),
        database_url: "sqlite::memory:".to_string(),
        ..Default::default()
    }
}

pub fn at(id: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000 + id as i64, 0).unwrap()
}

pub fn original(id: u64, author: &str) -> PostCandidate {
    PostCandidate::original(id, author, &format!("post {}", id), at(id))
}

pub fn repost(id: u64, author: &str, of: u64) -> PostCandidate {
    PostCandidate::repost(id, author, of, at(id))
}

pub fn record(id: u64, source: &str) -> PostRecord {
    PostRecord::from_candidate(&original(id, source), source, "https://twitter.com").unwrap()
}

/// Sink kept in process memory, with switches to make either side fail.
#[derive(Default)]
pub struct MemorySink {
    posts: Mutex<BTreeMap<u64, PostRecord>>,
    marks: Mutex<HashMap<String, PostId>>,
    pub fail_persist: AtomicBool,
    pub fail_recovery: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stored ids for `source`, newest first.
    pub fn ids(&self, source: &str) -> Vec<u64> {
        let posts = self.posts.lock().unwrap();
        posts
            .values()
            .rev()
            .filter(|r| r.source == source)
            .map(|r| r.id.get())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.posts.lock().unwrap().len()
    }
}

#[async_trait]
impl PostSink for MemorySink {
    async fn upsert(&self, record: &PostRecord) -> Result<bool> {
        let mut posts = self.posts.lock().unwrap();
        if posts.contains_key(&record.id.get()) {
            return Ok(false);
        }
        posts.insert(record.id.get(), record.clone());
        Ok(true)
    }

    async fn persist_batch(&self, source: &str, records: &[PostRecord], watermark: PostId) -> Result<Vec<PostId>> {
        if self.fail_persist.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        let mut posts = self.posts.lock().unwrap();
        let mut inserted = Vec::new();
        for record in records {
            if !posts.contains_key(&record.id.get()) {
                posts.insert(record.id.get(), record.clone());
                inserted.push(record.id);
            }
        }
        let mut marks = self.marks.lock().unwrap();
        let mark = marks.entry(source.to_string()).or_insert(PostId::ZERO);
        *mark = (*mark).max(watermark);
        Ok(inserted)
    }

    async fn max_id(&self, source: &str) -> Result<PostId> {
        if self.fail_recovery.load(Ordering::SeqCst) {
            anyhow::bail!("store unreachable");
        }
        let from_posts = self
            .posts
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.source == source)
            .map(|r| r.id)
            .max()
            .unwrap_or(PostId::ZERO);
        let from_marks = self.marks.lock().unwrap().get(source).copied().unwrap_or(PostId::ZERO);
        Ok(from_posts.max(from_marks))
    }
}

/// Wraps a scripted provider so every fetch takes `delay` before the first
/// item arrives, and records when each fetch started.
pub struct SlowProvider {
    pub inner: ScriptedFeedProvider,
    delay: Duration,
    starts: Mutex<Vec<(String, Instant)>>,
}

impl SlowProvider {
    pub fn new(inner: ScriptedFeedProvider, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            starts: Mutex::new(Vec::new()),
        }
    }

    pub fn starts(&self) -> Vec<(String, Instant)> {
        self.starts.lock().unwrap().clone()
    }
}

impl FeedProvider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    fn fetch<'a>(&'a self, source: &'a str, page_limit: usize) -> CandidateStream<'a> {
        self.starts.lock().unwrap().push((source.to_string(), Instant::now()));
        let delay = self.delay;
        let inner = self.inner.fetch(source, page_limit);
        Box::pin(
            stream::once(async move {
                tokio::time::sleep(delay).await;
                inner
            })
            .flatten(),
        )
    }
}
