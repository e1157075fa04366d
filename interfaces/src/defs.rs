use std::fmt;
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

/// Platform post identifier. Doubles as the primary key and as time order:
/// a larger id is always a newer post.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub u64);

impl PostId {
    /// "Never seen anything" for a source.
    pub const ZERO: PostId = PostId(0);

    pub fn get(self) -> u64 {
        self.0
    }

    /// SQL engines store integers signed; ids above `i64::MAX` are rejected
    /// when a record is built, so this never truncates a stored id.
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(value: i64) -> Self {
        PostId(value.max(0) as u64)
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PostId {
    fn from(value: u64) -> Self {
        PostId(value)
    }
}

/// One item as handed over by a feed provider, before any filtering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCandidate {
    pub id: PostId,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Id of the re-shared post; `None` for an original.
    pub reposted: Option<PostId>,
}

impl PostCandidate {
    pub fn original(id: u64, author: &str, text: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: PostId(id),
            author: author.to_owned(),
            text: text.to_owned(),
            created_at,
            reposted: None,
        }
    }

    pub fn repost(id: u64, author: &str, of: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: PostId(id),
            author: author.to_owned(),
            text: String::new(),
            created_at,
            reposted: Some(PostId(of)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingState {
    #[default]
    Unprocessed,
    Processed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Unprocessed => "unprocessed",
            ProcessingState::Processed => "processed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unprocessed" => Some(ProcessingState::Unprocessed),
            "processed" => Some(ProcessingState::Processed),
            _ => None,
        }
    }
}

/// A persisted original post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: PostId,
    pub source: String,
    /// Handle the platform reported as the writer of the post.
    pub author: String,
    pub url: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub state: ProcessingState,
}

impl PostRecord {
    /// Build a record for `source` from a provider candidate.
    ///
    /// The record is keyed on the configured source handle; the permalink
    /// uses the author handle the platform reported, falling back to the
    /// source when the provider left it blank. Rejects reposts, the zero id
    /// and ids that do not fit a signed 64-bit column.
    pub fn from_candidate(candidate: &PostCandidate, source: &str, url_base: &str) -> Result<Self> {
        if candidate.reposted.is_some() {
            anyhow::bail!("post {} is a repost", candidate.id);
        }
        if candidate.id == PostId::ZERO || candidate.id.0 > i64::MAX as u64 {
            anyhow::bail!("post id {} is out of range", candidate.id);
        }
        let source = source.trim();
        if source.is_empty() {
            anyhow::bail!("post {} has no source handle", candidate.id);
        }
        let author = match candidate.author.trim() {
            "" => source,
            author => author,
        };
        Ok(Self {
            id: candidate.id,
            source: source.to_owned(),
            author: author.to_owned(),
            url: canonical_url(url_base, author, candidate.id),
            text: candidate.text.clone(),
            created_at: candidate.created_at,
            state: ProcessingState::Unprocessed,
        })
    }
}

/// `https://twitter.com/{handle}/status/{id}` style permalink.
pub fn canonical_url(url_base: &str, handle: &str, id: PostId) -> String {
    format!("{}/{}/status/{}", url_base.trim_end_matches('/'), handle, id)
}

/// Newest-first candidates for one source. Dropping the stream stops the
/// provider from doing any further work for that call.
pub type CandidateStream<'a> = Pin<Box<dyn Stream<Item = Result<PostCandidate>> + Send + 'a>>;

/// Upstream of the ingestion loop. Auth, paging and rate limits live here.
pub trait FeedProvider: Send + Sync {
    fn name(&self) -> &str;

    /// At most `page_limit` candidates for `source`, ordered by descending id.
    fn fetch<'a>(&'a self, source: &'a str, page_limit: usize) -> CandidateStream<'a>;
}

/// Durable, idempotent post storage keyed by post id.
#[async_trait]
pub trait PostSink: Send + Sync {
    /// Insert-if-absent. Returns whether a new row was written.
    async fn upsert(&self, record: &PostRecord) -> Result<bool>;

    /// Write a source's batch and its new watermark in one commit.
    /// Returns the ids from `records` that were not stored before.
    async fn persist_batch(&self, source: &str, records: &[PostRecord], watermark: PostId) -> Result<Vec<PostId>>;

    /// Highest id recorded for `source`, `PostId::ZERO` if none.
    async fn max_id(&self, source: &str) -> Result<PostId>;
}
