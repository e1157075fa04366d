use crate::config::HttpFeedConfig;
use crate::sources::accounts::AccountPool;
use crate::types::{IngestError, PostCandidate, Result};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::{DateTime, Utc};
use futures::stream;
use interfaces::{CandidateStream, FeedProvider, PostId};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use url::Url;

/// Reads account timelines from a JSON timeline service, newest first.
///
/// Handles are resolved to numeric user ids once and cached. Pages are
/// requested lazily: a consumer that stops reading stops the paging.
pub struct HttpFeedProvider {
    client: Client,
    config: HttpFeedConfig,
    accounts: AccountPool,
    user_ids: Arc<RwLock<HashMap<String, u64>>>,
}

struct PageState {
    user_id: Option<u64>,
    cursor: Option<String>,
    remaining: usize,
    buffer: VecDeque<PostCandidate>,
    exhausted: bool,
}

impl HttpFeedProvider {
    pub fn new(config: HttpFeedConfig, accounts: AccountPool) -> Result<Self> {
        Url::parse(&config.base_url)?;
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            config,
            accounts,
            user_ids: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn resolve_user_id(&self, handle: &str) -> Result<u64> {
        let key = handle.to_ascii_lowercase();
        if let Some(id) = self.user_ids.read().await.get(&key) {
            return Ok(*id);
        }

        let url = self.endpoint(&format!("users/by/username/{}", handle))?;
        let user: WireUser = self.get_json(handle, url).await?;
        let id = user
            .id
            .parse()
            .ok_or_else(|| IngestError::feed(handle, format!("unusable user id {:?}", user.id)))?;

        debug!(source = handle, user_id = id, "Resolved handle");
        self.user_ids.write().await.insert(key, id);
        Ok(id)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path
        ))?)
    }

    fn auth_headers(&self) -> HeaderMap {
        let account = self.accounts.next_account();
        let mut headers = HeaderMap::new();

        if let Ok(value) = HeaderValue::from_str(&account.cookies.header_value()) {
            headers.insert(COOKIE, value);
        }
        if let Some(token) = account.csrf_token() {
            if let Ok(value) = HeaderValue::from_str(&token) {
                headers.insert("x-csrf-token", value);
            }
        }
        if let Some(bearer) = &self.config.bearer_token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", bearer)) {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn get_json<T: DeserializeOwned>(&self, source: &str, url: Url) -> Result<T> {
        let retry_delay = Duration::from_secs(self.config.retry_delay_seconds);
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: retry_delay,
            initial_interval: retry_delay,
            max_interval: retry_delay * 32,
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.retry_delay_seconds.max(1) * 60)),
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            let sent = self
                .client
                .get(url.clone())
                .headers(self.auth_headers())
                .send()
                .await;

            match sent {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json::<T>().await?);
                    }

                    let err = IngestError::feed(
                        source,
                        format!("HTTP {} from {}", status, url.path()),
                    );
                    if !is_retryable(status) {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(e) => last_error = Some(IngestError::Http(e)),
            }

            if attempt < self.config.max_retries {
                if let Some(delay) = backoff.next_backoff() {
                    warn!("Attempt {} failed for {}, retrying in {:?}", attempt + 1, url, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
            break;
        }

        error!("Giving up on {} after {} attempts", url, self.config.max_retries + 1);
        Err(last_error.unwrap_or_else(|| IngestError::feed(source, "request failed")))
    }

    async fn fetch_page(&self, source: &str, user_id: u64, cursor: Option<&str>, limit: usize) -> Result<WirePage> {
        let mut url = self.endpoint(&format!("users/{}/posts", user_id))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }
        self.get_json(source, url).await
    }

    async fn next_candidate(
        &self,
        source: &str,
        mut state: PageState,
    ) -> anyhow::Result<Option<(PostCandidate, PageState)>> {
        loop {
            if state.remaining == 0 {
                return Ok(None);
            }
            if let Some(candidate) = state.buffer.pop_front() {
                state.remaining -= 1;
                return Ok(Some((candidate, state)));
            }
            if state.exhausted {
                return Ok(None);
            }

            let user_id = match state.user_id {
                Some(id) => id,
                None => {
                    let id = self.resolve_user_id(source).await?;
                    state.user_id = Some(id);
                    id
                }
            };

            let limit = state.remaining.min(self.config.page_size);
            let page = self
                .fetch_page(source, user_id, state.cursor.as_deref(), limit)
                .await?;

            let mut candidates: Vec<PostCandidate> = page
                .posts
                .into_iter()
                .filter(|p| !p.pinned)
                .filter_map(|p| match PostCandidate::try_from(p) {
                    Ok(candidate) => Some(candidate),
                    Err(e) => {
                        warn!(source, error = %e, "Dropping malformed post");
                        None
                    }
                })
                .collect();
            candidates.sort_by(|a, b| b.id.cmp(&a.id));

            debug!(source, count = candidates.len(), cursor = ?page.next_cursor, "Fetched page");

            state.exhausted = candidates.is_empty() || page.next_cursor.is_none();
            state.cursor = page.next_cursor;
            state.buffer.extend(candidates);
        }
    }
}

impl FeedProvider for HttpFeedProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch<'a>(&'a self, source: &'a str, page_limit: usize) -> CandidateStream<'a> {
        let state = PageState {
            user_id: None,
            cursor: None,
            remaining: page_limit,
            buffer: VecDeque::new(),
            exhausted: false,
        };
        Box::pin(stream::try_unfold(state, move |state| {
            self.next_candidate(source, state)
        }))
    }
}

// 401/403/404 will not fix themselves within one fetch.
fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Ids arrive as numbers or as decimal strings depending on the endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Num(u64),
    Text(String),
}

impl IdRepr {
    fn parse(&self) -> Option<u64> {
        match self {
            IdRepr::Num(n) => Some(*n),
            IdRepr::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireUser {
    #[serde(alias = "rest_id")]
    id: IdRepr,
}

#[derive(Debug, Deserialize)]
struct WirePage {
    #[serde(default)]
    posts: Vec<WirePost>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePost {
    id: IdRepr,
    #[serde(default)]
    username: String,
    #[serde(default, alias = "rawContent")]
    text: String,
    #[serde(alias = "date")]
    created_at: String,
    #[serde(default, alias = "retweeted_id")]
    reposted_id: Option<IdRepr>,
    #[serde(default)]
    pinned: bool,
}

impl TryFrom<WirePost> for PostCandidate {
    type Error = IngestError;

    fn try_from(post: WirePost) -> Result<Self> {
        let id = post
            .id
            .parse()
            .ok_or_else(|| IngestError::InvalidCandidate(format!("bad post id {:?}", post.id)))?;
        let reposted = match &post.reposted_id {
            Some(of) => Some(PostId(of.parse().ok_or_else(|| {
                IngestError::InvalidCandidate(format!("bad repost id {:?} on {}", of, id))
            })?)),
            None => None,
        };

        Ok(PostCandidate {
            id: PostId(id),
            author: post.username,
            text: post.text,
            created_at: parse_timestamp(&post.created_at)?,
            reposted,
        })
    }
}

/// RFC 3339, or the platform's legacy `Wed Oct 10 20:19:24 +0000 2018`.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y"))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IngestError::InvalidCandidate(format!("bad timestamp {:?}: {}", raw, e)))
}
