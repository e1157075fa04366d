use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::stream;

use crate::defs::{CandidateStream, FeedProvider, PostCandidate};

#[derive(Clone, Default)]
struct Timeline {
    posts: Vec<PostCandidate>,
    failure: Option<String>,
    fail_after: Option<usize>,
}

/// In-memory provider driven by a script of per-source timelines.
///
/// Timelines are always served newest first no matter the order they were
/// given in. Failures can be injected per source, either up front or after a
/// number of yielded items, and every yielded item is counted so callers can
/// check how far a consumer actually read.
#[derive(Clone, Default)]
pub struct ScriptedFeedProvider {
    timelines: Arc<Mutex<HashMap<String, Timeline>>>,
    pulled: Arc<Mutex<HashMap<String, usize>>>,
}

impl ScriptedFeedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the timeline served for `source`.
    pub fn set_posts(&self, source: &str, mut posts: Vec<PostCandidate>) {
        posts.sort_by(|a, b| b.id.cmp(&a.id));
        let mut timelines = self.timelines.lock().unwrap_or_else(|e| e.into_inner());
        let timeline = timelines.entry(source.to_owned()).or_default();
        timeline.posts = posts;
    }

    /// Add posts on top of whatever `source` already serves.
    pub fn push_posts(&self, source: &str, posts: Vec<PostCandidate>) {
        let mut all = {
            let timelines = self.timelines.lock().unwrap_or_else(|e| e.into_inner());
            timelines.get(source).map(|t| t.posts.clone()).unwrap_or_default()
        };
        all.extend(posts);
        self.set_posts(source, all);
    }

    /// Make every fetch for `source` fail with `message`.
    pub fn fail_source(&self, source: &str, message: &str) {
        let mut timelines = self.timelines.lock().unwrap_or_else(|e| e.into_inner());
        timelines.entry(source.to_owned()).or_default().failure = Some(message.to_owned());
    }

    /// Yield `count` items for `source`, then fail.
    pub fn fail_source_after(&self, source: &str, count: usize, message: &str) {
        let mut timelines = self.timelines.lock().unwrap_or_else(|e| e.into_inner());
        let timeline = timelines.entry(source.to_owned()).or_default();
        timeline.failure = Some(message.to_owned());
        timeline.fail_after = Some(count);
    }

    pub fn heal_source(&self, source: &str) {
        let mut timelines = self.timelines.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timeline) = timelines.get_mut(source) {
            timeline.failure = None;
            timeline.fail_after = None;
        }
    }

    /// Items handed out for `source` across all fetches so far.
    pub fn pulled(&self, source: &str) -> usize {
        let pulled = self.pulled.lock().unwrap_or_else(|e| e.into_inner());
        pulled.get(source).copied().unwrap_or(0)
    }
}

impl FeedProvider for ScriptedFeedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch<'a>(&'a self, source: &'a str, page_limit: usize) -> CandidateStream<'a> {
        let timeline = {
            let timelines = self.timelines.lock().unwrap_or_else(|e| e.into_inner());
            timelines.get(source).cloned().unwrap_or_default()
        };

        let mut items: Vec<anyhow::Result<PostCandidate>> = Vec::new();
        match (&timeline.failure, timeline.fail_after) {
            (Some(message), None) => {
                items.push(Err(anyhow::anyhow!("{}", message)));
            }
            (Some(message), Some(after)) => {
                let served = after.min(page_limit);
                items.extend(timeline.posts.into_iter().take(served).map(Ok));
                if served < page_limit {
                    items.push(Err(anyhow::anyhow!("{}", message)));
                }
            }
            (None, _) => {
                items.extend(timeline.posts.into_iter().take(page_limit).map(Ok));
            }
        }

        let pulled = self.pulled.clone();
        let source_key = source.to_owned();
        Box::pin(stream::iter(items.into_iter().map(move |item| {
            if item.is_ok() {
                let mut pulled = pulled.lock().unwrap_or_else(|e| e.into_inner());
                *pulled.entry(source_key.clone()).or_insert(0) += 1;
            }
            item
        })))
    }
}
