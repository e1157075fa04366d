use futures::stream;

use crate::defs::CandidateStream;
use crate::defs::FeedProvider;

/// A provider with nothing upstream. Every fetch ends immediately.
pub struct EmptyFeedProvider;

impl FeedProvider for EmptyFeedProvider {
    fn name(&self) -> &str {
        "empty"
    }

    fn fetch<'a>(&'a self, _source: &'a str, _page_limit: usize) -> CandidateStream<'a> {
        // Nothing upstream, nothing new.
        Box::pin(stream::empty())
    }
}
