pub mod defs;
pub mod empty;
pub mod scripted;

pub use defs::{
    canonical_url, CandidateStream, FeedProvider, PostCandidate, PostId, PostRecord, PostSink,
    ProcessingState,
};
pub use empty::EmptyFeedProvider;
pub use scripted::ScriptedFeedProvider;
