pub mod accounts;
pub mod http_feed;

pub use accounts::{AccountCredential, AccountPool};
pub use http_feed::HttpFeedProvider;
