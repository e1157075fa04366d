pub mod types;
pub mod config;
pub mod filter;
pub mod store;
pub mod watermark;
pub mod export;
pub mod controller;
pub mod sources;

pub use types::*;
pub use config::{HttpFeedConfig, IngestConfig};
pub use controller::{next_delay, IngestController};
pub use export::JsonExporter;
pub use sources::{AccountPool, HttpFeedProvider};
pub use store::PostStore;
pub use watermark::WatermarkStore;
