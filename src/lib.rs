pub mod cache;
pub mod config;
pub mod crawl;
pub mod db;
pub mod detect;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod http;
pub mod hub;
pub mod platform;
pub mod product;

pub use crawl::CrawlOrchestrator;
pub use error::{CrawlError, Result};
pub use hub::BroadcastHub;
