use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const ENV_PREFIX: &str = "CRAWLER";

/// Runtime settings, read from `CRAWLER_*` environment variables over defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen_addr: String,
    pub db_path: String,
    pub cache_enabled: bool,
    pub cache_ttl_hours: u64,
    pub cache_queue: usize,
    pub subscriber_capacity: usize,
    pub heartbeat_secs: u64,
    /// Translation key used for product title and description.
    pub locale: String,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_addr: "0.0.0.0:8080".into(),
            db_path: "data/crawler.sqlite".into(),
            cache_enabled: true,
            cache_ttl_hours: 730,
            cache_queue: 64,
            subscriber_capacity: 10,
            heartbeat_secs: 30,
            locale: "zh-hant".into(),
            request_timeout_secs: 30,
            user_agent: concat!("storefront_crawler/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let d = Settings::default();
        config::Config::builder()
            .set_default("listen_addr", d.listen_addr)?
            .set_default("db_path", d.db_path)?
            .set_default("cache_enabled", d.cache_enabled)?
            .set_default("cache_ttl_hours", d.cache_ttl_hours as i64)?
            .set_default("cache_queue", d.cache_queue as i64)?
            .set_default("subscriber_capacity", d.subscriber_capacity as i64)?
            .set_default("heartbeat_secs", d.heartbeat_secs as i64)?
            .set_default("locale", d.locale)?
            .set_default("request_timeout_secs", d.request_timeout_secs as i64)?
            .set_default("user_agent", d.user_agent)?
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 3600)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
