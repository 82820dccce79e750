use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cache::{CacheWriter, PageCache};
use crate::error::{CrawlError, Result};

/// Retrieves the body of a URL as text.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Plain reqwest fetcher. Non-2xx responses are errors.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CrawlError::fetch(url, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Non-success response from {}: {}", url, status);
            return Err(CrawlError::fetch(url, format!("HTTP {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CrawlError::fetch(url, e))?;
        debug!(
            url,
            bytes = body.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Fetched"
        );
        Ok(body)
    }
}

/// Consults the page cache before going to the network; fresh bodies are
/// handed to the cache writer queue instead of being written inline.
pub struct CachingFetcher<F> {
    inner: F,
    cache: Arc<PageCache>,
    writer: CacheWriter,
}

impl<F: Fetcher> CachingFetcher<F> {
    pub fn new(inner: F, cache: Arc<PageCache>, writer: CacheWriter) -> Self {
        CachingFetcher {
            inner,
            cache,
            writer,
        }
    }
}

#[async_trait]
impl<F: Fetcher> Fetcher for CachingFetcher<F> {
    async fn fetch(&self, url: &str) -> Result<String> {
        let cache = Arc::clone(&self.cache);
        let key = url.to_string();
        match tokio::task::spawn_blocking(move || cache.get(&key)).await {
            Ok(Ok(Some(body))) => {
                debug!(url, "Cache hit");
                return Ok(body);
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(url, error = %e, "Cache read failed"),
            Err(e) => warn!(url, error = %e, "Cache read task failed"),
        }

        info!("Cache miss, fetching: {}", url);
        let body = self.inner.fetch(url).await?;
        self.writer.enqueue(url, &body);
        Ok(body)
    }
}
