use std::sync::Arc;

use tracing::{error, info};

use crate::db::ProductStore;
use crate::detect;
use crate::error::{CrawlError, Result};
use crate::events::{CrawlEvent, EventKind};
use crate::fetcher::Fetcher;
use crate::hub::BroadcastHub;
use crate::platform::{ExtractOptions, Extractor};
use crate::product::{Page, Product};

/// `save_progress` cadence, in processed items.
const PROGRESS_EVERY: usize = 10;
const DEFAULT_PAGE_SIZE: usize = 10;

/// Runs one crawl end to end: detect, extract, persist, reporting progress
/// through the hub as it goes.
pub struct CrawlOrchestrator {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn ProductStore>,
    hub: Arc<BroadcastHub>,
    opts: ExtractOptions,
}

/// Canonical domain key: host names compare case-insensitively.
pub fn normalize_domain(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Key products are stored under: the host of the crawled URL.
pub fn store_domain(domain_url: &str) -> String {
    url::Url::parse(domain_url)
        .ok()
        .and_then(|u| u.host_str().map(normalize_domain))
        .unwrap_or_else(|| normalize_domain(domain_url))
}

fn event(kind: EventKind, domain_url: &str, status: &str, message: &str) -> CrawlEvent {
    CrawlEvent::new(kind)
        .with("domain_url", domain_url)
        .with("status", status)
        .with("message", message)
}

impl CrawlOrchestrator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn ProductStore>,
        hub: Arc<BroadcastHub>,
        opts: ExtractOptions,
    ) -> Self {
        CrawlOrchestrator {
            fetcher,
            store,
            hub,
            opts,
        }
    }

    /// Crawl `domain_url` and return how many products were saved.
    pub async fn crawl(&self, domain_url: &str) -> Result<usize> {
        info!("Getting products from domain: {}", domain_url);
        self.hub.broadcast(event(
            EventKind::CrawlStarted,
            domain_url,
            "started",
            "Starting to crawl domain",
        ));

        let platform = match detect::detect_url(self.fetcher.as_ref(), domain_url).await {
            Ok(platform) => platform,
            Err(e) => {
                error!("Failed to get provider from domain {}: {}", domain_url, e);
                self.hub.broadcast(
                    event(
                        EventKind::CrawlError,
                        domain_url,
                        "error",
                        "Failed to identify provider for domain",
                    )
                    .with("error", e.to_string()),
                );
                return Err(CrawlError::ProviderNotFound);
            }
        };

        self.hub.broadcast(
            event(
                EventKind::ProviderIdentified,
                domain_url,
                "provider_found",
                "Provider identified, starting product extraction",
            )
            .with("provider", platform.as_str()),
        );

        let extractor = Extractor::for_platform(platform, Arc::clone(&self.fetcher), &self.opts);
        let products = match extractor.extract(domain_url).await {
            Ok(products) => products,
            Err(e) => {
                error!("Failed to process products from {}: {}", domain_url, e);
                self.hub.broadcast(
                    event(
                        EventKind::CrawlError,
                        domain_url,
                        "error",
                        "Failed to process products from domain",
                    )
                    .with("error", e.to_string()),
                );
                return Err(e);
            }
        };

        let total = products.len();
        info!("Fetched {} products from {}", total, domain_url);
        self.hub.broadcast(
            event(
                EventKind::ProductsFetched,
                domain_url,
                "products_fetched",
                "Products extracted, starting database save",
            )
            .with("products_count", total),
        );

        let saved = self.save_all(domain_url, &products).await;

        info!("Crawl of {} completed: {}/{} saved", domain_url, saved, total);
        self.hub.broadcast(
            event(
                EventKind::CrawlCompleted,
                domain_url,
                "completed",
                "Domain crawling completed successfully",
            )
            .with("products_count", saved),
        );
        Ok(saved)
    }

    /// Persist each product; failures are logged and skipped.
    async fn save_all(&self, domain_url: &str, products: &[Product]) -> usize {
        let domain = store_domain(domain_url);
        let total = products.len();
        let mut saved = 0usize;

        for (i, product) in products.iter().enumerate() {
            match self.store.upsert_product(&domain, product).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    error!("Failed to save product {} for {}: {}", product.name, domain, e);
                }
            }

            if (i + 1) % PROGRESS_EVERY == 0 || i + 1 == total {
                let percent = saved as f64 / total as f64 * 100.0;
                self.hub.broadcast(
                    event(
                        EventKind::SaveProgress,
                        domain_url,
                        "saving",
                        "Saving products to database",
                    )
                    .with("saved_count", saved)
                    .with("total_count", total)
                    .with("progress_percent", percent),
                );
            }
        }
        saved
    }

    /// One page of stored products. Out-of-range `page`/`page_size` fall back
    /// to the first page of ten.
    pub async fn list_products(&self, domain: &str, page: i64, page_size: i64) -> Result<Page<Product>> {
        let domain = normalize_domain(domain);
        let domain = domain.as_str();
        let page = usize::try_from(page).ok().filter(|p| *p >= 1).unwrap_or(1);
        let page_size = usize::try_from(page_size)
            .ok()
            .filter(|s| *s >= 1)
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let items = self.store.get_products(domain, page, page_size).await.map_err(|e| {
            error!(domain, error = %e, "Failed to get products");
            e
        })?;
        let total = self.store.get_total_products(domain).await?;
        Ok(Page::new(items, page, page_size, total))
    }
}
