use thiserror::Error;

/// Failures of the crawl pipeline and the progress hub.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("suitable provider not found for the given URL")]
    ProviderNotFound,

    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("no product URLs found in sitemap")]
    NoProductsFound,

    #[error("failed to persist product: {0}")]
    Persistence(String),

    #[error("failed to deliver event to subscriber {0}")]
    SubscriberDelivery(String),
}

impl CrawlError {
    pub fn fetch(url: &str, reason: impl ToString) -> Self {
        CrawlError::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn extraction(reason: impl Into<String>) -> Self {
        CrawlError::ExtractionFailed(reason.into())
    }

    /// Zero candidates is reported separately but belongs to the extraction family.
    pub fn is_extraction(&self) -> bool {
        matches!(
            self,
            CrawlError::ExtractionFailed(_) | CrawlError::NoProductsFound
        )
    }
}

pub type Result<T, E = CrawlError> = std::result::Result<T, E>;

impl From<rusqlite::Error> for CrawlError {
    fn from(e: rusqlite::Error) -> Self {
        CrawlError::Persistence(e.to_string())
    }
}
