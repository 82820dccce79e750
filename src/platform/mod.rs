pub mod shopify;
pub mod shopline;
pub mod sitemap;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::product::Product;

/// Storefront engines the crawler knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Shopline,
    Shopify,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Shopline => "shopline",
            Platform::Shopify => "shopify",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extraction options shared by every platform.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub locale: String,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            locale: "zh-hant".into(),
        }
    }
}

/// One extractor per platform, chosen by the detected [`Platform`].
pub enum Extractor {
    Shopline(shopline::ShoplineExtractor),
    Shopify(shopify::ShopifyExtractor),
}

impl Extractor {
    pub fn for_platform(platform: Platform, fetcher: Arc<dyn Fetcher>, opts: &ExtractOptions) -> Self {
        match platform {
            Platform::Shopline => {
                Extractor::Shopline(shopline::ShoplineExtractor::new(fetcher, opts.locale.clone()))
            }
            Platform::Shopify => Extractor::Shopify(shopify::ShopifyExtractor::new(fetcher)),
        }
    }

    /// Products of the storefront in sitemap order. Any per-product failure
    /// aborts the whole batch.
    pub async fn extract(&self, storefront_url: &str) -> Result<Vec<Product>> {
        match self {
            Extractor::Shopline(x) => x.extract(storefront_url).await,
            Extractor::Shopify(x) => x.extract(storefront_url).await,
        }
    }
}
