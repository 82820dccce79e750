use scraper::{ElementRef, Html};
use tracing::{debug, info};

use crate::error::{CrawlError, Result};
use crate::fetcher::Fetcher;
use crate::platform::Platform;

const DNS_PREFETCH_REL: &str = "dns-prefetch";

/// CDN origins a storefront prefetches, mapped to the engine that serves them.
/// New platforms only need a row here.
const CDN_ORIGINS: &[(&str, Platform)] = &[
    ("https://cdn.shoplineapp.com", Platform::Shopline),
    ("https://cdn.shopify.com", Platform::Shopify),
];

fn normalize_origin(href: &str) -> String {
    let href = href.trim().trim_end_matches('/');
    match href.strip_prefix("//") {
        Some(rest) => format!("https://{}", rest),
        None => href.to_string(),
    }
}

fn lookup_origin(href: &str) -> Option<Platform> {
    let origin = normalize_origin(href);
    CDN_ORIGINS
        .iter()
        .find(|(cdn, _)| cdn.eq_ignore_ascii_case(&origin))
        .map(|(_, platform)| *platform)
}

fn is_dns_prefetch(el: &ElementRef<'_>) -> bool {
    el.value()
        .attr("rel")
        .is_some_and(|rel| rel.split_ascii_whitespace().any(|t| t.eq_ignore_ascii_case(DNS_PREFETCH_REL)))
}

/// Identify the storefront engine from the first matching
/// `<link rel="dns-prefetch">` hint, in document order.
pub fn detect(html: &str) -> Result<Platform> {
    if html.trim().is_empty() {
        return Err(CrawlError::ProviderNotFound);
    }

    let document = Html::parse_document(html);
    // descendants() walks the tree depth-first, pre-order
    for node in document.root_element().descendants() {
        let Some(el) = ElementRef::wrap(node) else {
            continue;
        };
        if el.value().name() != "link" || !is_dns_prefetch(&el) {
            continue;
        }
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        debug!(href, "dns-prefetch hint");
        if let Some(platform) = lookup_origin(href) {
            return Ok(platform);
        }
    }

    Err(CrawlError::ProviderNotFound)
}

/// Fetch a landing page and detect its platform.
pub async fn detect_url(fetcher: &dyn Fetcher, url: &str) -> Result<Platform> {
    info!("Fetching landing page: {}", url);
    let html = fetcher.fetch(url).await?;
    let platform = detect(&html)?;
    info!("Provider identified for {}: {}", url, platform.as_str());
    Ok(platform)
}
