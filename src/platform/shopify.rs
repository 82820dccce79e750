use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info};

use super::sitemap;
use crate::error::{CrawlError, Result};
use crate::fetcher::Fetcher;
use crate::product::{Product, ProductStatus};

#[derive(Debug, Deserialize)]
pub struct ProductEnvelope {
    pub product: ShopifyProduct,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ShopifyProduct {
    pub title: String,
    pub body_html: Option<String>,
    pub product_type: Option<String>,
    pub tags: Option<String>,
    pub variants: Vec<Variant>,
    pub images: Vec<Image>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Variant {
    pub price: Option<String>,
    pub compare_at_price: Option<String>,
    pub inventory_quantity: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Image {
    pub src: String,
}

pub struct ShopifyExtractor {
    fetcher: Arc<dyn Fetcher>,
}

fn is_product_sitemap(loc: &str) -> bool {
    loc.contains("sitemap_products")
}

impl ShopifyExtractor {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        ShopifyExtractor { fetcher }
    }

    pub async fn extract(&self, storefront_url: &str) -> Result<Vec<Product>> {
        let urls = sitemap::discover_products(
            self.fetcher.as_ref(),
            storefront_url,
            Some(is_product_sitemap),
        )
        .await?;

        let mut products = Vec::with_capacity(urls.len());
        for url in &urls {
            let product = self.fetch_product(url).await.map_err(|e| {
                error!("Error processing product {}: {}", url, e);
                e
            })?;
            products.push(product);
        }
        Ok(products)
    }

    async fn fetch_product(&self, product_url: &str) -> Result<Product> {
        let json_url = json_url(product_url);
        info!("Fetching product json: {}", json_url);
        let body = self.fetcher.fetch(&json_url).await?;
        let envelope: ProductEnvelope = serde_json::from_str(&body).map_err(|e| {
            CrawlError::extraction(format!("{}: error parsing product JSON: {}", json_url, e))
        })?;
        map_product(envelope.product)
            .map_err(|e| CrawlError::extraction(format!("{}: {}", json_url, e)))
    }
}

/// `https://x/products/tee?variant=1#top` → `https://x/products/tee.json`
pub fn json_url(product_url: &str) -> String {
    let clean = product_url
        .split(['?', '#'])
        .next()
        .unwrap_or(product_url)
        .trim_end_matches('/');
    format!("{}.json", clean)
}

/// Decimal money string to minor units: "19.9" → 1990.
pub fn parse_minor_units(amount: &str) -> Option<i64> {
    let amount = amount.trim();
    let (negative, digits) = match amount.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, amount.strip_prefix('+').unwrap_or(amount)),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && frac.is_empty()) || frac.len() > 2 || !all_digits(whole) || !all_digits(frac) {
        return None;
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let cents: i64 = format!("{:0<2}", frac).parse().ok()?;
    let minor = whole.checked_mul(100)?.checked_add(cents)?;
    Some(if negative { -minor } else { minor })
}

fn price_of(raw: Option<&String>) -> std::result::Result<Option<i64>, String> {
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_minor_units(s)
            .map(Some)
            .ok_or_else(|| format!("invalid price {:?}", s)),
    }
}

pub fn map_product(p: ShopifyProduct) -> std::result::Result<Product, String> {
    let first = p.variants.first();
    let price = price_of(first.and_then(|v| v.price.as_ref()))?.unwrap_or_default();
    let compare_at = price_of(first.and_then(|v| v.compare_at_price.as_ref()))?.unwrap_or_default();

    let (price, price_discounted) = if compare_at > price {
        (compare_at, price)
    } else {
        (price, 0)
    };

    let reported: Vec<i64> = p.variants.iter().filter_map(|v| v.inventory_quantity).collect();
    let quantity = if reported.is_empty() {
        1
    } else {
        reported.iter().sum()
    };

    let mut tags: Vec<String> = p
        .tags
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if let Some(kind) = p.product_type.filter(|k| !k.trim().is_empty()) {
        if !tags.contains(&kind) {
            tags.push(kind);
        }
    }

    Ok(Product {
        name: p.title,
        price,
        price_discounted,
        description: p.body_html.unwrap_or_default(),
        images_url: p.images.into_iter().map(|i| i.src).collect(),
        tags,
        status: ProductStatus::from_quantity(quantity),
    })
}
