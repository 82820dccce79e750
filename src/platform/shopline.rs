use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use tracing::{error, info};

use super::sitemap;
use crate::error::{CrawlError, Result};
use crate::fetcher::Fetcher;
use crate::product::{Product, ProductStatus};

/// Product JSON embedded by the storefront theme, with escaped quotes.
static PRODUCT_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"app\.value\('product', JSON\.parse\('(\{\\"_id\\".+\})"#).unwrap()
});

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct ProductRef {
    #[serde(rename = "_id")]
    pub product_id: String,
    #[serde(rename = "owner_id")]
    pub merchant_id: String,
}

// ── Backend API schema ──

#[derive(Debug, Deserialize)]
pub struct ProductResponse {
    pub data: ShoplineProduct,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ShoplineProduct {
    #[serde(rename = "_id")]
    pub id: String,
    pub title_translations: HashMap<String, String>,
    pub description_translations: HashMap<String, String>,
    pub media: Vec<MediaItem>,
    pub category_ids: Vec<String>,
    pub price: Option<Price>,
    pub price_sale: Option<Price>,
    pub quantity: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MediaItem {
    pub images: ImageSet,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ImageSet {
    pub original: Option<ImageDetails>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ImageDetails {
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Price {
    pub cents: i64,
}

// ── Extraction ──

pub struct ShoplineExtractor {
    fetcher: Arc<dyn Fetcher>,
    locale: String,
}

impl ShoplineExtractor {
    pub fn new(fetcher: Arc<dyn Fetcher>, locale: String) -> Self {
        ShoplineExtractor { fetcher, locale }
    }

    pub async fn extract(&self, storefront_url: &str) -> Result<Vec<Product>> {
        let urls = sitemap::discover_products(self.fetcher.as_ref(), storefront_url, None).await?;

        let mut products = Vec::with_capacity(urls.len());
        for url in &urls {
            info!("Processing product url: {}", url);
            let product = self.fetch_product(url).await.map_err(|e| {
                error!("Error processing product {}: {}", url, e);
                e
            })?;
            products.push(product);
        }
        Ok(products)
    }

    async fn fetch_product(&self, product_url: &str) -> Result<Product> {
        let html = self.fetcher.fetch(product_url).await?;
        let ids = parse_product_ref(&html)
            .map_err(|e| CrawlError::extraction(format!("{}: {}", product_url, e)))?;

        let host = authority(product_url)?;
        let api_url = api_url(&host, &ids);
        info!("Fetching product data: {}", api_url);
        let body = self.fetcher.fetch(&api_url).await?;
        let response: ProductResponse = serde_json::from_str(&body).map_err(|e| {
            CrawlError::extraction(format!("{}: error parsing product JSON: {}", api_url, e))
        })?;

        Ok(map_product(response.data, &self.locale))
    }
}

/// Replace `\"` with `"` until none are left.
pub fn unescape_quotes(raw: &str) -> String {
    let mut s = raw.to_string();
    while s.contains("\\\"") {
        s = s.replace("\\\"", "\"");
    }
    s
}

/// Locate the embedded product literal and read its product/merchant ids.
pub fn parse_product_ref(html: &str) -> Result<ProductRef> {
    let raw = PRODUCT_JSON_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .ok_or_else(|| CrawlError::extraction("product data not found in HTML body"))?;

    let json = unescape_quotes(raw.as_str());
    // The capture runs to the last brace on the line; only the first object matters.
    serde_json::Deserializer::from_str(&json)
        .into_iter::<ProductRef>()
        .next()
        .ok_or_else(|| CrawlError::extraction("empty product JSON"))?
        .map_err(|e| CrawlError::extraction(format!("error parsing JSON: {}", e)))
}

fn authority(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url)
        .map_err(|e| CrawlError::extraction(format!("failed to parse URL {}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| CrawlError::extraction(format!("URL has no host: {}", url)))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn api_url(host: &str, ids: &ProductRef) -> String {
    format!(
        "https://{}/api/merchants/{}/products/{}",
        host, ids.merchant_id, ids.product_id
    )
}

pub fn map_product(data: ShoplineProduct, locale: &str) -> Product {
    let translated = |m: &HashMap<String, String>| m.get(locale).cloned().unwrap_or_default();

    Product {
        name: translated(&data.title_translations),
        price: data.price.map(|p| p.cents).unwrap_or_default(),
        price_discounted: data.price_sale.map(|p| p.cents).unwrap_or_default(),
        description: translated(&data.description_translations),
        images_url: data
            .media
            .into_iter()
            .filter_map(|m| m.images.original.map(|o| o.url))
            .collect(),
        tags: data.category_ids,
        status: ProductStatus::from_quantity(data.quantity as i64),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fetcher::testing::StaticFetcher;

    pub fn product_page(product_id: &str, merchant_id: &str) -> String {
        format!(
            r#"<html><script>app.value('product', JSON.parse('{{\"_id\":\"{}\",\"owner_id\":\"{}\",\"title\":\"x\"}}'));</script></html>"#,
            product_id, merchant_id
        )
    }

    pub fn api_body(title: &str, cents: i64, sale: i64, quantity: i64) -> String {
        serde_json::json!({
            "data": {
                "_id": "p",
                "title_translations": { "zh-hant": title, "en": "english" },
                "description_translations": { "zh-hant": format!("{} desc", title) },
                "media": [
                    { "images": { "original": { "url": format!("https://img.test/{}-1.jpg", title), "width": 800.0 } } },
                    { "images": { "original": { "url": format!("https://img.test/{}-2.jpg", title) } } }
                ],
                "category_ids": ["c1", "c2"],
                "price": { "cents": cents, "currency_iso": "TWD" },
                "price_sale": { "cents": sale },
                "quantity": quantity,
                "variations": []
            }
        })
        .to_string()
    }

    #[test]
    fn reads_ids_from_embedded_json() {
        let ids = parse_product_ref(&product_page("p1", "m1")).unwrap();
        assert_eq!(
            ids,
            ProductRef {
                product_id: "p1".into(),
                merchant_id: "m1".into()
            }
        );
    }

    #[test]
    fn ignores_trailing_content_after_object() {
        let html = r#"app.value('product', JSON.parse('{\"_id\":\"p9\",\"owner_id\":\"m9\"}')); var cfg = {a: 1}"#;
        let ids = parse_product_ref(html).unwrap();
        assert_eq!(ids.product_id, "p9");
        assert_eq!(ids.merchant_id, "m9");
    }

    #[test]
    fn unescape_is_idempotent() {
        let once = unescape_quotes(r#"{\\\"_id\\\":\"a\"}"#);
        assert_eq!(once, r#"{"_id":"a"}"#);
        assert_eq!(unescape_quotes(&once), once);
    }

    #[test]
    fn missing_marker_or_bad_json_fails() {
        assert!(parse_product_ref("<html></html>").unwrap_err().is_extraction());
        let broken = r#"app.value('product', JSON.parse('{\"_id\":}'));"#;
        assert!(parse_product_ref(broken).unwrap_err().is_extraction());
    }

    #[test]
    fn maps_locale_prices_media_and_status() {
        let resp: ProductResponse = serde_json::from_str(&api_body("Mug", 1200, 990, 0)).unwrap();
        let p = map_product(resp.data, "zh-hant");
        assert_eq!(p.name, "Mug");
        assert_eq!(p.description, "Mug desc");
        assert_eq!(p.price, 1200);
        assert_eq!(p.price_discounted, 990);
        assert_eq!(p.images_url, vec!["https://img.test/Mug-1.jpg", "https://img.test/Mug-2.jpg"]);
        assert_eq!(p.tags, vec!["c1", "c2"]);
        assert_eq!(p.status, ProductStatus::OutOfStock);

        let resp: ProductResponse = serde_json::from_str(&api_body("Mug", 1200, 0, 5)).unwrap();
        assert_eq!(map_product(resp.data, "zh-hant").status, ProductStatus::Active);
    }

    #[test]
    fn null_sale_price_maps_to_zero() {
        let resp: ProductResponse =
            serde_json::from_str(r#"{"data":{"price":{"cents":500},"price_sale":null,"quantity":2}}"#)
                .unwrap();
        let p = map_product(resp.data, "zh-hant");
        assert_eq!(p.price_discounted, 0);
        assert_eq!(p.name, "");
    }

    #[test]
    fn authority_keeps_port() {
        assert_eq!(authority("https://shop.example/products/a").unwrap(), "shop.example");
        assert_eq!(authority("http://127.0.0.1:8081/products/a").unwrap(), "127.0.0.1:8081");
    }

    fn storefront(urls: &[&str]) -> StaticFetcher {
        let locs: String = urls
            .iter()
            .map(|u| format!("<url><loc>{}</loc></url>", u))
            .collect();
        StaticFetcher::new().page(
            "https://shop.example/sitemap.xml",
            format!("<urlset>{}</urlset>", locs),
        )
    }

    #[tokio::test]
    async fn extracts_in_sitemap_order() {
        let fetcher = storefront(&[
            "https://shop.example/products/b",
            "https://shop.example/about",
            "https://shop.example/products/a",
        ])
        .page("https://shop.example/products/b", product_page("pb", "m"))
        .page("https://shop.example/products/a", product_page("pa", "m"))
        .page("https://shop.example/api/merchants/m/products/pb", api_body("B", 100, 0, 1))
        .page("https://shop.example/api/merchants/m/products/pa", api_body("A", 200, 0, 1));

        let x = ShoplineExtractor::new(Arc::new(fetcher), "zh-hant".into());
        let products = x.extract("https://shop.example").await.unwrap();
        let names: Vec<_> = products.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[tokio::test]
    async fn one_bad_candidate_aborts_the_batch() {
        let fetcher = storefront(&[
            "https://shop.example/products/ok",
            "https://shop.example/products/broken",
        ])
        .page("https://shop.example/products/ok", product_page("p1", "m"))
        .page("https://shop.example/products/broken", "<html>no data</html>")
        .page("https://shop.example/api/merchants/m/products/p1", api_body("Ok", 100, 0, 1));

        let x = ShoplineExtractor::new(Arc::new(fetcher), "zh-hant".into());
        let err = x.extract("https://shop.example").await.unwrap_err();
        assert!(matches!(err, CrawlError::ExtractionFailed(_)));
    }
}
