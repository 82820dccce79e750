use quick_xml::events::Event;
use tracing::info;

use crate::error::{CrawlError, Result};
use crate::fetcher::Fetcher;

pub const PRODUCT_PATH_MARKER: &str = "/products/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SitemapKind {
    UrlSet,
    Index,
}

#[derive(Debug)]
pub struct Sitemap {
    pub kind: SitemapKind,
    pub locs: Vec<String>,
}

pub fn sitemap_url(storefront_url: &str) -> String {
    format!("{}/sitemap.xml", storefront_url.trim_end_matches('/'))
}

/// Parse a `<urlset>` or `<sitemapindex>` document and return its `<loc>` values
/// in document order.
pub fn parse_sitemap(xml: &str) -> Result<Sitemap> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut kind = None;
    let mut locs = Vec::new();
    let mut in_entry = false;
    let mut in_loc = false;
    let mut current = String::new();
    let mut buf = Vec::new();

    let decode_err = |e: &dyn std::fmt::Display| {
        CrawlError::extraction(format!("failed to decode sitemap XML: {}", e))
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if kind.is_none() => {
                kind = Some(root_kind(e.local_name().as_ref())?);
            }
            // A self-closing root is a document with no entries.
            Ok(Event::Empty(e)) if kind.is_none() => {
                kind = Some(root_kind(e.local_name().as_ref())?);
            }
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"url" | b"sitemap" => in_entry = true,
                b"loc" if in_entry => {
                    in_loc = true;
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Text(e)) if in_loc => {
                current.push_str(&e.unescape().map_err(|e| decode_err(&e))?);
            }
            Ok(Event::CData(e)) if in_loc => {
                current.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"loc" if in_loc => {
                    in_loc = false;
                    let loc = current.trim();
                    if !loc.is_empty() {
                        locs.push(loc.to_string());
                    }
                }
                b"url" | b"sitemap" => in_entry = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(decode_err(&e)),
            _ => {}
        }
        buf.clear();
    }

    let kind = kind.ok_or_else(|| CrawlError::extraction("sitemap has no root element"))?;
    Ok(Sitemap { kind, locs })
}

fn root_kind(name: &[u8]) -> Result<SitemapKind> {
    match name {
        b"urlset" => Ok(SitemapKind::UrlSet),
        b"sitemapindex" => Ok(SitemapKind::Index),
        other => Err(CrawlError::extraction(format!(
            "expected <urlset> or <sitemapindex>, found <{}>",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Keep only product-page URLs, preserving order.
pub fn product_urls(locs: Vec<String>) -> Vec<String> {
    locs.into_iter()
        .filter(|loc| loc.contains(PRODUCT_PATH_MARKER))
        .collect()
}

async fn fetch_sitemap(fetcher: &dyn Fetcher, url: &str) -> Result<Sitemap> {
    let xml = fetcher
        .fetch(url)
        .await
        .map_err(|e| CrawlError::extraction(format!("failed to fetch sitemap {}: {}", url, e)))?;
    parse_sitemap(&xml)
}

/// Fetch `{storefront}/sitemap.xml` and return product URLs in document order.
///
/// `follow_index` selects which children of a sitemap index are read; when it
/// is `None`, an index is treated as containing no products.
pub async fn discover_products(
    fetcher: &dyn Fetcher,
    storefront_url: &str,
    follow_index: Option<fn(&str) -> bool>,
) -> Result<Vec<String>> {
    let url = sitemap_url(storefront_url);
    info!("Processing products from sitemap: {}", url);
    let root = fetch_sitemap(fetcher, &url).await?;

    let locs = match (root.kind, follow_index) {
        (SitemapKind::UrlSet, _) => root.locs,
        (SitemapKind::Index, None) => Vec::new(),
        (SitemapKind::Index, Some(wanted)) => {
            let mut all = Vec::new();
            for child in root.locs.iter().filter(|loc| wanted(loc)) {
                let sitemap = fetch_sitemap(fetcher, child).await?;
                all.extend(sitemap.locs);
            }
            all
        }
    };

    let total = locs.len();
    let products = product_urls(locs);
    info!("Found {} product URLs out of {} entries", products.len(), total);
    if products.is_empty() {
        return Err(CrawlError::NoProductsFound);
    }
    Ok(products)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::StaticFetcher;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://shop.example/</loc></url>
  <url><loc>https://shop.example/products/b-mug</loc></url>
  <url><loc>https://shop.example/categories/kitchen</loc></url>
  <url><loc>https://shop.example/products/a-cup?x=1&amp;y=2</loc></url>
  <url><loc>https://shop.example/pages/about</loc></url>
  <url><loc><![CDATA[https://shop.example/products/c-bowl]]></loc></url>
</urlset>"#;

    #[test]
    fn keeps_product_locs_in_order() {
        let sitemap = parse_sitemap(URLSET).unwrap();
        assert_eq!(sitemap.kind, SitemapKind::UrlSet);
        assert_eq!(sitemap.locs.len(), 6);

        let products = product_urls(sitemap.locs);
        assert_eq!(
            products,
            vec![
                "https://shop.example/products/b-mug",
                "https://shop.example/products/a-cup?x=1&y=2",
                "https://shop.example/products/c-bowl",
            ]
        );
    }

    #[test]
    fn rejects_non_sitemap_documents() {
        assert!(parse_sitemap("<html><body/></html>").unwrap_err().is_extraction());
        assert!(parse_sitemap("").unwrap_err().is_extraction());
        assert!(parse_sitemap("<urlset><url><loc>x</url></urlset>").is_err());
    }

    #[test]
    fn self_closing_elements() {
        let sitemap =
            parse_sitemap(r#"<?xml version="1.0"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"/>"#)
                .unwrap();
        assert_eq!(sitemap.kind, SitemapKind::UrlSet);
        assert!(sitemap.locs.is_empty());

        let sitemap = parse_sitemap("<sitemapindex/>").unwrap();
        assert_eq!(sitemap.kind, SitemapKind::Index);

        let sitemap = parse_sitemap(
            "<urlset><url><loc/></url><url><loc>https://shop.example/products/a</loc></url></urlset>",
        )
        .unwrap();
        assert_eq!(sitemap.locs, vec!["https://shop.example/products/a"]);
        assert!(parse_sitemap("<feed/>").unwrap_err().is_extraction());
    }

    #[tokio::test]
    async fn empty_self_closing_urlset_is_no_products_found() {
        let fetcher = StaticFetcher::new().page(
            "https://shop.example/sitemap.xml",
            r#"<?xml version="1.0"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"/>"#,
        );
        let err = discover_products(&fetcher, "https://shop.example", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::NoProductsFound));
    }

    #[test]
    fn sitemap_url_joins_cleanly() {
        assert_eq!(sitemap_url("https://shop.example/"), "https://shop.example/sitemap.xml");
        assert_eq!(sitemap_url("https://shop.example"), "https://shop.example/sitemap.xml");
    }

    #[tokio::test]
    async fn zero_products_is_no_products_found() {
        let fetcher = StaticFetcher::new().page(
            "https://shop.example/sitemap.xml",
            "<urlset><url><loc>https://shop.example/about</loc></url></urlset>",
        );
        let err = discover_products(&fetcher, "https://shop.example", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::NoProductsFound));
    }

    #[tokio::test]
    async fn follows_selected_index_children() {
        let fetcher = StaticFetcher::new()
            .page(
                "https://shop.example/sitemap.xml",
                r#"<sitemapindex>
                    <sitemap><loc>https://shop.example/sitemap_pages_1.xml</loc></sitemap>
                    <sitemap><loc>https://shop.example/sitemap_products_1.xml</loc></sitemap>
                </sitemapindex>"#,
            )
            .page(
                "https://shop.example/sitemap_products_1.xml",
                "<urlset><url><loc>https://shop.example/products/tee</loc></url></urlset>",
            );
        let urls = discover_products(
            &fetcher,
            "https://shop.example",
            Some(|loc: &str| loc.contains("sitemap_products")),
        )
        .await
        .unwrap();
        assert_eq!(urls, vec!["https://shop.example/products/tee"]);
        assert!(!fetcher
            .requests()
            .iter()
            .any(|u| u.contains("sitemap_pages")));
    }

    #[tokio::test]
    async fn fetch_failure_is_extraction_failure() {
        let err = discover_products(&StaticFetcher::new(), "https://shop.example", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::ExtractionFailed(_)));
    }
}
