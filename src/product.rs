use serde::{Deserialize, Serialize};

/// Canonical catalog record produced by every platform extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    /// Minor currency units.
    pub price: i64,
    /// Minor currency units, 0 when there is no sale price.
    pub price_discounted: i64,
    pub description: String,
    pub images_url: Vec<String>,
    pub tags: Vec<String>,
    pub status: ProductStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "outOfStock")]
    OutOfStock,
}

impl ProductStatus {
    pub fn from_quantity(quantity: i64) -> Self {
        if quantity < 1 {
            ProductStatus::OutOfStock
        } else {
            ProductStatus::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Active => "active",
            ProductStatus::OutOfStock => "outOfStock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ProductStatus::Active),
            "outOfStock" => Some(ProductStatus::OutOfStock),
            _ => None,
        }
    }
}

/// One page of a stored catalog.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_items: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: usize, page_size: usize, total_items: usize) -> Self {
        Page {
            items,
            page,
            page_size,
            total_items,
            total_pages: total_pages(total_items, page_size),
        }
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }
}

pub fn total_pages(total_items: usize, page_size: usize) -> usize {
    if page_size == 0 {
        return 0;
    }
    total_items.div_ceil(page_size)
}
