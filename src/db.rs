use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{CrawlError, Result};
use crate::product::{Product, ProductStatus};

pub fn connect(path: impl AsRef<Path>) -> anyhow::Result<Connection> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS products (
            id               INTEGER PRIMARY KEY,
            domain           TEXT NOT NULL,
            name             TEXT NOT NULL,
            price            INTEGER NOT NULL,
            price_discounted INTEGER NOT NULL DEFAULT 0,
            description      TEXT NOT NULL DEFAULT '',
            images_url       TEXT NOT NULL DEFAULT '[]',
            tags             TEXT NOT NULL DEFAULT '[]',
            status           TEXT NOT NULL CHECK(status IN ('active','outOfStock')),
            created_at       TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at       TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(domain, name)
        );
        CREATE INDEX IF NOT EXISTS idx_products_domain ON products(domain);
        ",
    )?;
    Ok(())
}

/// Catalog persistence, keyed by (domain, product name).
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn upsert_product(&self, domain: &str, product: &Product) -> Result<()>;

    /// `page` is 1-based.
    async fn get_products(&self, domain: &str, page: usize, page_size: usize) -> Result<Vec<Product>>;

    async fn get_total_products(&self, domain: &str) -> Result<usize>;
}

/// SQLite-backed store. Statements run on the blocking pool.
pub struct SqliteProductStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProductStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = connect(path)?;
        init_schema(&conn)?;
        Ok(SqliteProductStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(SqliteProductStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&*lock(&conn)?))
            .await
            .map_err(|e| CrawlError::Persistence(format!("store task failed: {}", e)))?
    }

    pub fn stats(&self) -> Result<Stats> {
        let conn = lock(&self.conn)?;
        let products: usize = conn.query_row("SELECT COUNT(*) FROM products", [], |r| r.get(0))?;
        let domains: usize =
            conn.query_row("SELECT COUNT(DISTINCT domain) FROM products", [], |r| r.get(0))?;
        let out_of_stock: usize = conn.query_row(
            "SELECT COUNT(*) FROM products WHERE status = 'outOfStock'",
            [],
            |r| r.get(0),
        )?;
        Ok(Stats {
            products,
            domains,
            out_of_stock,
        })
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| CrawlError::Persistence("product store lock poisoned".into()))
}

fn encode_list(list: &[String]) -> Result<String> {
    serde_json::to_string(list).map_err(|e| CrawlError::Persistence(e.to_string()))
}

fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[async_trait]
impl ProductStore for SqliteProductStore {
    async fn upsert_product(&self, domain: &str, product: &Product) -> Result<()> {
        let images = encode_list(&product.images_url)?;
        let tags = encode_list(&product.tags)?;
        let domain = domain.to_string();
        let product = product.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO products
                 (domain, name, price, price_discounted, description, images_url, tags, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(domain, name) DO UPDATE SET
                    price = excluded.price,
                    price_discounted = excluded.price_discounted,
                    description = excluded.description,
                    images_url = excluded.images_url,
                    tags = excluded.tags,
                    status = excluded.status,
                    updated_at = datetime('now')",
                rusqlite::params![
                    domain,
                    product.name,
                    product.price,
                    product.price_discounted,
                    product.description,
                    images,
                    tags,
                    product.status.as_str(),
                ],
            )?;
            debug!(domain = %domain, name = %product.name, "Upserted product");
            Ok(())
        })
        .await
    }

    async fn get_products(&self, domain: &str, page: usize, page_size: usize) -> Result<Vec<Product>> {
        let offset = page.saturating_sub(1) * page_size;
        let domain = domain.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, price, price_discounted, description, images_url, tags, status
                 FROM products
                 WHERE domain = ?1
                 ORDER BY id
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![domain, page_size as i64, offset as i64],
                    |row| {
                        let images: String = row.get(4)?;
                        let tags: String = row.get(5)?;
                        let status: String = row.get(6)?;
                        Ok(Product {
                            name: row.get(0)?,
                            price: row.get(1)?,
                            price_discounted: row.get(2)?,
                            description: row.get(3)?,
                            images_url: decode_list(&images),
                            tags: decode_list(&tags),
                            status: ProductStatus::parse(&status).unwrap_or(ProductStatus::Active),
                        })
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            info!("Loaded {} products for {} (page {}, size {})", rows.len(), domain, page, page_size);
            Ok(rows)
        })
        .await
    }

    async fn get_total_products(&self, domain: &str) -> Result<usize> {
        let domain = domain.to_string();
        self.blocking(move |conn| {
            let total: usize = conn.query_row(
                "SELECT COUNT(*) FROM products WHERE domain = ?1",
                rusqlite::params![domain],
                |r| r.get(0),
            )?;
            Ok(total)
        })
        .await
    }
}

// ── Stats ──

pub struct Stats {
    pub products: usize,
    pub domains: usize,
    pub out_of_stock: usize,
}
