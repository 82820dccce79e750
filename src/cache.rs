use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Page memo stored next to the catalog, keyed by a hash of the URL.
pub struct PageCache {
    conn: Mutex<Connection>,
    ttl: Duration,
}

pub fn cache_key(url: &str) -> String {
    format!("url:{}", blake3::hash(url.as_bytes()).to_hex())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl PageCache {
    pub fn open(path: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
        let conn = crate::db::connect(path)?;
        Self::with_connection(conn, ttl)
    }

    pub fn open_in_memory(ttl: Duration) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, ttl)
    }

    fn with_connection(conn: Connection, ttl: Duration) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS page_cache (
                key        TEXT PRIMARY KEY,
                url        TEXT NOT NULL,
                body       TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_page_cache_expiry ON page_cache(expires_at);
            ",
        )?;
        Ok(PageCache {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("page cache lock poisoned"))
    }

    pub fn get(&self, url: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let body = conn
            .query_row(
                "SELECT body FROM page_cache WHERE key = ?1 AND expires_at > ?2",
                rusqlite::params![cache_key(url), unix_now()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(body)
    }

    pub fn put(&self, url: &str, body: &str) -> Result<()> {
        self.put_with_ttl(url, body, self.ttl)
    }

    fn put_with_ttl(&self, url: &str, body: &str, ttl: Duration) -> Result<()> {
        let expires_at = unix_now() + ttl.as_secs() as i64;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO page_cache (key, url, body, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![cache_key(url), url, body, expires_at],
        )?;
        Ok(())
    }

    /// Drops expired rows, returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM page_cache WHERE expires_at <= ?1",
            rusqlite::params![unix_now()],
        )?;
        Ok(n)
    }
}

// ── Background writes ──

enum CacheJob {
    Put { url: String, body: String },
    Flush(oneshot::Sender<()>),
}

/// Bounded queue in front of a single cache-writing task.
/// When the queue is full the write is dropped, the fetch path never waits.
#[derive(Clone)]
pub struct CacheWriter {
    tx: mpsc::Sender<CacheJob>,
}

impl CacheWriter {
    /// Must be called inside a tokio runtime. The worker exits once every
    /// clone of the writer has been dropped.
    pub fn spawn(cache: Arc<PageCache>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<CacheJob>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    CacheJob::Put { url, body } => {
                        let cache = Arc::clone(&cache);
                        let written = tokio::task::spawn_blocking(move || {
                            cache.put(&url, &body).map(|()| url)
                        })
                        .await;
                        match written {
                            Ok(Ok(url)) => debug!(url, "Cached"),
                            Ok(Err(e)) => warn!(error = %e, "Cache write failed"),
                            Err(e) => warn!(error = %e, "Cache write task failed"),
                        }
                    }
                    CacheJob::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        CacheWriter { tx }
    }

    pub fn enqueue(&self, url: &str, body: &str) {
        let job = CacheJob::Put {
            url: url.to_string(),
            body: body.to_string(),
        };
        if self.tx.try_send(job).is_err() {
            debug!(url, "Cache queue full, skipping write");
        }
    }

    /// Waits until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(CacheJob::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}
