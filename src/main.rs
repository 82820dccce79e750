use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use storefront_crawler::cache::{CacheWriter, PageCache};
use storefront_crawler::config::Settings;
use storefront_crawler::db::SqliteProductStore;
use storefront_crawler::events::{CrawlEvent, EventKind};
use storefront_crawler::fetcher::{CachingFetcher, Fetcher, HttpFetcher};
use storefront_crawler::http::{self, AppState};
use storefront_crawler::platform::ExtractOptions;
use storefront_crawler::{BroadcastHub, CrawlOrchestrator};

#[derive(Parser)]
#[command(name = "storefront_crawler", about = "Storefront product crawler")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
    /// SQLite database path (overrides CRAWLER_DB_PATH)
    #[arg(long, global = true)]
    db: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and event stream
    Serve {
        /// Listen address (overrides CRAWLER_LISTEN_ADDR)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Crawl one storefront and save its products
    Crawl {
        /// Domain name (e.g. shop.example.com) or full URL
        domain: String,
        /// Print raw event-stream frames instead of a progress bar
        #[arg(long)]
        events: bool,
    },
    /// List stored products of a domain
    Products {
        domain: String,
        #[arg(short, long, default_value = "1")]
        page: i64,
        #[arg(short = 'n', long, default_value = "10")]
        page_size: i64,
    },
    /// Show storage statistics
    Stats,
}

struct Services {
    hub: Arc<BroadcastHub>,
    crawler: Arc<CrawlOrchestrator>,
    cache_writer: Option<CacheWriter>,
}

impl Services {
    fn build(settings: &Settings) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteProductStore::open(&settings.db_path)?);
        let hub = Arc::new(BroadcastHub::new(settings.subscriber_capacity));

        let http = HttpFetcher::new(&settings.user_agent, settings.request_timeout())
            .context("Failed to build HTTP client")?;
        let (fetcher, cache_writer) = if settings.cache_enabled {
            let cache = Arc::new(
                PageCache::open(&settings.db_path, settings.cache_ttl())
                    .context("Failed to open page cache")?,
            );
            let writer = CacheWriter::spawn(Arc::clone(&cache), settings.cache_queue);
            let fetcher: Arc<dyn Fetcher> = Arc::new(CachingFetcher::new(http, cache, writer.clone()));
            (fetcher, Some(writer))
        } else {
            let fetcher: Arc<dyn Fetcher> = Arc::new(http);
            (fetcher, None)
        };

        let opts = ExtractOptions {
            locale: settings.locale.clone(),
        };
        let crawler = Arc::new(CrawlOrchestrator::new(
            fetcher,
            store,
            Arc::clone(&hub),
            opts,
        ));
        Ok(Services {
            hub,
            crawler,
            cache_writer,
        })
    }

    async fn flush_cache(&self) {
        if let Some(writer) = &self.cache_writer {
            writer.flush().await;
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let t0 = Instant::now();
    let mut settings = Settings::load()?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }

    let result = match cli.command {
        Commands::Serve { listen } => {
            let addr = listen.unwrap_or_else(|| settings.listen_addr.clone());
            let services = Services::build(&settings)?;
            let state = AppState {
                crawler: Arc::clone(&services.crawler),
                hub: Arc::clone(&services.hub),
                heartbeat: settings.heartbeat(),
            };
            let served = http::serve(state, &addr).await;
            services.flush_cache().await;
            served
        }
        Commands::Crawl { domain, events } => {
            let url = storefront_url(&domain)?;
            let services = Services::build(&settings)?;
            let saved = crawl_with_progress(&services, &url, events).await;
            services.flush_cache().await;
            let saved = saved?;
            println!("Saved {} products from {}", saved, url);
            Ok(())
        }
        Commands::Products {
            domain,
            page,
            page_size,
        } => {
            let services = Services::build(&settings)?;
            let listing = services
                .crawler
                .list_products(&domain, page, page_size)
                .await?;
            if listing.items.is_empty() {
                println!("No products stored for {}.", domain);
                return Ok(());
            }

            println!(
                "{:>4} | {:<36} | {:>10} | {:>10} | {:<10} | {:>3}",
                "#", "Product", "Price", "Sale", "Status", "Img"
            );
            println!("{}", "-".repeat(88));
            let offset = (listing.page - 1) * listing.page_size;
            for (i, p) in listing.items.iter().enumerate() {
                let sale = if p.price_discounted > 0 {
                    format_price(p.price_discounted)
                } else {
                    "-".into()
                };
                println!(
                    "{:>4} | {:<36} | {:>10} | {:>10} | {:<10} | {:>3}",
                    offset + i + 1,
                    truncate(&p.name, 36),
                    format_price(p.price),
                    sale,
                    p.status.as_str(),
                    p.images_url.len()
                );
            }
            println!(
                "\nPage {}/{} | {} products",
                listing.page, listing.total_pages, listing.total_items
            );
            Ok(())
        }
        Commands::Stats => {
            let store = SqliteProductStore::open(&settings.db_path)?;
            let s = store.stats()?;
            println!("Products:     {}", s.products);
            println!("Domains:      {}", s.domains);
            println!("Out of stock: {}", s.out_of_stock);
            if settings.cache_enabled {
                let cache = PageCache::open(&settings.db_path, settings.cache_ttl())?;
                println!("Cache purged: {}", cache.purge_expired()?);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Accepts a bare domain or a full http(s) URL.
fn storefront_url(input: &str) -> anyhow::Result<String> {
    let input = input.trim().trim_end_matches('/');
    if input.starts_with("http://") || input.starts_with("https://") {
        return Ok(input.to_string());
    }
    http::validate_domain(input).map_err(|reason| anyhow::anyhow!("{}: {}", reason, input))?;
    Ok(format!("https://{}", input))
}

const CLI_CLIENT_ID: &str = "cli";

/// Run a crawl while rendering hub events, as a progress bar or as raw frames.
async fn crawl_with_progress(services: &Services, url: &str, raw: bool) -> anyhow::Result<usize> {
    let (tx, rx) = mpsc::channel(64);
    services.hub.subscribe(CLI_CLIENT_ID, tx);
    let renderer = if raw {
        tokio::spawn(print_frames(rx))
    } else {
        tokio::spawn(render_progress(rx))
    };

    let result = services.crawler.crawl(url).await;

    // Dropping the registry's sender ends the renderer.
    services.hub.unsubscribe(CLI_CLIENT_ID);
    let _ = renderer.await;

    let saved = result?;
    let domain = storefront_crawler::crawl::store_domain(url);
    let stored = services.crawler.list_products(&domain, 1, 1).await?.total_items;
    tracing::info!("Crawl finished: {} saved, {} stored for {}", saved, stored, domain);
    Ok(saved)
}

async fn print_frames(mut rx: mpsc::Receiver<CrawlEvent>) {
    while let Some(event) = rx.recv().await {
        print!("{}", event.to_sse_frame());
    }
}

async fn render_progress(mut rx: mpsc::Receiver<CrawlEvent>) {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    let count = |e: &CrawlEvent, key: &str| e.get(key).and_then(|v| v.as_u64()).unwrap_or(0);

    while let Some(event) = rx.recv().await {
        match event.kind {
            EventKind::CrawlStarted => pb.set_message("Detecting provider..."),
            EventKind::ProviderIdentified => {
                let provider = event
                    .get("provider")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                pb.set_message(format!("Provider: {}, extracting products...", provider));
            }
            EventKind::ProductsFetched => {
                pb.set_length(count(&event, "products_count"));
                if let Ok(style) = ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                {
                    pb.set_style(style.progress_chars("#>-"));
                }
                pb.set_message("saving");
            }
            EventKind::SaveProgress => pb.set_position(count(&event, "saved_count")),
            EventKind::CrawlCompleted | EventKind::CrawlError => {
                pb.finish_and_clear();
                break;
            }
            EventKind::Connection | EventKind::Heartbeat => {}
        }
    }
}

fn format_price(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
