//! HTTP surface: crawl trigger, paged product listing and the live progress
//! stream.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::{
    extract::{Query, Request},
    http::{header, StatusCode},
    middleware::Next,
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Extension, Json, Router,
};
use futures::{future, Stream, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};
use tracing::{error, info};

use crate::crawl::CrawlOrchestrator;
use crate::events::{now_rfc3339, CrawlEvent, EventKind};
use crate::hub::BroadcastHub;
use crate::product::{Page, Product};

const MAX_DOMAIN_LEN: usize = 253;

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([a-zA-Z0-9]{1}[a-zA-Z0-9-]{0,61}[a-zA-Z0-9]{1}|[a-zA-Z0-9]{1,2})(\.[a-zA-Z0-9]{1}[a-zA-Z0-9-]{0,61}[a-zA-Z0-9]{1}|\.[a-zA-Z0-9]{1,2})*$",
    )
    .unwrap()
});

#[derive(Clone)]
pub struct AppState {
    pub crawler: Arc<CrawlOrchestrator>,
    pub hub: Arc<BroadcastHub>,
    pub heartbeat: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/crawl", get(crawl_domain))
        .route("/products", get(list_products))
        .route("/sse", get(sse_stream))
        .route("/sse/status", get(sse_status))
        .layer(Extension(Arc::new(state)))
        .layer(axum::middleware::from_fn(log_requests))
}

pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    info!(%method, path = %path, "HTTP request started");

    let response = next.run(req).await;

    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "HTTP request completed"
    );
    response
}

// ── Responses ──

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
    pub total_items: usize,
    pub total_pages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_page: Option<String>,
}

impl Pagination {
    pub fn for_page<T>(path: &str, domain: &str, page: &Page<T>) -> Self {
        let link = |n: usize| {
            format!(
                "{}?domain_name={}&page={}&page_size={}",
                path, domain, n, page.page_size
            )
        };
        Pagination {
            page: page.page,
            page_size: page.page_size,
            total_items: page.total_items,
            total_pages: page.total_pages,
            next_page: page.has_next().then(|| link(page.page + 1)),
            prev_page: page.has_prev().then(|| link(page.page - 1)),
        }
    }
}

fn respond_success(message: &str, data: Value, pagination: Option<Pagination>) -> Response {
    let mut body = json!({
        "status": "success",
        "message": message,
        "data": data,
    });
    if let Some(p) = pagination {
        body["pagination"] = json!(p);
    }
    (StatusCode::OK, Json(body)).into_response()
}

fn respond_error(status: StatusCode, message: &str, detail: Option<String>) -> Response {
    let body = json!({
        "status": "error",
        "message": message,
        "data": detail,
    });
    (status, Json(body)).into_response()
}

/// Checks a bare host name. Returns the user-facing reason on rejection.
pub fn validate_domain(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("domain_name parameter is required");
    }
    if name.chars().count() > MAX_DOMAIN_LEN {
        return Err("Invalid domain name length");
    }
    if !DOMAIN_RE.is_match(name) {
        return Err("Invalid domain name format");
    }
    Ok(())
}

// ── Handlers ──

#[derive(Debug, Default, Deserialize)]
pub struct CrawlQuery {
    pub domain_name: Option<String>,
}

pub async fn crawl_domain(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<CrawlQuery>,
) -> Response {
    let name = q.domain_name.unwrap_or_default();
    if let Err(reason) = validate_domain(&name) {
        error!(domain_name = %name, reason, "Rejected crawl request");
        return respond_error(StatusCode::BAD_REQUEST, reason, None);
    }

    let domain_url = format!("https://{}", name);
    match state.crawler.crawl(&domain_url).await {
        Ok(count) => {
            info!(domain_name = %name, count, "Successfully crawled domain");
            respond_success(
                "Domain crawled successfully",
                json!({ "productsCount": count }),
                None,
            )
        }
        Err(e) => {
            error!(domain_name = %name, error = %e, "Crawl failed");
            respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                Some(e.to_string()),
            )
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProductsQuery {
    pub domain_name: Option<String>,
    pub page: Option<String>,
    pub page_size: Option<String>,
}

/// Lenient integer read: anything unparsable becomes 0 and is then
/// normalized by the listing.
fn lenient_int(raw: Option<&str>) -> i64 {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(0)
}

pub async fn list_products(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<ProductsQuery>,
) -> Response {
    let domain = q.domain_name.unwrap_or_default();
    if domain.is_empty() {
        return respond_error(StatusCode::BAD_REQUEST, "domain_name parameter is required", None);
    }

    let page = lenient_int(q.page.as_deref());
    let page_size = lenient_int(q.page_size.as_deref());
    let page: Page<Product> = match state.crawler.list_products(&domain, page, page_size).await {
        Ok(page) => page,
        Err(e) => {
            error!(domain = %domain, error = %e, "Failed to get products");
            return respond_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string(), None);
        }
    };

    info!(
        domain = %domain,
        count = page.items.len(),
        page = page.page,
        page_size = page.page_size,
        "Retrieved products"
    );
    let pagination = Pagination::for_page("/products", &domain, &page);
    respond_success(
        "Products retrieved successfully",
        json!(page.items),
        Some(pagination),
    )
}

pub async fn sse_status(Extension(state): Extension<Arc<AppState>>) -> Response {
    respond_success(
        "Event stream status",
        json!({
            "connected_clients": state.hub.connected_count(),
            "timestamp": now_rfc3339(),
            "status": "active",
        }),
        None,
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct SseQuery {
    pub client_id: Option<String>,
}

/// Unsubscribes its client when the response stream is dropped. Only a weak
/// handle is held, so eviction by the hub still closes the channel.
struct Subscription {
    hub: Arc<BroadcastHub>,
    client_id: String,
    tx: mpsc::WeakSender<CrawlEvent>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.upgrade() {
            self.hub.unsubscribe_channel(&self.client_id, &tx);
        }
        info!(client_id = %self.client_id, "Event stream closed");
    }
}

/// Stream that keeps a [`Subscription`] alive for as long as it is polled.
struct SubscribedStream<S> {
    inner: S,
    _subscription: Subscription,
}

impl<S: Stream + Unpin> Stream for SubscribedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

fn generated_client_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("client-{}", nanos)
}

fn heartbeat_event(hub: &BroadcastHub) -> CrawlEvent {
    let mut e = CrawlEvent::new(EventKind::Heartbeat).with("clients", hub.connected_count());
    e.stamp();
    e
}

pub fn to_sse_event(event: &CrawlEvent) -> SseEvent {
    let data = Value::Object(event.data.clone()).to_string();
    SseEvent::default()
        .id(event.id.clone())
        .event(event.kind.as_str())
        .data(data)
}

pub async fn sse_stream(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<SseQuery>,
) -> impl IntoResponse {
    let client_id = q
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(generated_client_id);
    info!(client_id = %client_id, "Event stream connection request");

    let (tx, rx) = state.hub.channel();
    let weak = tx.downgrade();
    state.hub.subscribe(&client_id, tx);
    let subscription = Subscription {
        hub: Arc::clone(&state.hub),
        client_id,
        tx: weak,
    };

    let period = state.heartbeat;
    let hub = Arc::clone(&state.hub);
    let ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let heartbeats = IntervalStream::new(ticks).map(move |_| Some(heartbeat_event(&hub)));

    // `None` marks the end of the hub channel and ends the response, so an
    // evicted client sees the stream close and can reconnect.
    let messages = ReceiverStream::new(rx)
        .map(Some)
        .chain(futures::stream::iter([None]));
    let events = futures::stream::select(messages, heartbeats)
        .take_while(|event| future::ready(event.is_some()))
        .filter_map(future::ready)
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
    let stream = SubscribedStream {
        inner: events,
        _subscription: subscription,
    };

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Sse::new(stream),
    )
}
