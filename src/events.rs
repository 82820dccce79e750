use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kinds of progress events pushed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CrawlStarted,
    ProviderIdentified,
    ProductsFetched,
    SaveProgress,
    CrawlCompleted,
    CrawlError,
    Connection,
    Heartbeat,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CrawlStarted => "crawl_started",
            EventKind::ProviderIdentified => "provider_identified",
            EventKind::ProductsFetched => "products_fetched",
            EventKind::SaveProgress => "save_progress",
            EventKind::CrawlCompleted => "crawl_completed",
            EventKind::CrawlError => "crawl_error",
            EventKind::Connection => "connection",
            EventKind::Heartbeat => "heartbeat",
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self {
            EventKind::CrawlStarted => "crawl-start",
            EventKind::ProviderIdentified => "provider-found",
            EventKind::ProductsFetched => "products-fetched",
            EventKind::SaveProgress => "save-progress",
            EventKind::CrawlCompleted => "crawl-completed",
            EventKind::CrawlError => "crawl-error",
            EventKind::Connection => "welcome",
            EventKind::Heartbeat => "heartbeat",
        }
    }
}

/// A single progress notification. Ids are time-derived and may collide
/// when two events of the same kind share a millisecond.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlEvent {
    pub id: String,
    pub kind: EventKind,
    pub data: Map<String, Value>,
}

impl CrawlEvent {
    pub fn new(kind: EventKind) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        CrawlEvent {
            id: format!("{}-{}", kind.id_prefix(), millis),
            kind,
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Adds an RFC 3339 `timestamp` unless the payload already has one.
    pub fn stamp(&mut self) {
        self.data
            .entry("timestamp")
            .or_insert_with(|| Value::String(now_rfc3339()));
    }

    /// Server-sent-events framing: `id:`, `event:`, one `data:` line, blank line.
    pub fn to_sse_frame(&self) -> String {
        let data = Value::Object(self.data.clone()).to_string();
        let mut frame = String::with_capacity(data.len() + 64);
        if !self.id.is_empty() {
            frame.push_str(&format!("id: {}\n", self.id));
        }
        frame.push_str(&format!("event: {}\n", self.kind.as_str()));
        frame.push_str(&format!("data: {}\n\n", data));
        frame
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_keeps_existing_timestamp() {
        let mut e = CrawlEvent::new(EventKind::Heartbeat).with("timestamp", "fixed");
        e.stamp();
        assert_eq!(e.get("timestamp").and_then(|v| v.as_str()), Some("fixed"));

        let mut e = CrawlEvent::new(EventKind::Heartbeat);
        e.stamp();
        assert!(e.get("timestamp").is_some());
    }

    #[test]
    fn sse_frame_layout() {
        let mut e = CrawlEvent::new(EventKind::ProductsFetched).with("products_count", 3);
        e.id = "products-fetched-1".into();
        assert_eq!(
            e.to_sse_frame(),
            "id: products-fetched-1\nevent: products_fetched\ndata: {\"products_count\":3}\n\n"
        );
    }

    #[test]
    fn ids_carry_kind_prefix() {
        let e = CrawlEvent::new(EventKind::CrawlStarted);
        assert!(e.id.starts_with("crawl-start-"));
        assert_eq!(EventKind::SaveProgress.as_str(), "save_progress");
    }
}
