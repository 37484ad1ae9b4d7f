//! Queue broker protocol: newline-delimited JSON request/response frames
//! over one duplex TCP channel, correlated by a monotonically increasing
//! `req` id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod cache;
pub mod client;

pub use cache::BrokerCache;
pub use client::BrokerClient;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", rename_all = "UPPERCASE")]
pub enum Command {
    Hello {
        zone: String,
        id: String,
    },
    Get {
        zone: String,
    },
    Release(ReleaseRequest),
    Defer(DeferRequest),
    Bounce(Box<BounceRequest>),
    Getcache {
        key: String,
    },
    Setcache {
        key: String,
        value: Value,
        /// Entry lifetime in milliseconds.
        ttl: u64,
    },
    Clearcache {
        key: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub id: String,
    pub seq: String,
    pub domain: String,
    pub recipient: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "_lock")]
    pub lock: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferRequest {
    pub id: String,
    pub seq: String,
    #[serde(rename = "_lock")]
    pub lock: String,
    /// Requeue TTL in milliseconds.
    pub ttl: u64,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub category: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub updates: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BounceRequest {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub zone: String,
    pub interface: String,
    pub from: String,
    pub to: String,
    pub seq: String,
    pub headers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mx_hostname: Option<String>,
    pub return_path: String,
    pub category: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrival_date: Option<DateTime<Utc>>,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbl: Option<String>,
    /// Composed DSN content queued as the new envelope body.
    pub message: String,
}

/// A cached connect-failure for one `(zone, destination)` pair, or the
/// all-clear marker written after the first successful connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainCacheEntry {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl DomainCacheEntry {
    pub fn failure(response: &str, category: &str, temporary: bool, code: Option<u16>) -> Self {
        Self {
            error: true,
            response: Some(response.to_string()),
            category: Some(category.to_string()),
            temporary,
            code,
            expires_at: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connect failed: {0}")]
    Connect(std::io::Error),
    #[error("broker channel closed")]
    ChannelClosed,
    #[error("broker frame error: {0}")]
    Frame(String),
    #[error("broker rejected request: {0}")]
    Server(String),
    #[error("unexpected broker payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl BrokerError {
    /// Channel loss and acknowledgement transport errors abort the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::ChannelClosed | BrokerError::Connect(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commands_use_wire_names() {
        let frame = serde_json::to_value(Command::Get {
            zone: "default".into(),
        })
        .unwrap();
        assert_eq!(frame["cmd"], "GET");
        assert_eq!(frame["zone"], "default");

        let frame = serde_json::to_value(Command::Setcache {
            key: "dns:example.com".into(),
            value: serde_json::json!({"a": 1}),
            ttl: 300_000,
        })
        .unwrap();
        assert_eq!(frame["cmd"], "SETCACHE");
        assert_eq!(frame["ttl"], 300_000);
    }

    #[test]
    fn release_serializes_lock_field() {
        let frame = serde_json::to_value(Command::Release(ReleaseRequest {
            id: "m1".into(),
            seq: "001".into(),
            domain: "example.org".into(),
            recipient: "a@example.org".into(),
            status: "delivered".into(),
            address: Some("198.51.100.10".into()),
            lock: "tok".into(),
        }))
        .unwrap();
        assert_eq!(frame["cmd"], "RELEASE");
        assert_eq!(frame["_lock"], "tok");
        assert_eq!(frame["status"], "delivered");
    }

    #[test]
    fn domain_cache_entry_round_trips() {
        let entry = DomainCacheEntry::failure("connect timed out", "network", true, None);
        let raw = serde_json::to_string(&entry).unwrap();
        let back: DomainCacheEntry = serde_json::from_str(&raw).unwrap();
        assert!(back.error);
        assert!(back.temporary);
        assert_eq!(back.response.as_deref(), Some("connect timed out"));
    }
}
