use crate::headers::Headers;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// SMTP credentials for an authenticated relay hop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

/// Per-delivery DNS behaviour, folded from the zone defaults when the
/// broker did not set them explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsOptions {
    pub prefer_ipv6: bool,
    pub ignore_ipv6: bool,
    pub block_local_addresses: bool,
    /// Hostnames and literal addresses that must never be contacted.
    pub block_domains: Vec<String>,
}

/// A pre-resolved exchange provided by the broker, overriding DNS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MxOverride {
    pub exchange: String,
    #[serde(default)]
    pub priority: u16,
}

/// One DKIM signing descriptor. Keys are signed in reverse configuration
/// order so the last configured signature ends up outermost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DkimKeySpec {
    pub domain: String,
    pub selector: String,
    /// PEM-encoded RSA private key. Absent when the key should be taken
    /// from the engine's key directory by `<domain>.<selector>`.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub hash_algo: Option<String>,
    /// Pre-computed relaxed body hash (base64). Computed from the stored
    /// body when absent.
    #[serde(default)]
    pub body_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DkimRequest {
    #[serde(default)]
    pub keys: Vec<DkimKeySpec>,
}

/// Defer bookkeeping maintained across attempts by the broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Deferred {
    pub count: u32,
    pub last: Option<DateTime<Utc>>,
    pub next: Option<DateTime<Utc>>,
    /// Set once the delayed-delivery notification has been emitted.
    pub notified: bool,
}

/// State accumulated while driving a single attempt. Never serialized back
/// to the broker wholesale; relevant pieces travel in RELEASE/DEFER fields.
#[derive(Debug, Clone, Default)]
pub struct AttemptState {
    pub zone_address_v4: Option<SourceAddress>,
    pub zone_address_v6: Option<SourceAddress>,
    pub local_address: Option<IpAddr>,
    pub local_hostname: Option<String>,
    pub local_port: Option<u16>,
    pub mx_hostname: Option<String>,
    pub connection_key: Option<String>,
    pub status: Option<String>,
    pub sent_body_hash: Option<String>,
    pub sent_body_size: Option<u64>,
    pub md5_match: Option<bool>,
    pub pool_disabled: bool,
    pub skip_bounce: bool,
    pub tls_used: bool,
    pub auth_used: bool,
}

/// A selected source address plus the EHLO name configured for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAddress {
    pub address: IpAddr,
    pub ehlo_name: String,
}

/// A unit of work for one `(message-id, sequence, recipient)` triple,
/// leased from the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: String,
    pub seq: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub from: String,
    pub recipient: String,
    pub domain: String,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub body_size: u64,
    #[serde(default)]
    pub source_md5: Option<String>,
    #[serde(default)]
    pub dns_options: Option<DnsOptions>,
    #[serde(default)]
    pub mx: Option<Vec<MxOverride>>,
    #[serde(default)]
    pub mx_port: Option<u16>,
    #[serde(default)]
    pub mx_auth: Option<Credentials>,
    #[serde(default, rename = "useLMTP")]
    pub use_lmtp: bool,
    #[serde(default)]
    pub mx_secure: bool,
    #[serde(default)]
    pub disabled_addresses: Vec<IpAddr>,
    #[serde(default)]
    pub dkim: Option<DkimRequest>,
    /// Per-message defer schedule override, milliseconds per slot.
    #[serde(default)]
    pub defer_times: Option<Vec<u64>>,
    #[serde(default, rename = "_deferred")]
    pub deferred: Option<Deferred>,
    #[serde(rename = "_lock")]
    pub lock: String,
    #[serde(default)]
    pub http: bool,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub state: AttemptState,
}

impl Delivery {
    /// Parse the raw header lines carried on the wire. Called lazily by the
    /// worker, once per attempt.
    pub fn parse_headers(&self) -> Headers {
        Headers::parse_lines(&self.headers)
    }

    pub fn deferred_count(&self) -> u32 {
        self.deferred.as_ref().map(|d| d.count).unwrap_or(0)
    }

    /// Debug identity used in log fields.
    pub fn queue_id(&self) -> String {
        format!("{}.{}", self.id, self.seq)
    }

    pub fn envelope_from_empty(&self) -> bool {
        self.from.trim().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_wire_payload_parses() {
        let raw = serde_json::json!({
            "id": "1a2b3c",
            "seq": "002",
            "from": "sender@example.com",
            "recipient": "rcpt@example.org",
            "domain": "example.org",
            "headers": ["From: sender@example.com", "Subject: hi"],
            "bodySize": 512,
            "_lock": "lock-token-1",
        });
        let delivery: Delivery = serde_json::from_value(raw).unwrap();
        assert_eq!(delivery.queue_id(), "1a2b3c.002");
        assert_eq!(delivery.deferred_count(), 0);
        assert!(!delivery.use_lmtp);
        let headers = delivery.parse_headers();
        assert_eq!(headers.get_first("subject").unwrap(), "hi");
    }

    #[test]
    fn dns_options_carry_block_domains() {
        let raw = serde_json::json!({
            "id": "x",
            "seq": "001",
            "recipient": "a@b.c",
            "domain": "b.c",
            "_lock": "l",
            "dnsOptions": {"ignoreIPv6": true, "blockDomains": ["evil.example.org", "192.0.2.66"]},
        });
        let delivery: Delivery = serde_json::from_value(raw).unwrap();
        let options = delivery.dns_options.unwrap();
        assert!(options.ignore_ipv6);
        assert_eq!(options.block_domains, ["evil.example.org", "192.0.2.66"]);
    }

    #[test]
    fn deferred_state_round_trips() {
        let raw = serde_json::json!({
            "id": "x",
            "seq": "001",
            "recipient": "a@b.c",
            "domain": "b.c",
            "_lock": "l",
            "_deferred": {"count": 3},
            "useLMTP": true,
        });
        let delivery: Delivery = serde_json::from_value(raw).unwrap();
        assert_eq!(delivery.deferred_count(), 3);
        assert!(delivery.use_lmtp);
        assert!(delivery.envelope_from_empty());
    }
}
