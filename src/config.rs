use crate::delivery::{Credentials, Delivery, DnsOptions};
use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("zone {0} has an empty IPv4 pool")]
    EmptyPool(String),
}

/// Engine configuration, deserialized from the JSON file named by
/// `MAILRUSH_CONFIG` (defaults to `mailrush.json`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Instance name, sent to the broker in HELLO and stamped into
    /// Received headers.
    pub name: String,
    pub local_hostname: String,
    /// `host:port` of the queue broker channel.
    pub broker: String,
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
    #[serde(default)]
    pub bounce_rules: Option<PathBuf>,
    #[serde(default)]
    pub dkim: DkimConfig,
    #[serde(default = "default_true")]
    pub mta_sts: bool,
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DkimConfig {
    pub enabled: bool,
    pub key_dir: Option<PathBuf>,
}

/// One sending zone: an independently configured delivery domain.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfig {
    pub name: String,
    /// Parallel workers spawned in this process.
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default)]
    pub throttling: Option<Throttle>,
    #[serde(default)]
    pub pool: Vec<PoolEntry>,
    #[serde(default)]
    pub pool_v6: Vec<PoolEntry>,
    #[serde(default)]
    pub prefer_ipv6: bool,
    #[serde(default)]
    pub ignore_ipv6: bool,
    #[serde(default)]
    pub block_local_addresses: bool,
    #[serde(default)]
    pub block_domains: Vec<String>,
    /// Static relay host overriding MX resolution for every delivery in
    /// this zone.
    #[serde(default)]
    pub smarthost: Option<Smarthost>,
    #[serde(default = "default_true")]
    pub connection_reuse: bool,
    #[serde(default = "default_reuse_count")]
    pub reuse_count: u32,
    #[serde(default = "default_pool_idle", with = "secs")]
    pub pool_idle_timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "secs")]
    pub connect_timeout: Duration,
    #[serde(default = "default_greeting_timeout", with = "secs")]
    pub greeting_timeout: Duration,
    /// Emit a delayed-delivery DSN once a message has been deferred for
    /// longer than this. Off when unset.
    #[serde(default, with = "opt_secs")]
    pub delay_notify_after: Option<Duration>,
    /// Salt mixed into source-address selection so pools of equal size
    /// spread differently across zones.
    #[serde(default)]
    pub salt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Smarthost {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub auth: Option<Credentials>,
    #[serde(default)]
    pub secure: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntry {
    pub address: IpAddr,
    pub hostname: String,
}

/// `N messages per unit` rate bound for a zone.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Throttle {
    pub messages: u32,
    pub unit: ThrottleUnit,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleUnit {
    Second,
    Minute,
    Hour,
}

impl Throttle {
    pub fn window(&self) -> Duration {
        match self.unit {
            ThrottleUnit::Second => Duration::from_secs(1),
            ThrottleUnit::Minute => Duration::from_secs(60),
            ThrottleUnit::Hour => Duration::from_secs(3600),
        }
    }
}

impl Config {
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        for zone in &config.zones {
            if zone.pool.is_empty() {
                return Err(ConfigError::EmptyPool(zone.name.clone()));
            }
        }
        Ok(config)
    }
}

/// Everything a single delivery attempt needs, resolved once at the start
/// of the attempt from `(config, zone, delivery)`. Downstream components
/// read these values, never the three sources.
#[derive(Debug, Clone)]
pub struct AttemptConfig {
    pub zone: String,
    pub local_hostname: String,
    pub dns_options: DnsOptions,
    pub port: u16,
    pub auth: Option<Credentials>,
    pub lmtp: bool,
    /// TLS is mandatory for this attempt (`mxSecure` or smarthost secure).
    pub secure: bool,
    pub connect_timeout: Duration,
    pub greeting_timeout: Duration,
    pub connection_reuse: bool,
}

impl AttemptConfig {
    pub fn resolve(config: &Config, zone: &ZoneConfig, delivery: &Delivery) -> Self {
        let dns_options = delivery.dns_options.clone().unwrap_or_else(|| DnsOptions {
            prefer_ipv6: zone.prefer_ipv6,
            ignore_ipv6: zone.ignore_ipv6,
            block_local_addresses: zone.block_local_addresses,
            block_domains: zone.block_domains.clone(),
        });

        let (port, auth, secure) = match (&zone.smarthost, delivery.mx_port, &delivery.mx_auth) {
            (Some(smarthost), port, auth) => (
                port.unwrap_or(smarthost.port),
                auth.clone().or_else(|| smarthost.auth.clone()),
                smarthost.secure || delivery.mx_secure,
            ),
            (None, port, auth) => (port.unwrap_or(25), auth.clone(), delivery.mx_secure),
        };

        Self {
            zone: zone.name.clone(),
            local_hostname: config.local_hostname.clone(),
            dns_options,
            port,
            auth,
            lmtp: delivery.use_lmtp,
            secure,
            connect_timeout: zone.connect_timeout,
            greeting_timeout: zone.greeting_timeout,
            connection_reuse: zone.connection_reuse,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_connections() -> usize {
    5
}

fn default_reuse_count() -> u32 {
    100
}

fn default_pool_idle() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_greeting_timeout() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_smtp_port() -> u16 {
    25
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(de)?))
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(de)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Config {
        serde_json::from_value(serde_json::json!({
            "name": "mx1",
            "localHostname": "mx1.example.com",
            "broker": "127.0.0.1:12080",
            "zones": [{
                "name": "default",
                "connections": 3,
                "throttling": {"messages": 100, "unit": "minute"},
                "pool": [
                    {"address": "198.51.100.10", "hostname": "mx1-a.example.com"},
                    {"address": "198.51.100.11", "hostname": "mx1-b.example.com"}
                ],
                "poolV6": [
                    {"address": "2001:db8::10", "hostname": "mx1-a.example.com"}
                ]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let config = sample();
        let zone = &config.zones[0];
        assert_eq!(zone.reuse_count, 100);
        assert_eq!(zone.pool_idle_timeout, Duration::from_secs(5));
        assert_eq!(zone.connect_timeout, Duration::from_secs(300));
        assert_eq!(zone.greeting_timeout, Duration::from_secs(120));
        assert!(zone.connection_reuse);
        assert_eq!(zone.throttling.unwrap().window(), Duration::from_secs(60));
    }

    #[test]
    fn attempt_config_prefers_delivery_overrides() {
        let config = sample();
        let raw = serde_json::json!({
            "id": "m1", "seq": "001", "recipient": "a@b.c", "domain": "b.c",
            "_lock": "l", "mxPort": 2525,
            "mxAuth": {"user": "u", "pass": "p"},
            "dnsOptions": {"ignoreIPv6": true, "blockDomains": ["evil.example.org"]},
        });
        let delivery: Delivery = serde_json::from_value(raw).unwrap();
        let attempt = AttemptConfig::resolve(&config, &config.zones[0], &delivery);
        assert_eq!(attempt.port, 2525);
        assert_eq!(attempt.auth.unwrap().user, "u");
        assert!(attempt.dns_options.ignore_ipv6);
        assert_eq!(attempt.dns_options.block_domains, ["evil.example.org"]);
        assert!(!attempt.secure);
    }

    #[test]
    fn zone_dns_options_fill_in_when_delivery_has_none() {
        let mut config = sample();
        config.zones[0].block_local_addresses = true;
        config.zones[0].block_domains = vec!["spamtrap.example.org".to_string()];
        let raw = serde_json::json!({
            "id": "m1", "seq": "001", "recipient": "a@b.c", "domain": "b.c", "_lock": "l",
        });
        let delivery: Delivery = serde_json::from_value(raw).unwrap();
        let attempt = AttemptConfig::resolve(&config, &config.zones[0], &delivery);
        assert!(attempt.dns_options.block_local_addresses);
        assert_eq!(attempt.dns_options.block_domains, ["spamtrap.example.org"]);
    }

    #[test]
    fn smarthost_supplies_port_and_auth() {
        let mut config = sample();
        config.zones[0].smarthost = Some(Smarthost {
            host: "relay.example.net".into(),
            port: 587,
            auth: Some(Credentials {
                user: "relay".into(),
                pass: "secret".into(),
            }),
            secure: true,
        });
        let raw = serde_json::json!({
            "id": "m1", "seq": "001", "recipient": "a@b.c", "domain": "b.c", "_lock": "l",
        });
        let delivery: Delivery = serde_json::from_value(raw).unwrap();
        let attempt = AttemptConfig::resolve(&config, &config.zones[0], &delivery);
        assert_eq!(attempt.port, 587);
        assert!(attempt.secure);
        assert_eq!(attempt.auth.unwrap().user, "relay");
    }
}
