use crate::{
    broker::BrokerCache,
    classify::DeliveryError,
    dns::MxResolver,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Policies are cached to their own expiry, but never for less than this.
const MIN_TTL: Duration = Duration::from_secs(60);
/// Fetch failures are cached briefly so a broken policy host is not hit
/// once per delivery.
const ERROR_TTL: Duration = Duration::from_secs(60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_POLICY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StsMode {
    #[default]
    None,
    Testing,
    Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StsPolicy {
    pub mode: StsMode,
    pub mx: Vec<String>,
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum CacheEntry {
    Policy(StsPolicy),
    Error { error: String },
}

/// Fetches, verifies and caches per-domain TLS policies, and decides
/// whether a chosen exchange may be used.
pub struct StsHandler {
    http: reqwest::Client,
    resolver: Arc<MxResolver>,
    cache: Option<BrokerCache>,
    enabled: bool,
    #[cfg(test)]
    pub(crate) mock_policies: std::collections::HashMap<String, String>,
}

impl StsHandler {
    pub fn new(resolver: Arc<MxResolver>, cache: Option<BrokerCache>, enabled: bool) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("https client"),
            resolver,
            cache,
            enabled,
            #[cfg(test)]
            mock_policies: Default::default(),
        }
    }

    /// The active policy for a recipient domain, `None` when the domain
    /// publishes none (or publishing is broken, which must never block
    /// mail flow).
    pub async fn policy_for(&self, domain: &str) -> Option<StsPolicy> {
        if !self.enabled {
            return None;
        }

        let key = format!("sts:{domain}");
        if let Some(cache) = &self.cache {
            match cache.get::<CacheEntry>(&key).await {
                Ok(Some(CacheEntry::Policy(policy))) => {
                    if policy.expires > Utc::now() {
                        return Some(policy);
                    }
                }
                Ok(Some(CacheEntry::Error { error })) => {
                    debug!(domain, "cached mta-sts failure: {error}");
                    return None;
                }
                Ok(None) => {}
                Err(err) => warn!(domain, "sts cache read failed: {err}"),
            }
        }

        let policy = match self.fetch_and_verify(domain).await {
            Ok(policy) => policy,
            Err(reason) => {
                debug!(domain, "no usable mta-sts policy: {reason}");
                if let Some(cache) = &self.cache {
                    cache
                        .set_quiet(&key, &CacheEntry::Error { error: reason }, ERROR_TTL)
                        .await;
                }
                return None;
            }
        };

        if let Some(cache) = &self.cache {
            let ttl = (policy.expires - Utc::now())
                .to_std()
                .unwrap_or(MIN_TTL)
                .max(MIN_TTL);
            cache.set_quiet(&key, &CacheEntry::Policy(policy.clone()), ttl).await;
        }
        info!(domain, mode = ?policy.mode, "mta-sts policy cached");
        Some(policy)
    }

    async fn fetch_and_verify(&self, domain: &str) -> Result<StsPolicy, String> {
        // the TXT record is what makes the HTTPS policy trustworthy
        let txt_name = format!("_mta-sts.{domain}");
        match self.resolver.txt_record_exists(&txt_name, "v=STSv1").await {
            Ok(true) => {}
            Ok(false) => return Err(format!("no {txt_name} TXT record")),
            Err(err) => return Err(format!("TXT lookup failed: {err}")),
        }

        let text = self.fetch_policy_text(domain).await?;
        parse_policy(&text)
    }

    #[cfg(not(test))]
    async fn fetch_policy_text(&self, domain: &str) -> Result<String, String> {
        let url = format!("https://mta-sts.{domain}/.well-known/mta-sts.txt");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("fetch failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("policy host answered {}", response.status()));
        }
        let text = response
            .text()
            .await
            .map_err(|err| format!("policy read failed: {err}"))?;
        if text.len() > MAX_POLICY_BYTES {
            return Err("policy document too large".to_string());
        }
        Ok(text)
    }

    #[cfg(test)]
    async fn fetch_policy_text(&self, domain: &str) -> Result<String, String> {
        let _ = (&self.http, MAX_POLICY_BYTES);
        self.mock_policies
            .get(domain)
            .cloned()
            .ok_or_else(|| "fetch failed: connection refused".to_string())
    }

    /// Check a chosen exchange hostname against the policy. Under
    /// `enforce` a mismatch refuses the exchange with a permanent policy
    /// error; under `testing` the mismatch is recorded and delivery
    /// proceeds.
    pub fn check_exchange(
        &self,
        policy: Option<&StsPolicy>,
        domain: &str,
        exchange: &str,
    ) -> Result<(), DeliveryError> {
        let Some(policy) = policy else {
            return Ok(());
        };
        if policy.mode == StsMode::None || mx_matches(&policy.mx, exchange) {
            return Ok(());
        }

        match policy.mode {
            StsMode::Enforce => Err(DeliveryError::policy(format!(
                "MX {exchange} does not match the MTA-STS policy of {domain}"
            ))),
            StsMode::Testing => {
                warn!(
                    domain,
                    exchange, "exchange outside mta-sts policy (testing mode), proceeding"
                );
                Ok(())
            }
            StsMode::None => Ok(()),
        }
    }
}

/// `mail.example.com` matches itself; `*.example.com` matches exactly one
/// left-most label.
pub fn mx_matches(patterns: &[String], host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    patterns.iter().any(|pattern| {
        let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
        if let Some(suffix) = pattern.strip_prefix("*.") {
            host.strip_suffix(suffix)
                .and_then(|head| head.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty() && !label.contains('.'))
        } else {
            host == pattern
        }
    })
}

/// Parse an `mta-sts.txt` policy document (RFC 8461 §3.2).
fn parse_policy(text: &str) -> Result<StsPolicy, String> {
    let mut version = None;
    let mut mode = None;
    let mut max_age = None;
    let mut mx = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(format!("malformed policy line {line:?}"));
        };
        let value = value.trim();
        match key.trim() {
            "version" => version = Some(value.to_string()),
            "mode" => {
                mode = Some(match value {
                    "enforce" => StsMode::Enforce,
                    "testing" => StsMode::Testing,
                    "none" => StsMode::None,
                    other => return Err(format!("unknown mode {other:?}")),
                })
            }
            "max_age" => {
                max_age = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("bad max_age {value:?}"))?,
                )
            }
            "mx" => mx.push(value.to_string()),
            _ => {} // future extension fields are ignored
        }
    }

    if version.as_deref() != Some("STSv1") {
        return Err("missing or unsupported version".to_string());
    }
    let mode = mode.ok_or("missing mode")?;
    let max_age = max_age.ok_or("missing max_age")?;
    if mx.is_empty() && mode != StsMode::None {
        return Err("policy lists no mx patterns".to_string());
    }

    Ok(StsPolicy {
        mode,
        mx,
        expires: Utc::now() + chrono::Duration::seconds(max_age.min(31_557_600) as i64),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dns::mock::MockDns;

    const POLICY: &str = "version: STSv1\nmode: enforce\nmx: mail.example.com\nmx: *.backup.example.com\nmax_age: 86400\n";

    fn handler(mock: MockDns) -> StsHandler {
        StsHandler::new(Arc::new(MxResolver::mock(mock)), None, true)
    }

    #[test]
    fn policy_document_parses() {
        let policy = parse_policy(POLICY).unwrap();
        assert_eq!(policy.mode, StsMode::Enforce);
        assert_eq!(policy.mx, vec!["mail.example.com", "*.backup.example.com"]);
        assert!(policy.expires > Utc::now());
    }

    #[test]
    fn parse_rejects_broken_documents() {
        assert!(parse_policy("mode: enforce\nmax_age: 60\nmx: a.b\n").is_err());
        assert!(parse_policy("version: STSv1\nmode: wild\nmax_age: 60\n").is_err());
        assert!(parse_policy("version: STSv1\nmode: enforce\nmax_age: 60\n").is_err());
    }

    #[test]
    fn wildcard_matches_one_label() {
        let patterns = vec!["mail.example.com".to_string(), "*.backup.example.com".to_string()];
        assert!(mx_matches(&patterns, "mail.example.com"));
        assert!(mx_matches(&patterns, "MAIL.EXAMPLE.COM."));
        assert!(mx_matches(&patterns, "mx1.backup.example.com"));
        assert!(!mx_matches(&patterns, "a.b.backup.example.com"));
        assert!(!mx_matches(&patterns, "backup.example.com"));
        assert!(!mx_matches(&patterns, "other.example.com"));
    }

    #[tokio::test]
    async fn policy_requires_the_txt_record() {
        let mut handler = handler(MockDns::default());
        handler
            .mock_policies
            .insert("example.com".to_string(), POLICY.to_string());
        // policy served over https but no _mta-sts TXT record published
        assert!(handler.policy_for("example.com").await.is_none());
    }

    #[tokio::test]
    async fn policy_fetch_with_txt_succeeds() {
        let mut mock = MockDns::default();
        mock.add_txt("_mta-sts.example.com", "v=STSv1; id=20260801T000000");
        let mut handler = handler(mock);
        handler
            .mock_policies
            .insert("example.com".to_string(), POLICY.to_string());

        let policy = handler.policy_for("example.com").await.unwrap();
        assert_eq!(policy.mode, StsMode::Enforce);
    }

    #[tokio::test]
    async fn enforce_mismatch_is_a_permanent_policy_error() {
        let handler = handler(MockDns::default());
        let policy = parse_policy(POLICY).unwrap();

        let err = handler
            .check_exchange(Some(&policy), "example.com", "backup.other.com")
            .unwrap_err();
        assert_eq!(err.category.as_deref(), Some("policy"));
        assert_eq!(err.temporary, Some(false));

        handler
            .check_exchange(Some(&policy), "example.com", "mail.example.com")
            .unwrap();
    }

    #[tokio::test]
    async fn testing_mode_only_records_the_mismatch() {
        let handler = handler(MockDns::default());
        let mut policy = parse_policy(POLICY).unwrap();
        policy.mode = StsMode::Testing;
        handler
            .check_exchange(Some(&policy), "example.com", "backup.other.com")
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_handler_never_returns_policies() {
        let mut mock = MockDns::default();
        mock.add_txt("_mta-sts.example.com", "v=STSv1; id=1");
        let mut handler = StsHandler::new(Arc::new(MxResolver::mock(mock)), None, false);
        handler
            .mock_policies
            .insert("example.com".to_string(), POLICY.to_string());
        assert!(handler.policy_for("example.com").await.is_none());
    }
}
