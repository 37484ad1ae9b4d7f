use crate::{
    broker::BrokerCache,
    classify::DeliveryError,
    delivery::DnsOptions,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};
use tracing::{debug, trace, warn};

#[cfg(not(test))]
use hickory_resolver::{
    Resolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};

#[cfg(test)]
pub mod mock;

/// Cached per lookup under `dns:<qname>`.
const CACHE_TTL: Duration = Duration::from_secs(300);
/// A cache read slower than this counts as a miss so a cache outage never
/// stalls delivery.
const CACHE_DEADLINE: Duration = Duration::from_millis(500);

/// One resolved exchange with its address sets, ordered by priority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedMx {
    pub exchange: String,
    pub priority: u16,
    pub a: Vec<Ipv4Addr>,
    pub aaaa: Vec<Ipv6Addr>,
}

enum LookupOutcome<T> {
    Records(Vec<T>),
    NoRecords,
}

/// MX/A/AAAA resolver with a broker-shared TTL cache and address
/// filtering. The unfiltered expansion is what gets cached; per-delivery
/// options are applied after retrieval.
pub struct MxResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    pub(crate) mock: mock::MockDns,
    cache: Option<BrokerCache>,
}

impl MxResolver {
    #[cfg(not(test))]
    pub fn new(cache: Option<BrokerCache>) -> Self {
        let mut options = ResolverOpts::default();
        options.attempts = 4;
        options.negative_max_ttl = Some(Duration::from_secs(20));

        Self {
            resolver: Resolver::builder_with_config(
                ResolverConfig::quad9_tls(),
                TokioConnectionProvider::default(),
            )
            .with_options(options)
            .build(),
            cache,
        }
    }

    #[cfg(test)]
    pub fn mock(mock: mock::MockDns) -> Self {
        Self { mock, cache: None }
    }

    #[cfg(test)]
    pub fn mock_with_cache(mock: mock::MockDns, cache: BrokerCache) -> Self {
        Self {
            mock,
            cache: Some(cache),
        }
    }

    /// Resolve the delivery route for a recipient domain: IP-literal
    /// passthrough, else MX expansion with A/A-then-AAAA fallback. Every
    /// route, literals included, goes through the address filter.
    pub async fn resolve(
        &self,
        domain: &str,
        options: &DnsOptions,
    ) -> Result<Vec<ResolvedMx>, DeliveryError> {
        if let Some(record) = ip_literal(domain) {
            let records = filter_records(vec![record], options);
            if records.is_empty() {
                return Err(permanent_dns_error(format!(
                    "no usable address for {domain}"
                )));
            }
            return Ok(records);
        }

        let mut records = match self.cached_expansion(domain).await {
            Some(records) => records,
            None => {
                let records = self.expand(domain).await?;
                self.store_expansion(domain, &records).await;
                records
            }
        };

        // same priority is tried in random order per query
        records.shuffle(&mut rand::rng());
        records.sort_by_key(|record| record.priority);

        let records = filter_records(records, options);
        if records.is_empty() {
            return Err(permanent_dns_error(format!(
                "no usable mail exchangers found for {domain}"
            )));
        }
        Ok(records)
    }

    async fn cached_expansion(&self, domain: &str) -> Option<Vec<ResolvedMx>> {
        let cache = self.cache.as_ref()?;
        match cache
            .get_deadline::<Vec<ResolvedMx>>(&format!("dns:{domain}"), CACHE_DEADLINE)
            .await
        {
            Ok(hit) => {
                if hit.is_some() {
                    trace!(domain, "dns cache hit");
                }
                hit
            }
            Err(err) => {
                warn!(domain, "dns cache read failed: {err}");
                None
            }
        }
    }

    async fn store_expansion(&self, domain: &str, records: &[ResolvedMx]) {
        if let Some(cache) = &self.cache {
            cache
                .set_quiet(&format!("dns:{domain}"), &records, CACHE_TTL)
                .await;
        }
    }

    /// MX, then the A/AAAA fallback chain; addresses resolved for every
    /// exchange regardless of options (filtering happens later so cached
    /// expansions serve every option combination).
    async fn expand(&self, domain: &str) -> Result<Vec<ResolvedMx>, DeliveryError> {
        let qname = fqdn(domain);

        let exchanges = match self.query_mx(&qname).await? {
            LookupOutcome::Records(exchanges) => exchanges,
            LookupOutcome::NoRecords => {
                // implicit MX: fall back to the A record, then AAAA
                debug!(domain, "no MX records, falling back to host address");
                let a = match self.query_a(&qname).await? {
                    LookupOutcome::Records(a) => a,
                    LookupOutcome::NoRecords => Vec::new(),
                };
                let aaaa = match self.query_aaaa(&qname).await? {
                    LookupOutcome::Records(aaaa) => aaaa,
                    LookupOutcome::NoRecords => Vec::new(),
                };
                if a.is_empty() && aaaa.is_empty() {
                    return Err(permanent_dns_error(format!(
                        "no mail exchangers found for {domain}"
                    )));
                }
                return Ok(vec![ResolvedMx {
                    exchange: domain.trim_end_matches('.').to_string(),
                    priority: 0,
                    a,
                    aaaa,
                }]);
            }
        };

        let mut records = Vec::with_capacity(exchanges.len());
        for (priority, exchange) in exchanges {
            let exchange_qname = fqdn(&exchange);
            let a = match self.query_a(&exchange_qname).await? {
                LookupOutcome::Records(a) => a,
                LookupOutcome::NoRecords => Vec::new(),
            };
            let aaaa = match self.query_aaaa(&exchange_qname).await? {
                LookupOutcome::Records(aaaa) => aaaa,
                LookupOutcome::NoRecords => Vec::new(),
            };
            records.push(ResolvedMx {
                exchange: exchange.trim_end_matches('.').to_string(),
                priority,
                a,
                aaaa,
            });
        }
        Ok(records)
    }

    /// Resolve one relay host (smarthost or per-delivery MX override) to a
    /// synthetic priority-0 record without an MX query. The result passes
    /// through the same address filter as DNS-routed exchanges.
    pub async fn resolve_exchange(
        &self,
        host: &str,
        options: &DnsOptions,
    ) -> Result<ResolvedMx, DeliveryError> {
        let record = match ip_literal(host) {
            Some(record) => record,
            None => {
                let qname = fqdn(host);
                let a = match self.query_a(&qname).await? {
                    LookupOutcome::Records(a) => a,
                    LookupOutcome::NoRecords => Vec::new(),
                };
                let aaaa = if options.ignore_ipv6 {
                    Vec::new()
                } else {
                    match self.query_aaaa(&qname).await? {
                        LookupOutcome::Records(aaaa) => aaaa,
                        LookupOutcome::NoRecords => Vec::new(),
                    }
                };
                if a.is_empty() && aaaa.is_empty() {
                    return Err(permanent_dns_error(format!(
                        "relay host {host} does not resolve"
                    )));
                }
                ResolvedMx {
                    exchange: host.trim_end_matches('.').to_string(),
                    priority: 0,
                    a,
                    aaaa,
                }
            }
        };

        filter_records(vec![record], options)
            .into_iter()
            .next()
            .ok_or_else(|| {
                permanent_dns_error(format!("no usable address for relay host {host}"))
            })
    }

    /// `true` when a TXT record under `name` starts with `prefix`. Used by
    /// the MTA-STS handler for `_mta-sts.<domain>` discovery.
    pub async fn txt_record_exists(&self, name: &str, prefix: &str) -> Result<bool, DeliveryError> {
        match self.query_txt(&fqdn(name)).await? {
            LookupOutcome::Records(records) => {
                Ok(records.iter().any(|txt| txt.starts_with(prefix)))
            }
            LookupOutcome::NoRecords => Ok(false),
        }
    }

    #[cfg(not(test))]
    async fn query_mx(&self, qname: &str) -> Result<LookupOutcome<(u16, String)>, DeliveryError> {
        match self.resolver.mx_lookup(qname).await {
            Ok(lookup) => Ok(LookupOutcome::Records(
                lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
                    .collect(),
            )),
            Err(err) if is_no_records(&err) => Ok(LookupOutcome::NoRecords),
            Err(err) => Err(DeliveryError::dns(format!("MX lookup of {qname} failed: {err}"))),
        }
    }

    #[cfg(not(test))]
    async fn query_a(&self, qname: &str) -> Result<LookupOutcome<Ipv4Addr>, DeliveryError> {
        match self.resolver.ipv4_lookup(qname).await {
            Ok(lookup) => Ok(LookupOutcome::Records(
                lookup.iter().map(|a| a.0).collect(),
            )),
            Err(err) if is_no_records(&err) => Ok(LookupOutcome::NoRecords),
            Err(err) => Err(DeliveryError::dns(format!("A lookup of {qname} failed: {err}"))),
        }
    }

    #[cfg(not(test))]
    async fn query_aaaa(&self, qname: &str) -> Result<LookupOutcome<Ipv6Addr>, DeliveryError> {
        match self.resolver.ipv6_lookup(qname).await {
            Ok(lookup) => Ok(LookupOutcome::Records(
                lookup.iter().map(|aaaa| aaaa.0).collect(),
            )),
            Err(err) if is_no_records(&err) => Ok(LookupOutcome::NoRecords),
            Err(err) => Err(DeliveryError::dns(format!(
                "AAAA lookup of {qname} failed: {err}"
            ))),
        }
    }

    #[cfg(not(test))]
    async fn query_txt(&self, qname: &str) -> Result<LookupOutcome<String>, DeliveryError> {
        match self.resolver.txt_lookup(qname).await {
            Ok(lookup) => Ok(LookupOutcome::Records(
                lookup.iter().map(|txt| txt.to_string()).collect(),
            )),
            Err(err) if is_no_records(&err) => Ok(LookupOutcome::NoRecords),
            Err(err) => Err(DeliveryError::dns(format!(
                "TXT lookup of {qname} failed: {err}"
            ))),
        }
    }

    #[cfg(test)]
    async fn query_mx(&self, qname: &str) -> Result<LookupOutcome<(u16, String)>, DeliveryError> {
        self.mock.query(&self.mock.mx, qname)
    }

    #[cfg(test)]
    async fn query_a(&self, qname: &str) -> Result<LookupOutcome<Ipv4Addr>, DeliveryError> {
        self.mock.query(&self.mock.a, qname)
    }

    #[cfg(test)]
    async fn query_aaaa(&self, qname: &str) -> Result<LookupOutcome<Ipv6Addr>, DeliveryError> {
        self.mock.query(&self.mock.aaaa, qname)
    }

    #[cfg(test)]
    async fn query_txt(&self, qname: &str) -> Result<LookupOutcome<String>, DeliveryError> {
        self.mock.query(&self.mock.txt, qname)
    }
}

#[cfg(not(test))]
fn is_no_records(err: &hickory_resolver::ResolveError) -> bool {
    match err.kind() {
        hickory_resolver::ResolveErrorKind::Proto(proto) => matches!(
            proto.kind(),
            hickory_resolver::proto::ProtoErrorKind::NoRecordsFound { .. }
        ),
        _ => false,
    }
}

fn permanent_dns_error(response: String) -> DeliveryError {
    let mut err = DeliveryError::dns(response);
    err.temporary = Some(false);
    err
}

/// Queries for fully qualified names are cheaper lookups.
fn fqdn(domain: &str) -> String {
    if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{domain}.")
    }
}

/// Parse `[192.0.2.1]`, `[ipv6:2001:db8::1]` or a bare address literal
/// into a synthetic priority-0 record.
fn ip_literal(domain: &str) -> Option<ResolvedMx> {
    let inner = domain
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(domain);
    let inner = inner
        .strip_prefix("ipv6:")
        .or_else(|| inner.strip_prefix("IPv6:"))
        .unwrap_or(inner);

    let address: IpAddr = inner.parse().ok()?;
    let (a, aaaa) = match address {
        IpAddr::V4(v4) => (vec![v4], Vec::new()),
        IpAddr::V6(v6) => (Vec::new(), vec![v6]),
    };
    Some(ResolvedMx {
        exchange: inner.to_string(),
        priority: 0,
        a,
        aaaa,
    })
}

fn filter_records(records: Vec<ResolvedMx>, options: &DnsOptions) -> Vec<ResolvedMx> {
    let blocked_hosts: Vec<String> = options
        .block_domains
        .iter()
        .map(|entry| entry.trim_end_matches('.').to_ascii_lowercase())
        .collect();
    let blocked_ips: Vec<IpAddr> = options
        .block_domains
        .iter()
        .filter_map(|entry| entry.parse().ok())
        .collect();

    let interface_addresses: Vec<IpAddr> = if options.block_local_addresses {
        if_addrs::get_if_addrs()
            .map(|interfaces| interfaces.into_iter().map(|iface| iface.ip()).collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    records
        .into_iter()
        .filter(|record| {
            let blocked =
                blocked_hosts.contains(&record.exchange.trim_end_matches('.').to_ascii_lowercase());
            if blocked {
                debug!(exchange = record.exchange, "dropping blocked exchange");
            }
            !blocked
        })
        .map(|mut record| {
            if options.ignore_ipv6 {
                record.aaaa.clear();
            }
            record.a.retain(|addr| {
                usable_address(&IpAddr::V4(*addr), options, &blocked_ips, &interface_addresses)
            });
            record.aaaa.retain(|addr| {
                usable_address(&IpAddr::V6(*addr), options, &blocked_ips, &interface_addresses)
            });
            record
        })
        .filter(|record| !record.a.is_empty() || !record.aaaa.is_empty())
        .collect()
}

fn usable_address(
    address: &IpAddr,
    options: &DnsOptions,
    blocked_ips: &[IpAddr],
    interface_addresses: &[IpAddr],
) -> bool {
    if blocked_ips.contains(address) {
        return false;
    }

    // never deliverable, independent of policy
    match address {
        IpAddr::V4(v4) => {
            if v4.is_unspecified() || v4.is_broadcast() {
                return false;
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_unspecified() {
                return false;
            }
        }
    }

    if options.block_local_addresses {
        if interface_addresses.contains(address) {
            return false;
        }
        match address {
            IpAddr::V4(v4) => {
                if v4.is_loopback() || v4.is_private() || v4.is_link_local() {
                    return false;
                }
            }
            IpAddr::V6(v6) => {
                if v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local() {
                    return false;
                }
            }
        }
    }

    true
}
