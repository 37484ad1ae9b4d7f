use super::{Family, Zone};
use crate::{
    Engine,
    bounce::{self, DsnContext, DsnKind},
    broker::{DeferRequest, DomainCacheEntry, ReleaseRequest},
    classify::{self, Action, ClassifyContext, DeliveryError, TrailLine},
    config::AttemptConfig,
    delivery::Delivery,
    dns::ResolvedMx,
    headers::Headers,
    hooks::FetchDecision,
    pipeline::{self, SendOutcome},
    smtp::{Connector, PoolKey, TlsRequirement, client::SourcePair},
    sts::{StsMode, StsPolicy},
};
use chrono::Utc;
use serde_json::Value;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// After this long waiting for a connection, the worker yields to the next
/// `GET` and lets the in-flight attempt finish on its own.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
/// Retry pause after a broker transport hiccup on `GET`.
const GET_RETRY_PAUSE: Duration = Duration::from_millis(1500);
/// Pause after a plugin suppressed a fetched delivery.
const SUPPRESS_PAUSE: Duration = Duration::from_millis(1500);

const TTL_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const TTL_FAILURE: Duration = Duration::from_secs(2 * 60);

/// One long-lived delivery loop. A zone runs `connections` of these per
/// process; each keeps its own `tlsDisabled` set so a peer's handshake
/// failure never downgrades another worker's sessions.
pub struct Worker {
    pub id: String,
    pub zone: Arc<Zone>,
    pub engine: Arc<Engine>,
}

impl Worker {
    pub async fn run(self) {
        let zone_name = self.zone.config.name.clone();
        if let Err(err) = self.engine.broker.hello(&zone_name, &self.id).await {
            if err.is_fatal() {
                self.engine.fatal("broker channel lost during HELLO");
                return;
            }
            warn!(worker = self.id, "HELLO failed: {err}");
        }

        let tls_disabled: Arc<Mutex<HashSet<String>>> = Default::default();
        let mut empty_streak: u32 = 0;

        loop {
            if self.engine.shutdown.is_cancelled() {
                debug!(worker = self.id, "worker closing");
                return;
            }

            let delivery = tokio::select! {
                result = self.engine.broker.get(&zone_name) => result,
                _ = self.engine.shutdown.cancelled() => return,
            };

            match delivery {
                Err(err) if err.is_fatal() => {
                    self.engine.fatal("broker channel lost");
                    return;
                }
                Err(err) => {
                    warn!(worker = self.id, "GET failed: {err}");
                    tokio::time::sleep(GET_RETRY_PAUSE).await;
                }
                Ok(None) => {
                    empty_streak = (empty_streak + 1).min(6);
                    let pause = Duration::from_secs(u64::from(empty_streak));
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = self.engine.shutdown.cancelled() => return,
                    }
                }
                Ok(Some(delivery)) => {
                    empty_streak = 0;
                    self.process(delivery, &tls_disabled).await;
                }
            }
        }
    }

    async fn process(&self, mut delivery: Delivery, tls_disabled: &Arc<Mutex<HashSet<String>>>) {
        let cfg = AttemptConfig::resolve(&self.engine.config, &self.zone.config, &delivery);
        delivery.dns_options = Some(cfg.dns_options.clone());

        // both families are preselected because the family actually used
        // depends on which exchange address the connector reaches
        let v4 = self.zone.ip_pool.select(&delivery, Family::V4);
        let mut pool_disabled = v4.pool_disabled;
        let mut sources = SourcePair {
            v4: Some(v4.source.clone()),
            v6: None,
        };
        delivery.state.zone_address_v4 = Some(v4.source);
        if !cfg.dns_options.ignore_ipv6 && self.zone.ip_pool.has_v6() {
            let v6 = self.zone.ip_pool.select(&delivery, Family::V6);
            pool_disabled = pool_disabled || v6.pool_disabled;
            sources.v6 = Some(v6.source.clone());
            delivery.state.zone_address_v6 = Some(v6.source);
        }
        delivery.state.pool_disabled = pool_disabled;
        delivery.state.skip_bounce = delivery.http;

        match self.engine.hooks.sender_fetch(&mut delivery).await {
            Ok(FetchDecision::Deliver) => {}
            Ok(FetchDecision::Suppress { reason }) => {
                info!(
                    worker = self.id,
                    id = delivery.id,
                    seq = delivery.seq,
                    "plugin suppressed delivery: {reason}"
                );
                self.release(&delivery, "suppressed").await;
                tokio::time::sleep(SUPPRESS_PAUSE).await;
                return;
            }
            Err(mut err) => {
                if err.category.is_none() {
                    err.category = Some(classify::category::PLUGIN.to_string());
                }
                finalize_failure(&self.engine, &self.zone, delivery, err).await;
                return;
            }
        }

        // one speedometer token per attempt; TLS fallback retries inside
        // the attempt do not count again
        if let Some(speedometer) = &self.zone.speedometer {
            speedometer.gate().await;
        }

        let (connected_tx, connected_rx) = oneshot::channel::<()>();
        let attempt = tokio::spawn(run_attempt(
            Arc::clone(&self.engine),
            Arc::clone(&self.zone),
            Arc::clone(tls_disabled),
            delivery,
            cfg,
            sources,
            connected_tx,
        ));

        tokio::select! {
            // fires on connect, and also when the attempt resolves before
            // ever connecting (sender dropped)
            _ = connected_rx => {
                if let Err(err) = attempt.await {
                    error!(worker = self.id, "attempt task panicked: {err}");
                }
            }
            _ = tokio::time::sleep(CONNECT_DEADLINE) => {
                debug!(
                    worker = self.id,
                    "connect deadline reached, yielding while the attempt finishes"
                );
            }
        }
    }

    async fn release(&self, delivery: &Delivery, status: &str) {
        release(&self.engine, delivery, status).await;
    }
}

struct AttemptSuccess {
    outcome: SendOutcome,
    mx_hostname: Option<String>,
}

async fn run_attempt(
    engine: Arc<Engine>,
    zone: Arc<Zone>,
    tls_disabled: Arc<Mutex<HashSet<String>>>,
    mut delivery: Delivery,
    cfg: AttemptConfig,
    sources: SourcePair,
    connected_tx: oneshot::Sender<()>,
) {
    let result = drive(
        &engine,
        &zone,
        &tls_disabled,
        &mut delivery,
        &cfg,
        &sources,
        connected_tx,
    )
    .await;

    match result {
        Ok(success) => finalize_success(&engine, &zone, delivery, success).await,
        Err(err) => finalize_failure(&engine, &zone, delivery, err).await,
    }
}

async fn drive(
    engine: &Engine,
    zone: &Zone,
    tls_disabled: &Mutex<HashSet<String>>,
    delivery: &mut Delivery,
    cfg: &AttemptConfig,
    sources: &SourcePair,
    connected_tx: oneshot::Sender<()>,
) -> Result<AttemptSuccess, DeliveryError> {
    let mut headers = delivery.parse_headers();

    if delivery.http {
        prepend_received(delivery, &mut headers, cfg, "HTTP", false, false);
        run_hooks_and_sign(engine, delivery, &mut headers).await?;
        let outcome =
            pipeline::send_http(&engine.http, delivery, &headers, engine.store.as_ref()).await?;
        record_outcome(delivery, &outcome);
        return Ok(AttemptSuccess {
            outcome,
            mx_hostname: None,
        });
    }

    let options = delivery.dns_options.clone().unwrap_or_default();

    // routing: per-delivery override beats the zone smarthost beats DNS
    let (records, via_dns) = if let Some(overrides) = delivery.mx.clone() {
        let mut records = Vec::with_capacity(overrides.len());
        for exchange in &overrides {
            let mut record = engine
                .resolver
                .resolve_exchange(&exchange.exchange, &options)
                .await?;
            record.priority = exchange.priority;
            records.push(record);
        }
        records.sort_by_key(|record| record.priority);
        (records, false)
    } else if let Some(smarthost) = &zone.config.smarthost {
        let record = engine
            .resolver
            .resolve_exchange(&smarthost.host, &options)
            .await?;
        (vec![record], false)
    } else {
        let records = engine
            .resolver
            .resolve(&delivery.domain, &options)
            .await?;
        (records, true)
    };

    let policy = if via_dns {
        engine.sts.policy_for(&delivery.domain).await
    } else {
        None
    };
    let records = apply_sts(engine, policy.as_ref(), &delivery.domain, records)?;
    let tls = if policy
        .as_ref()
        .is_some_and(|policy| policy.mode == StsMode::Enforce)
        || cfg.secure
    {
        TlsRequirement::Required
    } else {
        TlsRequirement::Opportunistic
    };

    // a destination known to be broken defers without a connect attempt
    let cache_key = connect_cache_key(&zone.config.name, delivery, &records, cfg);
    match engine.cache.get::<DomainCacheEntry>(&cache_key).await {
        Ok(Some(entry)) if entry.error => {
            let mut err = DeliveryError::network(entry.response.unwrap_or_else(|| {
                "destination recently failed, backing off".to_string()
            }));
            if entry.category.is_some() {
                err.category = entry.category;
            }
            err.code = entry.code;
            return Err(err);
        }
        Ok(_) => {}
        Err(err) => warn!(key = cache_key, "connect cache read failed: {err}"),
    }

    let primary = match (&sources.v6, &sources.v4) {
        (Some(v6), _) if options.prefer_ipv6 => v6.clone(),
        (_, Some(v4)) => v4.clone(),
        (Some(v6), None) => v6.clone(),
        (None, None) => unreachable!("v4 source is always selected"),
    };
    let first_exchange = records
        .first()
        .map(|record| record.exchange.clone())
        .unwrap_or_else(|| delivery.domain.clone());
    let pool_key = PoolKey {
        local: primary.address,
        host: first_exchange,
        port: cfg.port,
    };

    let pooled = if cfg.connection_reuse {
        zone.pool.checkout(&pool_key)
    } else {
        None
    };

    let mut conn = match pooled {
        Some(conn) => {
            let _ = connected_tx.send(());
            conn
        }
        None => {
            let connector = Connector {
                ehlo_name: cfg.local_hostname.clone(),
                port: cfg.port,
                connect_timeout: cfg.connect_timeout,
                greeting_timeout: cfg.greeting_timeout,
                tls,
                lmtp: cfg.lmtp,
                auth: cfg.auth.clone(),
                prefer_ipv6: options.prefer_ipv6,
            };
            match connector.connect(&records, sources, tls_disabled).await {
                Ok(conn) => {
                    engine.cache.clear_quiet(&cache_key).await;
                    let _ = connected_tx.send(());
                    conn
                }
                Err(err) => {
                    let ttl = if err.response.contains("timed out") {
                        TTL_TIMEOUT
                    } else {
                        TTL_FAILURE
                    };
                    let entry = DomainCacheEntry::failure(
                        &err.response,
                        err.category.as_deref().unwrap_or(classify::category::NETWORK),
                        err.temporary.unwrap_or(true),
                        err.code,
                    );
                    engine.cache.set_quiet(&cache_key, &entry, ttl).await;
                    return Err(err);
                }
            }
        }
    };

    delivery.state.mx_hostname = Some(conn.info.exchange.clone());
    delivery.state.local_address = Some(conn.info.local.ip());
    delivery.state.local_port = Some(conn.info.local.port());
    delivery.state.local_hostname = Some(conn.info.ehlo_name.clone());
    delivery.state.connection_key = Some(pool_key.render());
    delivery.state.tls_used = conn.info.tls;
    delivery.state.auth_used = conn.info.auth;

    let proto = if conn.info.lmtp {
        "LMTP"
    } else if conn.info.tls && conn.info.auth {
        "ESMTPSA"
    } else if conn.info.tls {
        "ESMTPS"
    } else if conn.info.auth {
        "ESMTPA"
    } else {
        "ESMTP"
    };
    prepend_received(delivery, &mut headers, cfg, proto, conn.info.tls, conn.info.auth);

    run_hooks_and_sign(engine, delivery, &mut headers).await?;

    match pipeline::send_message(&mut conn, delivery, &headers, engine.store.as_ref()).await {
        Ok(outcome) => {
            record_outcome(delivery, &outcome);
            let mx_hostname = Some(conn.info.exchange.clone());
            if cfg.connection_reuse {
                zone.pool.checkin(pool_key, conn);
            } else {
                tokio::spawn(conn.quit());
            }
            Ok(AttemptSuccess {
                outcome,
                mx_hostname,
            })
        }
        Err(err) => {
            tokio::spawn(conn.quit());
            Err(err)
        }
    }
}

async fn run_hooks_and_sign(
    engine: &Engine,
    delivery: &mut Delivery,
    headers: &mut Headers,
) -> Result<(), DeliveryError> {
    // plugin header edits happen before signing so they are covered by
    // the signatures
    if let Err(mut err) = engine.hooks.sender_headers(delivery, headers).await {
        if err.category.is_none() {
            err.category = Some(classify::category::PLUGIN.to_string());
        }
        return Err(err);
    }
    pipeline::apply_dkim(delivery, headers, &engine.dkim_keys, engine.store.as_ref()).await
}

fn record_outcome(delivery: &mut Delivery, outcome: &SendOutcome) {
    delivery.state.sent_body_hash = Some(outcome.sent_body_hash.clone());
    delivery.state.sent_body_size = Some(outcome.sent_body_size);
    delivery.state.md5_match = Some(outcome.md5_match);
}

fn prepend_received(
    delivery: &Delivery,
    headers: &mut Headers,
    cfg: &AttemptConfig,
    proto: &str,
    tls: bool,
    _auth: bool,
) {
    let local_ip = delivery
        .state
        .local_address
        .map(|ip| ip.to_string())
        .or_else(|| {
            delivery
                .state
                .zone_address_v4
                .as_ref()
                .map(|source| source.address.to_string())
        })
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let origin = delivery
        .state
        .local_hostname
        .clone()
        .unwrap_or_else(|| cfg.local_hostname.clone());
    let tls_note = if tls { " via TLS" } else { "" };

    headers.add_at(
        0,
        format!(
            "Received: from {origin} ({origin} [{local_ip}]) by {} ([{local_ip}]) with {proto}{tls_note} id {}.{} for <{}>; {}",
            cfg.local_hostname,
            delivery.id,
            delivery.seq,
            delivery.recipient,
            Utc::now().to_rfc2822(),
        ),
    );
}

/// Under `enforce`, only policy-matching exchanges may be contacted; if
/// none match the attempt fails before any socket is opened.
fn apply_sts(
    engine: &Engine,
    policy: Option<&StsPolicy>,
    domain: &str,
    records: Vec<ResolvedMx>,
) -> Result<Vec<ResolvedMx>, DeliveryError> {
    let Some(policy) = policy else {
        return Ok(records);
    };
    if policy.mode == StsMode::None {
        return Ok(records);
    }

    let mut usable = Vec::with_capacity(records.len());
    let mut refusal = None;
    for record in records {
        match engine.sts.check_exchange(Some(policy), domain, &record.exchange) {
            Ok(()) => usable.push(record),
            Err(err) => refusal = Some(err),
        }
    }

    if usable.is_empty() {
        Err(refusal.unwrap_or_else(|| {
            DeliveryError::policy(format!("no exchange of {domain} matches its MTA-STS policy"))
        }))
    } else {
        Ok(usable)
    }
}

/// `<zone>:domain:<exchange|domain>[:<user>][:<port>]`
fn connect_cache_key(
    zone: &str,
    delivery: &Delivery,
    records: &[ResolvedMx],
    cfg: &AttemptConfig,
) -> String {
    let target = records
        .first()
        .map(|record| record.exchange.as_str())
        .unwrap_or(delivery.domain.as_str());
    let mut key = format!("{zone}:domain:{target}");
    if let Some(auth) = &cfg.auth {
        key.push(':');
        key.push_str(&auth.user);
    }
    if cfg.port != 25 {
        key.push_str(&format!(":{}", cfg.port));
    }
    key
}

async fn release(engine: &Engine, delivery: &Delivery, status: &str) -> bool {
    let request = ReleaseRequest {
        id: delivery.id.clone(),
        seq: delivery.seq.clone(),
        domain: delivery.domain.clone(),
        recipient: delivery.recipient.clone(),
        status: status.to_string(),
        address: delivery
            .state
            .local_address
            .or(delivery
                .state
                .zone_address_v4
                .as_ref()
                .map(|source| source.address))
            .map(|ip| ip.to_string()),
        lock: delivery.lock.clone(),
    };
    match engine.broker.release(request).await {
        Ok(true) => true,
        Ok(false) => {
            // stale lease: another worker's acknowledgement won; not fatal
            warn!(
                id = delivery.id,
                seq = delivery.seq,
                "RELEASE ignored, lease was stale"
            );
            false
        }
        Err(err) => {
            error!(id = delivery.id, "RELEASE failed: {err}");
            engine.fatal("broker rejected the acknowledgement channel");
            false
        }
    }
}

async fn finalize_success(
    engine: &Engine,
    _zone: &Zone,
    mut delivery: Delivery,
    success: AttemptSuccess,
) {
    delivery.state.status = Some("delivered".to_string());
    release(engine, &delivery, "delivered").await;
    engine
        .hooks
        .sender_delivered(&delivery, &success.outcome.response)
        .await;
    info!(
        id = delivery.id,
        seq = delivery.seq,
        recipient = delivery.recipient,
        mx = success.mx_hostname.as_deref().unwrap_or("-"),
        elapsed = ?success.outcome.elapsed,
        "delivered"
    );
}

async fn finalize_failure(
    engine: &Engine,
    zone: &Zone,
    mut delivery: Delivery,
    err: DeliveryError,
) {
    let ctx = ClassifyContext {
        deferred_count: delivery.deferred_count(),
        pool_disabled: delivery.state.pool_disabled,
        envelope_from_empty: delivery.envelope_from_empty(),
    };
    let rules = engine.rules.pin();
    let verdict = classify::classify(&err, &rules, ctx, delivery.defer_times.as_deref());

    match verdict.action {
        Action::Defer => {
            let ttl = verdict
                .ttl
                .unwrap_or_else(|| Duration::from_secs(5 * 60));

            let updates = maybe_delayed_dsn(engine, zone, &delivery, &verdict).await;

            let request = DeferRequest {
                id: delivery.id.clone(),
                seq: delivery.seq.clone(),
                lock: delivery.lock.clone(),
                ttl: ttl.as_millis() as u64,
                response: err.response.clone(),
                address: delivery
                    .state
                    .local_address
                    .map(|ip| ip.to_string()),
                category: verdict.category.clone(),
                updates,
                log: render_trail(&err.logtrail),
            };
            match engine.broker.defer(request).await {
                Ok(true) => info!(
                    id = delivery.id,
                    seq = delivery.seq,
                    recipient = delivery.recipient,
                    category = verdict.category,
                    ttl_ms = ttl.as_millis() as u64,
                    "deferred"
                ),
                Ok(false) => warn!(
                    id = delivery.id,
                    seq = delivery.seq,
                    "DEFER ignored, lease was stale"
                ),
                Err(broker_err) => {
                    error!(id = delivery.id, "DEFER failed: {broker_err}");
                    engine.fatal("broker rejected the acknowledgement channel");
                }
            }
        }
        Action::Reject => {
            delivery.state.status = Some("rejected".to_string());
            release(engine, &delivery, "rejected").await;
            info!(
                id = delivery.id,
                seq = delivery.seq,
                recipient = delivery.recipient,
                category = verdict.category,
                response = err.response,
                "rejected"
            );

            let headers = delivery.parse_headers();
            match bounce::suppression_reason(&delivery, &headers) {
                Some(reason) => bounce::log_suppressed(&delivery, &reason),
                None => {
                    let ctx = DsnContext {
                        zone: &zone.config.name,
                        reporting_mta: &engine.config.local_hostname,
                        mx_hostname: delivery.state.mx_hostname.as_deref(),
                        arrival: delivery.created,
                    };
                    let dsn =
                        bounce::compose_dsn(DsnKind::Failed, &delivery, &headers, &verdict, &ctx);
                    let request = bounce::build_bounce_request(&delivery, &verdict, &ctx, dsn);
                    if let Err(broker_err) = engine.broker.bounce(request).await {
                        error!(id = delivery.id, "BOUNCE failed: {broker_err}");
                        if broker_err.is_fatal() {
                            engine.fatal("broker rejected the acknowledgement channel");
                        }
                    }
                }
            }
        }
    }
}

/// First time a deferred delivery crosses the zone's delay-notification
/// threshold, emit the "delayed" DSN variant and mark the delivery so it
/// only happens once.
async fn maybe_delayed_dsn(
    engine: &Engine,
    zone: &Zone,
    delivery: &Delivery,
    verdict: &classify::Verdict,
) -> Value {
    let Some(threshold) = zone.config.delay_notify_after else {
        return Value::Null;
    };
    if delivery
        .deferred
        .as_ref()
        .is_some_and(|deferred| deferred.notified)
    {
        return Value::Null;
    }
    let Some(created) = delivery.created else {
        return Value::Null;
    };
    let age = Utc::now() - created;
    if age < chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX) {
        return Value::Null;
    }

    let headers = delivery.parse_headers();
    if let Some(reason) = bounce::suppression_reason(delivery, &headers) {
        bounce::log_suppressed(delivery, &reason);
    } else {
        let ctx = DsnContext {
            zone: &zone.config.name,
            reporting_mta: &engine.config.local_hostname,
            mx_hostname: delivery.state.mx_hostname.as_deref(),
            arrival: delivery.created,
        };
        let dsn = bounce::compose_dsn(DsnKind::Delayed, delivery, &headers, verdict, &ctx);
        let request = bounce::build_bounce_request(delivery, verdict, &ctx, dsn);
        if let Err(err) = engine.broker.bounce(request).await {
            error!(id = delivery.id, "delayed DSN submission failed: {err}");
            if err.is_fatal() {
                engine.fatal("broker rejected the acknowledgement channel");
            }
            return Value::Null;
        }
        info!(id = delivery.id, seq = delivery.seq, "delayed-delivery notification sent");
    }

    serde_json::json!({"_deferred": {"notified": true}})
}

fn render_trail(lines: &[TrailLine]) -> Vec<String> {
    lines
        .iter()
        .map(|entry| {
            let prefix = match entry.dir {
                classify::TrailDir::Sent => "C:",
                classify::TrailDir::Received => "S:",
            };
            format!("{prefix} {}", entry.line)
        })
        .collect()
}
