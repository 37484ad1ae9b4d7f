use super::client::SmtpConnection;
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Reuse key: a pooled session is only handed back to deliveries that
/// would open an identical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub local: IpAddr,
    pub host: String,
    pub port: u16,
}

impl PoolKey {
    pub fn render(&self) -> String {
        format!("{}:{}:{}", self.local, self.host, self.port)
    }
}

struct Idle {
    conn: SmtpConnection,
    expires: Instant,
}

/// In-process pool of recently used SMTP sessions, one slot per key.
/// A connection is eligible for reuse iff its previous delivery succeeded
/// and it has headroom on the per-connection message budget. Idle sessions
/// are evicted (with a best-effort QUIT) on a timer or when a fresh
/// session is checked in under the same key.
#[derive(Clone)]
pub struct ConnectionPool {
    slots: Arc<Mutex<HashMap<PoolKey, Idle>>>,
    idle_timeout: Duration,
    reuse_count: u32,
}

impl ConnectionPool {
    pub fn new(idle_timeout: Duration, reuse_count: u32, shutdown: CancellationToken) -> Self {
        let pool = Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
            reuse_count,
        };

        let evictor = pool.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(evictor.idle_timeout);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        evictor.drain().await;
                        return;
                    }
                    _ = interval.tick() => evictor.evict_expired().await,
                }
            }
        });

        pool
    }

    /// Take a live session for this key, if one is parked and fresh.
    pub fn checkout(&self, key: &PoolKey) -> Option<SmtpConnection> {
        let idle = self.slots.lock().expect("pool slots").remove(key)?;
        if idle.expires <= Instant::now() {
            trace!(key = key.render(), "pooled connection expired at checkout");
            tokio::spawn(idle.conn.quit());
            return None;
        }
        debug!(key = key.render(), "reusing pooled connection");
        Some(idle.conn)
    }

    /// Park a session after a clean delivery. Sessions past their reuse
    /// budget (or after a failed delivery) are closed instead; a session
    /// already parked under the key is displaced and closed.
    pub fn checkin(&self, key: PoolKey, conn: SmtpConnection) {
        if !conn.reusable(self.reuse_count) {
            tokio::spawn(conn.quit());
            return;
        }

        let displaced = self.slots.lock().expect("pool slots").insert(
            key,
            Idle {
                conn,
                expires: Instant::now() + self.idle_timeout,
            },
        );
        if let Some(idle) = displaced {
            tokio::spawn(idle.conn.quit());
        }
    }

    async fn evict_expired(&self) {
        let now = Instant::now();
        let expired: Vec<Idle> = {
            let mut slots = self.slots.lock().expect("pool slots");
            let keys: Vec<PoolKey> = slots
                .iter()
                .filter(|(_, idle)| idle.expires <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter().filter_map(|key| slots.remove(&key)).collect()
        };
        for idle in expired {
            debug!("evicting idle pooled connection");
            idle.conn.quit().await;
        }
    }

    async fn drain(&self) {
        let all: Vec<Idle> = {
            let mut slots = self.slots.lock().expect("pool slots");
            slots.drain().map(|(_, idle)| idle).collect()
        };
        for idle in all {
            idle.conn.quit().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        delivery::SourceAddress,
        dns::ResolvedMx,
        smtp::{TlsRequirement, client::{Connector, SourcePair}},
        test::MockSmtpServer,
    };

    async fn open(server: &MockSmtpServer) -> SmtpConnection {
        let connector = Connector {
            ehlo_name: "sender.example.net".into(),
            port: server.port(),
            connect_timeout: Duration::from_secs(5),
            greeting_timeout: Duration::from_secs(5),
            tls: TlsRequirement::Opportunistic,
            lmtp: false,
            auth: None,
            prefer_ipv6: false,
        };
        let records = vec![ResolvedMx {
            exchange: "mx.example.test".into(),
            priority: 0,
            a: vec!["127.0.0.1".parse().unwrap()],
            aaaa: vec![],
        }];
        let sources = SourcePair {
            v4: Some(SourceAddress {
                address: "127.0.0.1".parse().unwrap(),
                ehlo_name: String::new(),
            }),
            v6: None,
        };
        connector
            .connect(&records, &sources, &Default::default())
            .await
            .unwrap()
    }

    fn key() -> PoolKey {
        PoolKey {
            local: "127.0.0.1".parse().unwrap(),
            host: "mx.example.test".into(),
            port: 25,
        }
    }

    async fn send_one(conn: &mut SmtpConnection) {
        conn.mail_from("a@example.net", 0).await.unwrap();
        conn.rcpt_to("b@example.test").await.unwrap();
        conn.data_start().await.unwrap();
        conn.write_body_chunk(b"hi\r\n").await.unwrap();
        conn.finish_data().await.unwrap();
    }

    #[tokio::test]
    async fn checkin_checkout_reuses_the_session() {
        let server = MockSmtpServer::builder().spawn().await;
        let pool = ConnectionPool::new(
            Duration::from_secs(5),
            100,
            CancellationToken::new(),
        );

        let mut conn = open(&server).await;
        send_one(&mut conn).await;
        pool.checkin(key(), conn);

        let mut reused = pool.checkout(&key()).expect("session parked");
        send_one(&mut reused).await;
        assert_eq!(reused.usage_count(), 2);
        assert_eq!(server.state().connections, 1);
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let pool = ConnectionPool::new(
            Duration::from_secs(5),
            100,
            CancellationToken::new(),
        );
        assert!(pool.checkout(&key()).is_none());
    }

    #[tokio::test]
    async fn exhausted_reuse_budget_closes_instead_of_parking() {
        let server = MockSmtpServer::builder().spawn().await;
        let pool = ConnectionPool::new(
            Duration::from_secs(5),
            1,
            CancellationToken::new(),
        );

        let mut conn = open(&server).await;
        send_one(&mut conn).await;
        // usage_count == reuse_count: no longer reusable
        pool.checkin(key(), conn);
        assert!(pool.checkout(&key()).is_none());
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let server = MockSmtpServer::builder().spawn().await;
        let pool = ConnectionPool::new(
            Duration::from_millis(50),
            100,
            CancellationToken::new(),
        );

        let mut conn = open(&server).await;
        send_one(&mut conn).await;
        pool.checkin(key(), conn);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pool.checkout(&key()).is_none());

        // the evictor said goodbye
        server.wait_for_quit(Duration::from_secs(2)).await;
    }
}
