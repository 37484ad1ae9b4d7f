use super::{BrokerClient, BrokerError, Command};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Facade over the broker's shared key-value store
/// (`GETCACHE`/`SETCACHE`/`CLEARCACHE`). Entries are JSON values with a
/// server-side TTL; writers never need transactions because entries are
/// idempotent.
#[derive(Clone)]
pub struct BrokerCache {
    client: BrokerClient,
}

impl BrokerCache {
    pub fn new(client: BrokerClient) -> Self {
        Self { client }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BrokerError> {
        let value = self
            .client
            .call(Command::Getcache {
                key: key.to_string(),
            })
            .await?;
        let Some(entry) = value.get("value") else {
            return Ok(None);
        };
        if entry.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(entry.clone())?))
    }

    /// Bounded read: a lookup that exceeds `deadline` is treated as a miss
    /// so a cache outage cannot stall delivery. Fatal channel errors still
    /// propagate.
    pub async fn get_deadline<T: DeserializeOwned>(
        &self,
        key: &str,
        deadline: Duration,
    ) -> Result<Option<T>, BrokerError> {
        match tokio::time::timeout(deadline, self.get(key)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key, "cache read exceeded deadline, treating as miss");
                Ok(None)
            }
        }
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        self.client
            .call(Command::Setcache {
                key: key.to_string(),
                value: serde_json::to_value(value)?,
                ttl: ttl.as_millis() as u64,
            })
            .await
            .map(|_| ())
    }

    pub async fn clear(&self, key: &str) -> Result<(), BrokerError> {
        self.client
            .call(Command::Clearcache {
                key: key.to_string(),
            })
            .await
            .map(|_| ())
    }

    /// Best-effort write used on non-critical paths; failures are logged
    /// and swallowed unless the channel itself is gone.
    pub async fn set_quiet<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Err(err) = self.set(key, value, ttl).await {
            if err.is_fatal() {
                return;
            }
            warn!(key, "cache write failed: {err}");
        }
    }

    pub async fn clear_quiet(&self, key: &str) {
        if let Err(err) = self.clear(key).await {
            if err.is_fatal() {
                return;
            }
            warn!(key, "cache clear failed: {err}");
        }
    }

    pub fn raw(&self) -> &BrokerClient {
        &self.client
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<Value>, BrokerError> {
        self.get::<Value>(key).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::MockBroker;

    #[tokio::test]
    async fn set_get_clear_round_trip() {
        let broker = MockBroker::spawn().await;
        let client = BrokerClient::connect(&broker.addr().to_string())
            .await
            .unwrap();
        let cache = BrokerCache::new(client);

        assert!(cache.get_raw("k1").await.unwrap().is_none());
        cache
            .set("k1", &serde_json::json!({"n": 5}), Duration::from_secs(60))
            .await
            .unwrap();
        let value = cache.get_raw("k1").await.unwrap().unwrap();
        assert_eq!(value["n"], 5);

        cache.clear("k1").await.unwrap();
        assert!(cache.get_raw("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_cache_counts_as_miss() {
        let broker = MockBroker::spawn().await;
        broker.set_cache_delay(Duration::from_millis(300));
        let client = BrokerClient::connect(&broker.addr().to_string())
            .await
            .unwrap();
        let cache = BrokerCache::new(client);
        cache
            .set("k1", &serde_json::json!(1), Duration::from_secs(60))
            .await
            .unwrap();

        let hit: Option<Value> = cache
            .get_deadline("k1", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(hit.is_none());
    }
}
