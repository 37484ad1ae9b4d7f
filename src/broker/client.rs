use super::{BounceRequest, BrokerError, Command, DeferRequest, ReleaseRequest};
use crate::delivery::Delivery;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, error, trace, warn};

const MAX_FRAME: usize = 4 * 1024 * 1024;

/// Client side of the broker channel. Cheap to clone; all clones share one
/// TCP connection, a writer task and a reader task that routes responses
/// back to callers by `req` id.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::Sender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    req: AtomicU64,
    closed: CancellationToken,
}

impl BrokerClient {
    pub async fn connect(addr: &str) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(BrokerError::Connect)?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME));
        let (mut sink, mut frames) = framed.split();

        let (tx, mut rx) = mpsc::channel::<String>(256);
        let closed = CancellationToken::new();
        let inner = Arc::new(Inner {
            tx,
            pending: Mutex::new(HashMap::new()),
            req: AtomicU64::new(1),
            closed: closed.clone(),
        });

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(err) = sink.send(line).await {
                    error!("broker write failed: {err}");
                    break;
                }
            }
            writer_closed.cancel();
        });

        let reader = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                let line = match frame {
                    Ok(line) => line,
                    Err(err) => {
                        error!("broker read failed: {err}");
                        break;
                    }
                };
                trace!("broker <- {line}");
                let value: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!("dropping unparseable broker frame: {err}");
                        continue;
                    }
                };
                let Some(req) = value.get("req").and_then(Value::as_u64) else {
                    warn!("dropping broker frame without req id");
                    continue;
                };
                let waiter = reader.pending.lock().expect("pending map").remove(&req);
                match waiter {
                    Some(waiter) => {
                        waiter.send(value).ok();
                    }
                    None => debug!(req, "no caller waiting for broker response"),
                }
            }
            // dropping the pending map wakes every in-flight caller with
            // a channel-closed error
            reader.pending.lock().expect("pending map").clear();
            reader.closed.cancel();
        });

        Self { inner }
    }

    /// Fires when the underlying channel is gone. The engine treats this
    /// as fatal.
    pub fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    pub async fn call(&self, command: Command) -> Result<Value, BrokerError> {
        let req = self.inner.req.fetch_add(1, Ordering::Relaxed);

        let mut frame = serde_json::to_value(&command)?;
        frame["req"] = Value::from(req);
        let line = serde_json::to_string(&frame)?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending map")
            .insert(req, tx);

        trace!("broker -> {line}");
        if self.inner.closed.is_cancelled() || self.inner.tx.send(line).await.is_err() {
            self.inner.pending.lock().expect("pending map").remove(&req);
            return Err(BrokerError::ChannelClosed);
        }

        let value = tokio::select! {
            value = rx => value.map_err(|_| BrokerError::ChannelClosed)?,
            _ = self.inner.closed.cancelled() => {
                self.inner.pending.lock().expect("pending map").remove(&req);
                return Err(BrokerError::ChannelClosed);
            }
        };
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return Err(BrokerError::Server(message.to_string()));
        }
        Ok(value)
    }

    /// Identify a worker to the broker.
    pub async fn hello(&self, zone: &str, id: &str) -> Result<(), BrokerError> {
        self.call(Command::Hello {
            zone: zone.to_string(),
            id: id.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Fetch the next delivery leased to this worker; `None` when the zone
    /// queue is empty.
    pub async fn get(&self, zone: &str) -> Result<Option<Delivery>, BrokerError> {
        let value = self
            .call(Command::Get {
                zone: zone.to_string(),
            })
            .await?;
        if value.get("id").is_none() {
            return Ok(None);
        }
        let delivery = serde_json::from_value(value)?;
        Ok(Some(delivery))
    }

    /// Returns `released`: `false` means the lease was stale, which is
    /// logged by callers but never fatal.
    pub async fn release(&self, request: ReleaseRequest) -> Result<bool, BrokerError> {
        let value = self.call(Command::Release(request)).await?;
        Ok(value
            .get("released")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn defer(&self, request: DeferRequest) -> Result<bool, BrokerError> {
        let value = self.call(Command::Defer(request)).await?;
        Ok(value
            .get("deferred")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn bounce(&self, request: BounceRequest) -> Result<(), BrokerError> {
        self.call(Command::Bounce(Box::new(request))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::MockBroker;

    #[tokio::test]
    async fn get_empty_queue_returns_none() {
        let broker = MockBroker::spawn().await;
        let client = BrokerClient::connect(&broker.addr().to_string())
            .await
            .unwrap();
        client.hello("default", "worker-1").await.unwrap();
        assert!(client.get("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_returns_queued_delivery() {
        let broker = MockBroker::spawn().await;
        broker.enqueue(crate::test::delivery_json("m1", "001", "rcpt@example.org"));
        let client = BrokerClient::connect(&broker.addr().to_string())
            .await
            .unwrap();
        let delivery = client.get("default").await.unwrap().unwrap();
        assert_eq!(delivery.id, "m1");
        assert_eq!(delivery.recipient, "rcpt@example.org");
    }

    #[tokio::test]
    async fn stale_lock_release_reports_false() {
        let broker = MockBroker::spawn().await;
        broker.set_stale_locks(true);
        let client = BrokerClient::connect(&broker.addr().to_string())
            .await
            .unwrap();
        let released = client
            .release(ReleaseRequest {
                id: "m1".into(),
                seq: "001".into(),
                domain: "example.org".into(),
                recipient: "a@example.org".into(),
                status: "delivered".into(),
                address: None,
                lock: "stale".into(),
            })
            .await
            .unwrap();
        assert!(!released);
    }

    #[tokio::test]
    async fn concurrent_calls_route_by_req_id() {
        let broker = MockBroker::spawn().await;
        broker.enqueue(crate::test::delivery_json("a", "001", "a@example.org"));
        broker.enqueue(crate::test::delivery_json("b", "001", "b@example.org"));
        let client = BrokerClient::connect(&broker.addr().to_string())
            .await
            .unwrap();

        let (one, two) = tokio::join!(client.get("default"), client.get("default"));
        let mut ids = vec![one.unwrap().unwrap().id, two.unwrap().unwrap().id];
        ids.sort();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn channel_loss_surfaces_as_closed() {
        let broker = MockBroker::spawn().await;
        let client = BrokerClient::connect(&broker.addr().to_string())
            .await
            .unwrap();
        broker.shutdown();
        // give the reader task a moment to observe EOF
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let err = client.get("default").await.unwrap_err();
        assert!(err.is_fatal(), "expected fatal error, got {err}");
    }
}
