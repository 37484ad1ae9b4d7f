use async_trait::async_trait;
use std::{path::PathBuf, pin::Pin};
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} is not in the store")]
    NotFound(String),
    #[error("store read failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type BodyStream = Pin<Box<dyn AsyncRead + Send>>;

/// Read access to the message store that persisted envelope and body at
/// ingress. `retrieve` must yield the on-disk body byte-exact, and must be
/// restartable from the beginning (callers may stream the same body more
/// than once, e.g. to compute a missing DKIM body hash before sending).
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn retrieve(&self, id: &str) -> Result<BodyStream, StoreError>;
}

/// Spool-directory store: one file per message id.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // ids come from the broker; never let them escape the spool root
        let safe: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            .collect();
        self.root.join(safe)
    }
}

#[async_trait]
impl MessageStore for FsStore {
    async fn retrieve(&self, id: &str) -> Result<BodyStream, StoreError> {
        let path = self.path_for(id);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::{collections::HashMap, sync::Mutex};

    /// In-memory store for tests.
    #[derive(Default)]
    pub struct MemoryStore {
        bodies: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryStore {
        pub fn with(id: &str, body: &[u8]) -> Self {
            let store = Self::default();
            store.insert(id, body);
            store
        }

        pub fn insert(&self, id: &str, body: &[u8]) {
            self.bodies
                .lock()
                .unwrap()
                .insert(id.to_string(), body.to_vec());
        }
    }

    #[async_trait]
    impl MessageStore for MemoryStore {
        async fn retrieve(&self, id: &str) -> Result<BodyStream, StoreError> {
            let body = self
                .bodies
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            Ok(Box::pin(std::io::Cursor::new(body)))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn fs_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("spool-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("msg-1"), b"body bytes\r\n").unwrap();

        let store = FsStore::new(&dir);
        let mut stream = store.retrieve("msg-1").await.unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"body bytes\r\n");

        // restartable: a second retrieve starts from the beginning
        let mut stream = store.retrieve("msg-1").await.unwrap();
        let mut again = Vec::new();
        stream.read_to_end(&mut again).await.unwrap();
        assert_eq!(again, body);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_message_is_not_found() {
        let store = FsStore::new(std::env::temp_dir());
        let Err(err) = store.retrieve("no-such-id").await else {
            panic!("expected retrieve to fail")
        };
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn path_traversal_is_neutralized() {
        let store = FsStore::new(std::env::temp_dir().join("spool"));
        let path = store.path_for("../../etc/passwd");
        assert!(path.starts_with(std::env::temp_dir().join("spool")));
    }
}
