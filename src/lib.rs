use derive_more::FromStr;
use serde::Serialize;
use std::{
    env,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{signal, task::JoinHandle};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod bounce;
pub mod broker;
pub mod classify;
pub mod config;
pub mod delivery;
pub mod dkim;
pub mod dns;
pub mod headers;
pub mod hooks;
pub mod pipeline;
pub mod smtp;
pub mod store;
pub mod sts;
pub mod zone;

#[cfg(test)]
pub(crate) mod test;

pub use broker::{BrokerCache, BrokerClient};
pub use classify::BounceRules;
pub use config::Config;
pub use dkim::DkimKeyStore;
pub use dns::MxResolver;
pub use hooks::{NoopHooks, PluginHooks};
pub use store::{FsStore, MessageStore};
pub use sts::StsHandler;

use zone::{Zone, worker::Worker};

#[derive(Debug, Default, Clone, Copy, FromStr, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub enum Environment {
    Staging,
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn from_env() -> Self {
        env::var("ENVIRONMENT")
            .map(|s| s.parse())
            .inspect_err(|_| warn!("Did not find ENVIRONMENT env var, defaulting to development"))
            .unwrap_or(Ok(Environment::Development))
            .expect(
                "Invalid ENVIRONMENT env var, must be one of: development, production, or staging",
            )
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=debug,info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Rules(#[from] classify::RuleError),
    #[error(transparent)]
    Dkim(#[from] dkim::DkimError),
}

/// The delivery engine of one process: shared clients and caches plus the
/// zones whose workers drain the broker queue.
pub struct Engine {
    pub config: Arc<Config>,
    pub broker: BrokerClient,
    pub cache: BrokerCache,
    pub resolver: Arc<MxResolver>,
    pub sts: Arc<StsHandler>,
    pub store: Arc<dyn MessageStore>,
    pub hooks: Arc<dyn PluginHooks>,
    pub rules: Arc<BounceRules>,
    pub dkim_keys: Arc<DkimKeyStore>,
    pub http: reqwest::Client,
    pub shutdown: CancellationToken,
    failed: AtomicBool,
}

impl Engine {
    pub fn new(
        config: Config,
        broker: BrokerClient,
        resolver: Arc<MxResolver>,
        store: Arc<dyn MessageStore>,
        hooks: Arc<dyn PluginHooks>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, EngineError> {
        let cache = BrokerCache::new(broker.clone());
        let sts = Arc::new(StsHandler::new(
            Arc::clone(&resolver),
            Some(cache.clone()),
            config.mta_sts,
        ));
        Self::assemble(config, broker, resolver, sts, store, hooks, shutdown)
    }

    pub(crate) fn assemble(
        config: Config,
        broker: BrokerClient,
        resolver: Arc<MxResolver>,
        sts: Arc<StsHandler>,
        store: Arc<dyn MessageStore>,
        hooks: Arc<dyn PluginHooks>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, EngineError> {
        if CryptoProvider::get_default().is_none() {
            CryptoProvider::install_default(crypto::aws_lc_rs::default_provider())
                .expect("Failed to install crypto provider");
        }

        let rules = match &config.bounce_rules {
            Some(path) => Arc::new(BounceRules::from_file(path)?),
            None => Arc::new(BounceRules::builtin()),
        };

        let dkim_keys = match (&config.dkim.enabled, &config.dkim.key_dir) {
            (true, Some(dir)) => Arc::new(DkimKeyStore::load(dir.clone())?),
            _ => Arc::new(DkimKeyStore::empty()),
        };

        let cache = BrokerCache::new(broker.clone());
        Ok(Arc::new(Self {
            config: Arc::new(config),
            broker,
            cache,
            resolver,
            sts,
            store,
            hooks,
            rules,
            dkim_keys,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("http client"),
            shutdown,
            failed: AtomicBool::new(false),
        }))
    }

    /// Spawn every zone's workers. The returned handle resolves after a
    /// shutdown (or fatal broker loss) once all workers have stopped.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut workers = tokio::task::JoinSet::new();
            for zone_config in engine.config.zones.clone() {
                let zone = Zone::new(zone_config, engine.shutdown.clone());
                info!(
                    zone = zone.config.name,
                    connections = zone.config.connections,
                    "starting zone"
                );
                for n in 0..zone.config.connections.max(1) {
                    let worker = Worker {
                        id: format!("{}:{}", zone.config.name, n + 1),
                        zone: Arc::clone(&zone),
                        engine: Arc::clone(&engine),
                    };
                    workers.spawn(worker.run());
                }
            }

            let broker_closed = engine.broker.closed();
            tokio::select! {
                _ = broker_closed.cancelled() => {
                    engine.fatal("broker channel closed unexpectedly");
                }
                _ = engine.shutdown.cancelled() => {
                    info!("shutting down delivery engine");
                }
            }
            while workers.join_next().await.is_some() {}
        })
    }

    /// Reload the copy-on-write pieces: bounce rule table and DKIM key
    /// map. In-flight classifications keep the lists they pinned.
    pub fn reload(&self) -> Result<(), EngineError> {
        if let Some(path) = &self.config.bounce_rules {
            self.rules.reload(path)?;
        }
        self.dkim_keys.reload()?;
        Ok(())
    }

    /// Unrecoverable condition (broker channel loss, failed
    /// acknowledgement): stop taking work and make the process exit
    /// non-zero.
    pub(crate) fn fatal(&self, why: &str) {
        error!("fatal: {why}");
        self.failed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
