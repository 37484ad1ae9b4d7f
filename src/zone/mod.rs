use crate::{config::ZoneConfig, smtp::ConnectionPool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod ippool;
pub mod speedometer;
pub mod worker;

pub use ippool::{Family, IpPool};
pub use speedometer::Speedometer;

/// One sending zone: its configuration plus the three derived holders
/// (speedometer, source-IP pool, connection pool) shared by all workers of
/// this process.
pub struct Zone {
    pub config: ZoneConfig,
    pub speedometer: Option<Speedometer>,
    pub ip_pool: IpPool,
    pub pool: ConnectionPool,
}

impl Zone {
    pub fn new(config: ZoneConfig, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            speedometer: config.throttling.map(Speedometer::new),
            ip_pool: IpPool::new(&config),
            pool: ConnectionPool::new(config.pool_idle_timeout, config.reuse_count, shutdown),
            config,
        })
    }
}
