use anyhow::Context;
use mailrush::{
    BrokerCache, BrokerClient, Config, Engine, FsStore, MxResolver, NoopHooks, init_tracing,
    shutdown_signal,
};
use std::{sync::Arc, time::Duration};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    let environment = mailrush::Environment::from_env();
    info!(?environment, "starting sender");

    let config_path =
        std::env::var("MAILRUSH_CONFIG").unwrap_or_else(|_| "mailrush.json".to_string());
    let config = Config::from_file(&config_path)
        .with_context(|| format!("could not load engine config from {config_path}"))?;

    let spool_dir = config
        .spool_dir
        .clone()
        .context("spoolDir must be set for the sender process")?;

    let broker = BrokerClient::connect(&config.broker)
        .await
        .with_context(|| format!("could not reach the queue broker at {}", config.broker))?;
    let resolver = Arc::new(MxResolver::new(Some(BrokerCache::new(broker.clone()))));

    let shutdown = CancellationToken::new();
    let engine = Engine::new(
        config,
        broker,
        resolver,
        Arc::new(FsStore::new(spool_dir)),
        Arc::new(NoopHooks),
        shutdown.clone(),
    )
    .context("failed to assemble the delivery engine")?;

    let engine_handle = engine.spawn();

    // SIGHUP swaps the bounce rule table and the DKIM key map
    let reload_engine = Arc::clone(&engine);
    let reload_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut hup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
        loop {
            tokio::select! {
                _ = reload_shutdown.cancelled() => return,
                _ = hup.recv() => match reload_engine.reload() {
                    Ok(()) => info!("configuration reloaded"),
                    Err(err) => warn!("reload failed: {err}"),
                },
            }
        }
    });

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping delivery");
    shutdown.cancel();

    // give in-flight attempts the opportunity to reach their terminus
    tokio::time::sleep(Duration::from_secs(2)).await;
    engine_handle.abort();

    if engine.failed() {
        std::process::exit(1);
    }
    Ok(())
}
