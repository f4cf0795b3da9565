//! Background daemon that keeps the policy datasets unlocked and reports health.

use anyhow::{Context, Result};
use lockchain_core::{
    config::{LockchainConfig, DEFAULT_CONFIG_PATH},
    logging, EventBus, FallbackRequest, HealthReporter, LockchainService, Scheduler,
    UnlockOptions,
};
use lockchain_zfs::SystemZfsProvider;
use log::{error, info, warn};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::{select, signal as tokio_signal};

mod health;
mod media;

const CONFIG_ENV: &str = "LOCKCHAIN_CONFIG";
const TRIGGER_QUEUE: usize = 16;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");
    let config_path =
        PathBuf::from(env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()));
    let config = Arc::new(
        LockchainConfig::load(&config_path)
            .with_context(|| format!("load config {}", config_path.display()))?,
    );
    info!(
        "LockChain daemon booting (config: {}, {} dataset(s))",
        config.path.display(),
        config.policy.datasets.len()
    );

    let provider = SystemZfsProvider::from_config(&config).context("initialise zfs provider")?;
    let events = EventBus::default();
    let service = Arc::new(
        LockchainService::new(config.clone(), provider).with_event_bus(events.clone()),
    );
    let reporter = HealthReporter::new(events);
    let scheduler =
        Scheduler::new(service, reporter.clone()).with_options(unattended_options(&config));

    let bind = health::bind_addr(&config, env::var(health::HEALTH_ADDR_ENV).ok())?;
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind health endpoint {bind}"))?;

    let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    let scheduler_handle = tokio::spawn(scheduler.run(trigger_rx, shutdown_rx.clone()));
    let media_handle = tokio::spawn(media::watch_media(
        media::MediaWatch::from_config(&config),
        trigger_tx,
        shutdown_rx.clone(),
    ));
    let mut health_handle = tokio::spawn(health::serve(listener, reporter, shutdown_rx));

    let outcome = select! {
        res = &mut health_handle => Some(res),
        _ = tokio_signal::ctrl_c() => {
            info!("received interrupt; shutting down");
            None
        }
        _ = terminate.recv() => {
            info!("received SIGTERM; shutting down");
            None
        }
    };

    shutdown_tx.send_replace(true);
    if let Err(err) = media_handle.await {
        warn!("media watcher ended abnormally: {err}");
    }
    if let Err(err) = scheduler_handle.await {
        warn!("scheduler ended abnormally: {err}");
    }
    match outcome {
        Some(res) => res.context("health endpoint task")?,
        None => health_handle.await.context("health endpoint task")?,
    }
}

/// Unattended cycles honour strict mode; otherwise an askpass helper may stand
/// in for missing media when the policy allows it.
fn unattended_options(config: &LockchainConfig) -> UnlockOptions {
    let strict = config.policy.strict_usb;
    let askpass = !strict && config.fallback.enabled && config.fallback.askpass;
    UnlockOptions {
        strict_usb: strict,
        fallback: askpass.then_some(FallbackRequest::Askpass),
        key_override: None,
    }
}
