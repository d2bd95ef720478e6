//! waygate: a pluggable TCP proxy gateway.
//!
//! Startup order matters: CLI and config first, then the protocol registry
//! (one deterministic registration pass), then URL resolution into live
//! protocol handles, then the route matcher, and finally the dispatcher's
//! accept loop. Per-connection failures never reach this level; anything that
//! does fail here is fatal and exits non-zero.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use waygate::config;
use waygate::dispatcher::Gateway;
use waygate::logger::{self, log};
use waygate::matcher::RouteMatcher;
use waygate::proxy::Registry;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::CliArgs::parse_args();
    logger::init_logger(&cli.log_mode);

    log::info!(
        version = env!("CARGO_PKG_VERSION"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "Starting waygate"
    );

    let conf = config::load_config(&cli.config_file)
        .with_context(|| format!("can not load config file {}", cli.config_file))?;
    let mode = conf.route_mode();

    // All protocol plugins register here, before any URL is resolved.
    let registry = Registry::with_builtin();

    let local = registry
        .server_from_url(&conf.local)
        .context("can not create local server")?;
    let remote = registry
        .client_from_url(&conf.remote)
        .context("can not create remote client")?;
    let direct = registry
        .client_from_url("direct://")
        .context("can not create direct client")?;

    let matcher = match conf.rules.as_deref() {
        Some(name) => Arc::new(RouteMatcher::from_file(name)),
        None => Arc::new(RouteMatcher::empty()),
    };

    let gateway = Arc::new(Gateway::new(local, remote, direct, matcher, mode));
    let listener = gateway.bind()?;

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        cancel_on_signal.cancel();
    });

    gateway.run(listener, cancel).await;
    log::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                log::error!(error = %e, "Failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                log::error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Shutdown signal received");
    }
}
