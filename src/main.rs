// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use hacox::config::Cli;
use hacox::discovery::Discovery;
use hacox::health::HealthChecker;
use hacox::load_balancer::RandomBalancer;
use hacox::metrics;
use hacox::proxy::Proxy;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hacox=info".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let listen_addrs = cli.listen_addrs().context("parsing --address")?;
    let metrics_addr = cli.metrics_socket_addr().context("parsing --metrics-addr")?;

    let proxy = Arc::new(Proxy::new(Arc::new(RandomBalancer::new())));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health = Arc::new(
        HealthChecker::new(cli.check_interval(), cli.unhealthy_count_threshold, proxy.clone())
            .context("building health checker")?,
    );

    let mut discovery = Discovery::bootstrap(
        cli.servers_config.clone(),
        cli.kubeconfig.clone(),
        cli.backend_port,
        cli.refresh_interval(),
    )
    .await
    .context("bootstrapping discovery")?;

    // Registration order matters: Proxy must see a backend-set update before
    // HealthChecker's corresponding transitions land, so Proxy goes first.
    discovery.add_listener(proxy.clone());
    discovery.add_listener(health.clone());
    discovery.announce_initial().await;

    info!(
        listen = ?listen_addrs,
        metrics = %metrics_addr,
        "hacox starting"
    );

    let discovery = Arc::new(discovery);

    let discovery_task = tokio::spawn({
        let discovery = discovery.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { discovery.run(shutdown_rx).await }
    });

    let health_task = tokio::spawn({
        let health = health.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { health.run(shutdown_rx).await }
    });

    let proxy_task = tokio::spawn({
        let proxy = proxy.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { proxy.run(&listen_addrs, shutdown_rx).await }
    });

    let metrics_task = tokio::spawn({
        let collector = metrics::Collector::new(proxy.clone(), health.clone());
        let shutdown_rx = shutdown_rx.clone();
        async move { metrics::serve(metrics_addr, collector, shutdown_rx).await }
    });

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = discovery_task.await;
    let _ = health_task.await;
    if let Ok(Err(e)) = proxy_task.await {
        error!(error = %e, "proxy task exited with error");
    }
    if let Ok(Err(e)) = metrics_task.await {
        error!(error = %e, "metrics task exited with error");
    }

    info!("hacox shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
