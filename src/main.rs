use clap::Parser;
use kubeowl::config::{Args, WRITE_TIMEOUT_SECONDS};
use kubeowl::hub::Hub;
use kubeowl::k8s::{self, KubeWatchSource, WatchManager};
use kubeowl::server::{self, AppState};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Already installed means another component chose a provider first
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let user_agent = args.user_agent.as_deref().unwrap_or(k8s::USER_AGENT);
    let client = k8s::client::new(Some(user_agent)).await?;
    let in_cluster = k8s::client::is_running_in_cluster();

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("🛑 Interrupt received, shutting down"),
            Err(e) => warn!("Unable to listen for interrupt: {}", e),
        }
        on_signal.cancel();
    });

    let hub_config = args.hub_config();
    let (hub, hub_task) = Hub::spawn(&hub_config, shutdown.clone());

    let source = KubeWatchSource::new(client, args.namespace.clone());
    let watchers = WatchManager::new(source, hub.clone(), args.watch.clone(), args.retry_policy())
        .start(&shutdown);

    let state = AppState::new(hub, hub_config.client_queue_capacity)
        .with_watchers(watchers.subscribe())
        .in_cluster(in_cluster);
    let connections = state.connections.clone();
    let app = server::router(state, &args.static_dir);

    let listener = TcpListener::bind(args.bind).await?;
    let served = server::serve(listener, app, shutdown.clone()).await;

    shutdown.cancel();
    watchers.join().await;
    if let Err(e) = hub_task.await {
        warn!("Hub task ended abnormally: {}", e);
    }
    // the hub has closed every queue; give each socket time to send its close frame
    server::drain(&connections, Duration::from_secs(WRITE_TIMEOUT_SECONDS)).await;

    served?;
    Ok(())
}
