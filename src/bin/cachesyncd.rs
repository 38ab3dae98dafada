use cachesync::cache::CacheManager;
use cachesync::config::wait_for_config;
use cachesync::{PropagationService, SyncConfig};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "cachesyncd", about = "Cache invalidation propagation node", version)]
struct Args {
  #[arg(short, long, env = "CACHESYNC_CONFIG")]
  config: Option<String>,
  #[arg(long, env = "CACHESYNC_NODE_ID")]
  node_id: Option<String>,
  #[arg(long, env = "CACHESYNC_CLUSTER")]
  cluster: Option<String>,
  #[arg(long, env = "CACHESYNC_BROKER_URL")]
  broker_url: Option<String>,
  /// Force propagation on regardless of the config file
  #[arg(long)]
  enable: bool,
  #[arg(long)]
  log_level: Option<String>,
  /// Seconds between configuration availability checks
  #[arg(long, default_value_t = 10)]
  config_poll_secs: u64,
  /// Seconds between health reports (0 disables them)
  #[arg(long, default_value_t = 30)]
  health_interval_secs: u64,
}

/// `Ok(None)` means the configuration is not available yet
fn load_config(path: Option<&str>) -> Result<Option<SyncConfig>, anyhow::Error> {
  match path {
    Some(path) if Path::new(path).exists() => Ok(Some(SyncConfig::from_file(path)?)),
    Some(_) => Ok(None),
    None => SyncConfig::find_and_load(),
  }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Config may not exist yet; log with what is known now
  let initial = load_config(args.config.as_deref()).unwrap_or_default();
  let level = args
    .log_level
    .clone()
    .or_else(|| initial.as_ref().map(|c| c.logging.level.clone()))
    .unwrap_or_else(|| "info".into());

  tracing_subscriber::registry()
    .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
    .with(tracing_subscriber::fmt::layer())
    .init();

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  tokio::spawn(async move {
    shutdown_signal().await;
    shutdown_tx.send_replace(true);
  });

  let mut config = match initial {
    Some(config) => config,
    None => {
      tracing::info!("Waiting for configuration to become available");
      let path = args.config.clone();
      let loaded = wait_for_config(
        move || {
          let path = path.clone();
          async move { load_config(path.as_deref()) }
        },
        Duration::from_secs(args.config_poll_secs.max(1)),
        shutdown_rx.clone(),
      )
      .await;
      match loaded {
        Some(config) => config,
        None => {
          tracing::info!("Shutdown requested before configuration was available");
          return Ok(());
        }
      }
    }
  };

  // CLI args override config file
  if let Some(id) = args.node_id {
    config.node.id = id;
  }
  if let Some(cluster) = args.cluster {
    config.node.cluster = cluster;
  }
  if let Some(url) = args.broker_url {
    config.broker.url = url;
  }
  if args.enable {
    config.propagation.enabled = true;
  }

  let caches = Arc::new(CacheManager::new());
  let service = PropagationService::from_config(config, caches)?;
  service.start().await?;

  let mut shutdown = shutdown_rx;
  if args.health_interval_secs > 0 && service.is_running() {
    let mut ticker = tokio::time::interval(Duration::from_secs(args.health_interval_secs));
    loop {
      tokio::select! {
        _ = ticker.tick() => match serde_json::to_string(&service.health()) {
          Ok(report) => tracing::info!(health = %report, "Propagation health"),
          Err(e) => tracing::warn!(error = %e, "Failed to render health report"),
        },
        _ = shutdown.changed() => break,
      }
    }
  } else {
    let _ = shutdown.wait_for(|stop| *stop).await;
  }

  service.stop().await;
  tracing::info!("Shutdown complete");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    tokio::signal::ctrl_c()
      .await
      .expect("Failed to install Ctrl+C handler");
  };

  #[cfg(unix)]
  let terminate = async {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("Failed to install SIGTERM handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("Received SIGINT"),
    _ = terminate => tracing::info!("Received SIGTERM"),
  }
}
