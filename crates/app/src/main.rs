#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{ArgAction, Parser};
use tidewatch_core::{Backoff, Error, Settings};
use tidewatch_fabric::{Fabric, FabricConfig};
use tidewatch_kubehub::{ClusterApi, KubeGateway};
use tidewatch_persist::{default_db_path, SqliteStore};
use tidewatch_store::{Registry, RegistryConfig};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tidewatch", version, about = "Record the narrative of every Kubernetes rollout")]
struct Cli {
    /// YAML settings file
    #[arg(short = 'c', long = "config", env = "TIDEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Cluster name recorded in every narrative identity
    #[arg(long = "cluster-name")]
    cluster_name: Option<String>,

    /// Namespace to watch; repeat for several (default: all)
    #[arg(short = 'n', long = "namespace")]
    namespaces: Vec<String>,

    /// SQLite database path
    #[arg(long = "db")]
    db: Option<PathBuf>,

    /// Kubeconfig to use instead of in-cluster config or ~/.kube/config
    #[arg(long = "kubeconfig")]
    kubeconfig: Option<PathBuf>,

    /// Print the resolved settings as YAML and exit
    #[arg(long = "print-config", action = ArgAction::SetTrue)]
    print_config: bool,
}

/// Failure buckets the process exit code is derived from.
#[derive(Debug)]
enum Exit {
    Config(anyhow::Error),
    Cluster(anyhow::Error),
}

impl Exit {
    fn code(&self) -> u8 {
        match self {
            Exit::Config(_) => 1,
            Exit::Cluster(_) => 2,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("TIDEWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TIDEWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TIDEWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

/// File, then environment, then flags.
fn resolve_settings(cli: &Cli) -> Result<Settings, Error> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(name) = cli.cluster_name.as_ref() {
        settings.cluster_name = name.clone();
    }
    if !cli.namespaces.is_empty() {
        settings.watch.namespaces = cli.namespaces.clone();
    }
    if let Some(db) = cli.db.as_ref() {
        settings.storage.path = Some(db.clone());
    }
    settings.validate()?;
    Ok(settings)
}

async fn connect(cli: &Cli, settings: &Settings) -> Result<KubeGateway, Exit> {
    let gateway = match cli.kubeconfig.as_deref() {
        Some(path) => KubeGateway::from_kubeconfig(path).await,
        None => KubeGateway::try_default().await,
    }
    .map_err(|e| Exit::Config(anyhow!(e).context("building kube client")))?;

    let mut backoff = Backoff::new(settings.backoff.policy().with_max_attempts(settings.api.startup_attempts));
    loop {
        match gateway.probe().await {
            Ok(()) => return Ok(gateway),
            Err(e @ Error::PermanentApi { .. }) => return Err(Exit::Cluster(anyhow!(e).context("apiserver refused"))),
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(error = %e, attempt = backoff.attempts(), ?delay, "apiserver unreachable; retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(Exit::Cluster(anyhow!(e).context(format!("apiserver unreachable after {} attempts", backoff.attempts())))),
            },
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => info!("interrupt received"),
        _ = terminate => info!("terminate received"),
    }
}

async fn run(cli: Cli) -> Result<(), Exit> {
    let settings = resolve_settings(&cli).map_err(|e| Exit::Config(e.into()))?;
    if cli.print_config {
        let yaml = serde_yaml::to_string(&settings).map_err(|e| Exit::Config(e.into()))?;
        print!("{yaml}");
        return Ok(());
    }
    info!(cluster = %settings.cluster_name, namespaces = ?settings.watch.namespaces, "starting tidewatch");

    let gateway = connect(&cli, &settings).await?;
    info!("apiserver reachable");

    let db_path = settings.storage.path.clone().unwrap_or_else(default_db_path);
    let store = SqliteStore::open(&db_path).with_context(|| format!("opening {}", db_path.display())).map_err(Exit::Config)?;
    info!(path = %db_path.display(), "storage ready");

    // Alerts only enrich narratives; a broken client leaves them out.
    match tidewatch_alerts::load(&settings.alerts) {
        Ok(providers) if !providers.is_empty() => info!(count = providers.len(), "alert providers configured"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "continuing without alert providers"),
    }

    let registry = Registry::new(
        Arc::new(store),
        RegistryConfig { linger: settings.registry.linger, write_queue: settings.registry.write_queue, backoff: settings.backoff.policy() },
    );
    let api: Arc<dyn ClusterApi> = Arc::new(gateway);
    let fabric = Fabric::start(api, registry.clone(), FabricConfig::from_settings(&settings));

    let mut fatal = fabric.fatal();
    let failure = tokio::select! {
        _ = shutdown_signal() => None,
        res = fatal.wait_for(|e| e.is_some()) => res.ok().and_then(|e| (*e).clone()),
    };
    if let Some(e) = failure.as_ref() {
        error!(error = %e, "unrecoverable cluster API failure; shutting down");
    }

    if !fabric.shutdown(settings.shutdown.window).await {
        warn!(window = ?settings.shutdown.window, "watchers still running at the end of the shutdown window");
    }
    if tokio::time::timeout(settings.shutdown.window, registry.flush()).await.is_err() {
        warn!(window = ?settings.shutdown.window, "storage writes still pending at the end of the shutdown window");
    }
    registry.close().await;
    info!("tidewatch stopped");

    match failure {
        Some(e) => Err(Exit::Cluster(anyhow!(e))),
        None => Ok(()),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(exit) => {
            match &exit {
                Exit::Config(e) => error!(error = format!("{e:#}"), "configuration error"),
                Exit::Cluster(e) => error!(error = format!("{e:#}"), "cluster API failure"),
            }
            ExitCode::from(exit.code())
        }
    }
}
