//! plinth operator - one reconciliation pass of the mesh capabilities

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use plinth_common::crd::{FeatureTracker, PlatformInitialization};
use plinth_common::events::KubeEventPublisher;
use plinth_common::kube_utils::create_client;
use plinth_common::store::{get_typed, KubeStore};
use plinth_common::telemetry::{init_logging, LogConfig, LogFormat};
use plinth_common::ObjectKey;
use plinth_feature::PollConfig;
use plinth_mesh::capability::default_manifests_dir;
use plinth_mesh::{MeshReconciler, MeshSettings};

const CONTROLLER_NAME: &str = "plinth-operator";

/// plinth - brings platform capabilities in line with a PlatformInitialization
#[derive(Parser, Debug)]
#[command(name = "plinth-operator", version, about, long_about = None)]
struct Cli {
    /// Log output format (json or text)
    #[arg(long, env = "PLINTH_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass against a PlatformInitialization
    Reconcile(ReconcileArgs),
    /// Print the CRD manifests and exit
    Crds,
}

#[derive(clap::Args, Debug)]
struct ReconcileArgs {
    /// Name of the PlatformInitialization to reconcile
    #[arg(long, env = "PLINTH_NAME")]
    name: String,

    /// Path to a kubeconfig; in-cluster or default config when unset
    #[arg(long, env = "PLINTH_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Seconds between readiness checks
    #[arg(long, env = "PLINTH_POLL_INTERVAL", default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval: u64,

    /// Seconds before a readiness wait gives up
    #[arg(long, env = "PLINTH_POLL_TIMEOUT", default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    poll_timeout: u64,

    /// Root of the mesh manifest tree
    #[arg(long, env = "PLINTH_MANIFESTS_DIR")]
    manifests_dir: Option<PathBuf>,
}

impl ReconcileArgs {
    fn settings(&self) -> MeshSettings {
        MeshSettings {
            manifests_dir: self
                .manifests_dir
                .clone()
                .unwrap_or_else(default_manifests_dir),
            poll: PollConfig {
                interval: Duration::from_secs(self.poll_interval),
                timeout: Duration::from_secs(self.poll_timeout),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Crds => print_crds(),
        Commands::Reconcile(args) => {
            init_logging(LogConfig {
                format: cli.log_format,
                filter: None,
            })?;
            reconcile(args).await
        }
    }
}

fn print_crds() -> anyhow::Result<()> {
    let initialization = serde_yaml::to_string(&PlatformInitialization::crd())
        .context("failed to serialize PlatformInitialization CRD")?;
    let tracker = serde_yaml::to_string(&FeatureTracker::crd())
        .context("failed to serialize FeatureTracker CRD")?;
    println!("{initialization}---\n{tracker}");
    Ok(())
}

async fn reconcile(args: ReconcileArgs) -> anyhow::Result<()> {
    let client = create_client(args.kubeconfig.as_deref()).await?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let events = Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME));

    let owner: PlatformInitialization = get_typed(store.as_ref(), &ObjectKey::cluster(&args.name))
        .await?
        .with_context(|| format!("PlatformInitialization {} not found", args.name))?;
    owner
        .spec
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid PlatformInitialization {}: {e}", args.name))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling reconciliation");
            on_signal.cancel();
        }
    });

    let reconciler = MeshReconciler::new(store, events, args.settings());
    info!(name = %args.name, "reconciling service mesh capabilities");
    reconciler
        .configure_service_mesh(&owner, &cancel)
        .await
        .inspect_err(|e| error!(name = %args.name, error = %e, "reconciliation failed"))?;
    info!(name = %args.name, "reconciliation complete");
    Ok(())
}
