//! Remedy controller - removes orphaned Azure public IP addresses

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use remedy::config::ControllerConfig;
use remedy::controller::{error_policy, reconcile, Context};
use remedy::crd::PublicIPAddress;
use remedy::metrics::OtelCleanedIpsCounter;
use remedy::provider::ArmPublicIpClient;
use remedy::store::KubePublicIpStore;
use remedy::telemetry::{init_telemetry, TelemetryConfig};

/// Remedy controller - cleans up Azure public IP addresses left behind by deleted services
#[derive(Parser, Debug)]
#[command(name = "remedy-controller", version, about, long_about = None)]
struct Cli {
    /// Print the PublicIPAddress CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    Controller(ControllerArgs),
}

/// Controller mode arguments
///
/// Flags override the values read from `--config`.
#[derive(Parser, Debug, Default)]
struct ControllerArgs {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", env = "REMEDY_CONFIG")]
    config_file: Option<PathBuf>,

    /// Only watch PublicIPAddress objects in this namespace
    #[arg(long, env = "REMEDY_NAMESPACE")]
    namespace: Option<String>,

    /// Azure subscription ID
    #[arg(long, env = "REMEDY_SUBSCRIPTION_ID")]
    subscription_id: Option<String>,

    /// Azure resource group holding the public IPs and load balancers
    #[arg(long, env = "REMEDY_RESOURCE_GROUP")]
    resource_group: Option<String>,

    /// Azure Resource Manager endpoint
    #[arg(long, env = "REMEDY_ARM_ENDPOINT")]
    arm_endpoint: Option<String>,

    /// Bearer token for Azure Resource Manager
    #[arg(long, env = "AZURE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: String,

    /// Emit logs as JSON
    #[arg(long, env = "REMEDY_LOG_JSON")]
    log_json: bool,

    /// Skip installing the PublicIPAddress CRD on startup
    #[arg(long)]
    skip_crd_install: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&PublicIPAddress::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => Err(anyhow::anyhow!(
            "no command given, run with --help for usage"
        )),
    }
}

/// Merge the configuration file with command line overrides
fn load_config(args: &ControllerArgs) -> anyhow::Result<ControllerConfig> {
    let mut config = match &args.config_file {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };

    if let Some(subscription_id) = &args.subscription_id {
        config.azure.subscription_id = subscription_id.clone();
    }
    if let Some(resource_group) = &args.resource_group {
        config.azure.resource_group = resource_group.clone();
    }
    if let Some(endpoint) = &args.arm_endpoint {
        config.azure.arm_endpoint = Some(endpoint.clone());
    }

    config.validate()?;
    Ok(config)
}

/// Install the PublicIPAddress CRD using server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("remedy-controller").force();

    tracing::info!("Installing PublicIPAddress CRD...");
    crds.patch(
        "publicipaddresses.azure.remedy.dev",
        &params,
        &Patch::Apply(&PublicIPAddress::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install PublicIPAddress CRD: {}", e))?;

    Ok(())
}

/// Run the PublicIPAddress controller until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        json_logs: args.log_json,
        ..Default::default()
    })?;

    let config = load_config(&args)?;
    let remedy = &config.orphaned_public_ip_remedy;
    tracing::info!(
        subscription = %config.azure.subscription_id,
        resource_group = %config.azure.resource_group,
        requeue_interval = ?remedy.requeue_interval,
        deletion_grace_period = ?remedy.deletion_grace_period,
        max_get_attempts = remedy.max_get_attempts,
        max_clean_attempts = remedy.max_clean_attempts,
        "Starting remedy controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !args.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let provider = ArmPublicIpClient::new(&config.azure, args.access_token.clone())?;
    let ctx = Arc::new(Context::new(
        Arc::new(provider),
        Arc::new(KubePublicIpStore::new(client.clone())),
        Arc::new(OtelCleanedIpsCounter),
        config.orphaned_public_ip_remedy.clone(),
    ));

    let pubips: Api<PublicIPAddress> = match &args.namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    Controller::new(pubips, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "PublicIPAddress reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "PublicIPAddress reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Remedy controller shutting down");
    Ok(())
}
