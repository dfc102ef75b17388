use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::info;

use hetzner_k8s::config::Settings;
use hetzner_k8s::controller::host::obtain_hardware_details;
use hetzner_k8s::crd::HetznerBareMetalHost;
use hetzner_k8s::ssh::transport::OpenSshRunner;
use hetzner_k8s::ssh::{Input, RemoteClient};
use hetzner_k8s::telemetry;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log as JSON lines
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version and build information
    Version,
    /// Print the CustomResourceDefinitions as YAML
    Crds,
    /// List bare metal hosts and their provisioning state
    Info(InfoArgs),
    /// Read the hardware inventory of a host over ssh
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace of the hosts
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Address of the host, usually its rescue system
    #[arg(long)]
    ip: String,

    #[arg(long, default_value_t = 22)]
    port: u16,

    /// File holding the private key accepted by the host
    #[arg(long, env = "SSH_PRIVATE_KEY_FILE")]
    private_key_file: PathBuf,

    #[command(flatten)]
    settings: Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Hetzner-K8s v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Crds => {
            print!("{}", hetzner_k8s::crd::crds_yaml()?);
            Ok(())
        }
        Commands::Info(info_args) => {
            telemetry::init_tracing(args.log_json);
            run_info(info_args).await
        }
        Commands::Inspect(inspect_args) => {
            telemetry::init_tracing(args.log_json);
            run_inspect(inspect_args).await
        }
    }
}

async fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let api: Api<HetznerBareMetalHost> = Api::namespaced(client, &args.namespace);
    let hosts = api
        .list(&ListParams::default())
        .await
        .context("failed to list bare metal hosts")?;

    println!("Bare metal hosts: {}", hosts.items.len());
    for host in &hosts.items {
        let status = &host.spec.status;
        println!(
            "{}\tserver={}\tstate={}\terror={}\tmaintenance={}",
            host.name_any(),
            host.spec.server_id,
            status.provisioning_state,
            status.error_type,
            host.spec.maintenance_mode,
        );
    }
    Ok(())
}

async fn run_inspect(args: InspectArgs) -> anyhow::Result<()> {
    args.settings.validate()?;

    let private_key = std::fs::read_to_string(&args.private_key_file).with_context(|| {
        format!(
            "failed to read private key from {}",
            args.private_key_file.display()
        )
    })?;

    info!(ip = %args.ip, port = args.port, "Inspecting host");

    let runner = Arc::new(OpenSshRunner::new(&args.settings));
    let input = Input {
        ip: args.ip,
        private_key,
        port: args.port,
    };
    let client = RemoteClient::new(runner, input, &args.settings);

    let details = obtain_hardware_details(&client).await?;
    println!("{}", serde_json::to_string_pretty(&details)?);
    Ok(())
}
