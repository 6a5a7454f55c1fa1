use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::*;

use crate::cachebuster::{CacheBusterLevel, SystemClock};
use crate::context::Data;
use crate::image::ImageSelector;
use crate::k3s::{ClusterOptions, K3s, DEFAULT_NAME, DEFAULT_PORT};
use crate::platform::{DockerCli, Platform, ServiceHandle};

mod cachebuster;
mod container;
mod context;
mod error;
mod image;
mod k3s;
mod kubeconfig;
mod platform;

/// Runs a k3s server that can be reached both locally and from other containers
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Container tool to drive, `docker` or `podman` when unset
    #[arg(long, env = "CONTAINER_TOOL", global = true)]
    container_tool: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ClusterArgs {
    /// Name of the k3s cluster
    #[arg(long, env = "K3S_NAME", default_value = DEFAULT_NAME, global = true)]
    name: String,

    /// Version (image tag) to use from the official image repository
    #[arg(long, env = "K3S_VERSION", global = true)]
    k3s_version: Option<String>,

    /// Custom image reference in "repository:tag" format
    #[arg(long, env = "K3S_IMAGE", global = true)]
    k3s_image: Option<String>,

    /// HTTPS listen port
    #[arg(long, env = "K3S_PORT", default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    /// Disable packaged components: coredns, servicelb, traefik, local-storage, metrics-server
    #[arg(
        long,
        env = "K3S_DISABLE_SERVICES",
        value_delimiter = ',',
        default_values_t = ["traefik".to_string(), "metrics-server".to_string()],
        global = true
    )]
    disable_services: Vec<String>,

    /// Disable helm controller
    #[arg(long, env = "K3S_DISABLE_HELM_CONTROLLER", global = true)]
    disable_helm_controller: bool,

    /// Disable kube-proxy
    #[arg(long, env = "K3S_DISABLE_KUBE_PROXY", global = true)]
    disable_kube_proxy: bool,

    /// Disable network policy controller
    #[arg(long, env = "K3S_DISABLE_NETWORK_POLICY", global = true)]
    disable_network_policy: bool,

    /// Disable cloud-controller-manager
    #[arg(long, env = "K3S_DISABLE_CLOUD_CONTROLLER", global = true)]
    disable_cloud_controller: bool,

    /// Disable default scheduler
    #[arg(long, env = "K3S_DISABLE_SCHEDULER", global = true)]
    disable_scheduler: bool,

    /// Kubeconfig helper image tag
    #[arg(long, env = "K3S_KUBECONFIG_VERSION", global = true)]
    kubeconfig_version: Option<String>,

    /// Kubeconfig helper image reference
    #[arg(long, env = "K3S_KUBECONFIG_IMAGE", global = true)]
    kubeconfig_image: Option<String>,

    /// Kubectl image tag
    #[arg(long, env = "K3S_KUBECTL_VERSION", global = true)]
    kubectl_version: Option<String>,

    /// Kubectl image reference
    #[arg(long, env = "K3S_KUBECTL_IMAGE", global = true)]
    kubectl_image: Option<String>,
}

impl From<ClusterArgs> for ClusterOptions {
    fn from(args: ClusterArgs) -> Self {
        let selector = |version, image| ImageSelector {
            version,
            image,
            container: None,
        };
        Self {
            name: args.name,
            server: selector(args.k3s_version, args.k3s_image),
            port: args.port,
            disable_services: args
                .disable_services
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect(),
            disable_helm_controller: args.disable_helm_controller,
            disable_kube_proxy: args.disable_kube_proxy,
            disable_network_policy: args.disable_network_policy,
            disable_cloud_controller: args.disable_cloud_controller,
            disable_scheduler: args.disable_scheduler,
            kubeconfig: selector(args.kubeconfig_version, args.kubeconfig_image),
            kubectl: selector(args.kubectl_version, args.kubectl_image),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the k3s server command line
    ServerCommand,

    /// Start k3s in the background and print the container id
    Service {
        /// Cache buster level for the server: daily, hour, minute, second or none
        #[arg(long, default_value = "none")]
        cache_buster: String,
    },

    /// Show whether a started service is running and where it listens
    Status { id: String },

    /// Stop and remove a started service
    Stop { id: String },

    /// Print or save the kubeconfig of the cluster
    Kubeconfig {
        /// Point the server address at localhost instead of the container IP
        #[arg(long)]
        local: bool,

        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Run kubectl against the cluster
    Kubectl {
        /// Pass arguments to kubectl directly instead of through `sh -c`
        #[arg(long)]
        no_shell: bool,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

async fn run<P: Platform>(command: Commands, k3s: K3s, ctx: Data<P>) -> Result<()> {
    match command {
        Commands::ServerCommand => println!("{}", k3s.server_command().join(" ")),
        Commands::Service { cache_buster } => {
            let level = CacheBusterLevel::from(cache_buster.as_str());
            let k3s = k3s.with_cache_buster(level, ctx.clock.as_ref());
            let handle = k3s.start(&ctx).await?;
            println!("{}", handle.id);
        }
        Commands::Status { id } => {
            let status = ctx.platform.status(&ServiceHandle { id }).await?;
            println!("running: {}", status.running);
            for endpoint in status.endpoints {
                println!("endpoint: {endpoint}");
            }
        }
        Commands::Stop { id } => ctx.platform.stop(&ServiceHandle { id }).await?,
        Commands::Kubeconfig { local, output } => {
            let kubeconfig = k3s.kubeconfig(&ctx, local).await?;
            for server in kubeconfig.servers()? {
                info!(%server, "Cluster endpoint");
            }
            match output {
                Some(path) => {
                    kubeconfig.write_to(&path).await?;
                    info!("Kubeconfig written to {}", path.display());
                }
                None => print!("{}", kubeconfig.contents()),
            }
        }
        Commands::Kubectl { no_shell, args } => {
            let out = if no_shell {
                k3s.kubectl_args(&ctx, &args).await?
            } else {
                k3s.kubectl(&ctx, &args.join(" ")).await?
            };
            print!("{out}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let platform = match cli.container_tool {
        Some(tool) => DockerCli::new(tool),
        None => DockerCli::detect().await?,
    };
    let ctx = Data {
        platform,
        clock: Box::new(SystemClock),
    };

    let k3s = K3s::new(cli.cluster.into());
    run(cli.command, k3s, ctx).await
}
