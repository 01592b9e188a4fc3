//! Ethernetes provisions per-request code-server instances on Kubernetes.
use std::{
    path::{Path, PathBuf},
    pin::pin,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use ethernetes_provisioner::{
    instance::{
        create_instance, delete_instance, inventory, list_workloads, read_config, CleanupPolicy,
        CorrelationId, FileTemplateStore, InstanceConfig, KubeExecChannel,
    },
    labels::{with_number, PROJECT_LABEL_SELECTOR},
    utils::Context,
};
use futures::TryStreamExt;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use opentelemetry::{global, KeyValue};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Kubeconfig to connect with, defaults to the ambient configuration
    #[arg(long, env = "ETHERNETES_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace holding the instances and the routing document
    #[arg(long, short, env = "ETHERNETES_NAMESPACE", default_value = "default")]
    namespace: String,

    #[arg(long, env = "ETHERNETES_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[command(flatten)]
    opts: Opts,
}

/// Instance settings, unset values keep their defaults.
#[derive(Args, Debug)]
struct Opts {
    /// Directory holding code-server-deployment.yaml and code-server-svc.yaml
    #[arg(
        long,
        env = "ETHERNETES_TEMPLATE_DIR",
        default_value = "./manifests/code-server"
    )]
    template_dir: PathBuf,

    /// Prefix of resource names and routed hostnames
    #[arg(long, env = "ETHERNETES_PREFIX")]
    prefix: Option<String>,

    /// Ingress holding the routing rules
    #[arg(long, env = "ETHERNETES_ROUTING_DOCUMENT")]
    routing_document: Option<String>,

    /// Service port the routing rules forward to
    #[arg(long, env = "ETHERNETES_BACKEND_PORT")]
    backend_port: Option<i32>,

    /// Timeout of each cluster API call, in seconds
    #[arg(long, env = "ETHERNETES_API_TIMEOUT")]
    api_timeout: Option<u64>,

    /// How long to wait for a workload's pods to go away, in seconds
    #[arg(long, env = "ETHERNETES_CASCADE_TIMEOUT")]
    cascade_timeout: Option<u64>,

    /// Retries of a routing document write rejected as conflicting
    #[arg(long, env = "ETHERNETES_CONFLICT_RETRIES")]
    conflict_retries: Option<u32>,

    /// Ids drawn before allocation gives up
    #[arg(long, env = "ETHERNETES_ALLOCATION_ATTEMPTS")]
    allocation_attempts: Option<u32>,

    /// Accept drawn ids without checking they are unused
    #[arg(long, env = "ETHERNETES_NO_COLLISION_GUARD")]
    no_collision_guard: bool,

    /// Delay before reading the config back, in seconds
    #[arg(long, env = "ETHERNETES_SETTLE_DELAY")]
    settle_delay: Option<u64>,

    /// Skip reading the config back after creation
    #[arg(long, env = "ETHERNETES_NO_VERIFY")]
    no_verify: bool,

    /// What to do with a partially created instance
    #[arg(long, env = "ETHERNETES_CLEANUP", value_enum)]
    cleanup: Option<CleanupPolicy>,
}

impl Opts {
    fn config(&self) -> InstanceConfig {
        let defaults = InstanceConfig::default();
        InstanceConfig {
            prefix: self.prefix.clone().unwrap_or(defaults.prefix),
            routing_document: self
                .routing_document
                .clone()
                .unwrap_or(defaults.routing_document),
            backend_port: self.backend_port.unwrap_or(defaults.backend_port),
            api_timeout: self
                .api_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.api_timeout),
            cascade_timeout: self
                .cascade_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.cascade_timeout),
            conflict_retries: self.conflict_retries.unwrap_or(defaults.conflict_retries),
            allocation_attempts: self
                .allocation_attempts
                .unwrap_or(defaults.allocation_attempts),
            collision_guard: !self.no_collision_guard,
            settle_delay: self
                .settle_delay
                .map(Duration::from_secs)
                .unwrap_or(defaults.settle_delay),
            verify: !self.no_verify,
            cleanup: self.cleanup.unwrap_or(defaults.cleanup),
            ..defaults
        }
    }
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Create an instance and print its id and host
    Create,
    /// List workloads
    List {
        /// Label selector of the workloads
        #[arg(long, default_value = PROJECT_LABEL_SELECTOR)]
        selector: String,
        /// Only list the workload of this instance
        #[arg(long)]
        id: Option<CorrelationId>,
    },
    /// Delete an instance by id
    Delete {
        /// Correlation id of the instance
        id: CorrelationId,
    },
    /// List every managed deployment, service and pod
    Inventory,
    /// Print the code-server config of an instance
    Config {
        /// Correlation id of the instance
        id: CorrelationId,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Create => "create",
            Command::List { .. } => "list",
            Command::Delete { .. } => "delete",
            Command::Inventory => "inventory",
            Command::Config { .. } => "config",
        }
    }
}

async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            Config::from_custom_kubeconfig(
                Kubeconfig::read_from(path)?,
                &KubeConfigOptions::default(),
            )
            .await?
        }
        None => Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let telemetry = ethernetes_common::telemetry::init(args.otlp_endpoint.clone()).await?;

    let meter = global::meter("ethernetes");
    let runs = meter
        .u64_counter("provisioner_runs")
        .with_description("Number of runs of the provisioner")
        .init();
    runs.add(1, &[KeyValue::new("command", args.command.name())]);

    info!(?args.command, namespace = args.namespace, "starting provisioner");
    let result = run(&args).await;
    if let Err(err) = &result {
        error!(?err, "command failed");
    }

    // Flush traces and metrics before shutdown
    telemetry.shutdown()?;
    result
}

async fn run(args: &Cli) -> Result<()> {
    let k_client = client(args.kubeconfig.as_deref()).await?;
    let cx = Arc::new(Context::new(
        k_client.clone(),
        FileTemplateStore::new(&args.opts.template_dir),
        KubeExecChannel::new(k_client),
        args.opts.config(),
    ));
    let ns = args.namespace.as_str();

    match &args.command {
        Command::Create => match create_instance(cx, ns).await {
            Ok(instance) => {
                println!("id: {}", instance.id);
                println!("host: {}", instance.host);
                if let Some(config) = instance.config {
                    println!("{config}");
                }
            }
            Err(err) => {
                if let (Some(id), true) = (err.id, err.leaves_resources()) {
                    eprintln!("instance {id} is partially created, remove it with `ethernetes delete {id}`");
                }
                return Err(err.into());
            }
        },
        Command::List { selector, id } => {
            let selector = match id {
                Some(id) => with_number(selector, *id),
                None => selector.clone(),
            };
            let mut workloads = pin!(list_workloads(cx, ns, &selector));
            while let Some(workload) = workloads.try_next().await? {
                println!("{}\t{}", workload.name, workload.replicas);
            }
        }
        Command::Delete { id } => {
            let report = delete_instance(cx, ns, *id).await?;
            println!("rule: {:?}", report.rule);
            println!("endpoint: {:?}", report.endpoint);
            println!("workload: {:?}", report.workload);
        }
        Command::Inventory => {
            let found = inventory(cx, ns).await?;
            for workload in found.workloads {
                println!("deployment\t{}\t{}", workload.name, workload.replicas);
            }
            for endpoint in found.endpoints {
                println!("service\t{endpoint}");
            }
            for pod in found.pods {
                println!(
                    "pod\t{}\t{}",
                    pod.name,
                    pod.phase.as_deref().unwrap_or("Unknown")
                );
            }
        }
        Command::Config { id } => {
            let config = read_config(cx, ns, *id)
                .await
                .map_err(|err| anyhow!("instance {id}: {err}"))?;
            print!("{config}");
        }
    }
    Ok(())
}
