//! sandboxctl — control plane for ultra-low-latency, isolated sandbox
//! execution environments on Kubernetes (SPEC_FULL.md §1 "crate shape").
//!
//! One binary, five subcommands: the two reconcilers can run standalone
//! (for independently scaled/sharded deployments) or together via
//! `controllers`; `gateway` runs the execution HTTP surface; `crds` prints
//! the CustomResourceDefinition manifests this crate expects to be
//! installed ahead of time.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use sandboxctl::audit::AuditSink;
use sandboxctl::config::Config;
use sandboxctl::crd::{Sandbox, WarmPool};
use sandboxctl::gateway::GatewayState;
use sandboxctl::node_registry::NodeSet;
use sandboxctl::{gateway, metrics, node_registry, pool, sandbox, shutdown};

#[derive(Parser)]
#[command(name = "sandboxctl", version, about = "Control plane for Kubernetes-backed agent sandboxes")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "sandboxctl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run only the WarmPool reconciler.
    PoolController,
    /// Run only the Sandbox reconciler.
    SandboxController,
    /// Run the execution gateway's HTTP surface.
    Gateway,
    /// Run both reconcilers in one process (the common single-replica deployment).
    Controllers,
    /// Print the CustomResourceDefinition manifests for WarmPool and Sandbox.
    Crds,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if path.exists() {
        Config::from_file(path)
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

/// Build a `kube::Client`, honoring `HTTPS_PROXY`/`HTTP_PROXY` (and their
/// lowercase forms) for clusters reached through a corporate proxy
/// (SPEC_FULL.md §6.2 "honours HTTP_PROXY/http_proxy"). `kube::Config`
/// carries a `proxy_url` field for exactly this; explicit kubeconfig
/// settings still win over the environment.
async fn build_kube_client() -> anyhow::Result<Client> {
    let mut config = kube::Config::infer().await?;
    if config.proxy_url.is_none() {
        let proxy = std::env::var("HTTPS_PROXY")
            .or_else(|_| std::env::var("https_proxy"))
            .or_else(|_| std::env::var("HTTP_PROXY"))
            .or_else(|_| std::env::var("http_proxy"))
            .ok();
        if let Some(proxy) = proxy {
            match proxy.parse() {
                Ok(uri) => config.proxy_url = Some(uri),
                Err(e) => tracing::warn!(error = %e, proxy, "ignoring unparseable proxy URL"),
            }
        }
    }
    Ok(Client::try_from(config)?)
}

fn lease_namespace(config: &Config) -> String {
    if config.namespace.watch.is_empty() {
        "default".to_string()
    } else {
        config.namespace.watch.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Crds) {
        print!("{}", serde_yaml::to_string(&WarmPool::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&Sandbox::crd())?);
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let client = build_kube_client().await?;
    let shutdown_token = CancellationToken::new();
    shutdown::install(shutdown_token.clone());
    let audit = AuditSink::spawn(config.audit.path.clone().map(PathBuf::from));

    tokio::spawn({
        let bind_addr = config.metrics.bind_addr.clone();
        async move {
            if let Err(e) = metrics::serve(&bind_addr).await {
                tracing::error!(error = %e, "metrics server exited");
            }
        }
    });

    match cli.command {
        Commands::Crds => unreachable!("handled above"),

        Commands::PoolController => {
            let nodes = NodeSet::default();
            tokio::spawn(node_registry::run(client.clone(), nodes.clone(), shutdown_token.clone()));
            pool::reconciler::run(
                client,
                config.namespace.watch.clone(),
                lease_namespace(&config),
                nodes,
                audit,
                config.reconciler,
                shutdown_token,
            )
            .await;
        }

        Commands::SandboxController => {
            sandbox::reconciler::run(
                client,
                config.namespace.watch.clone(),
                lease_namespace(&config),
                audit,
                config.reconciler,
                shutdown_token,
            )
            .await;
        }

        Commands::Controllers => {
            let nodes = NodeSet::default();
            let registry_task =
                tokio::spawn(node_registry::run(client.clone(), nodes.clone(), shutdown_token.clone()));

            let pool_task = tokio::spawn(pool::reconciler::run(
                client.clone(),
                config.namespace.watch.clone(),
                lease_namespace(&config),
                nodes,
                audit.clone(),
                config.reconciler.clone(),
                shutdown_token.clone(),
            ));
            let sandbox_task = tokio::spawn(sandbox::reconciler::run(
                client,
                config.namespace.watch.clone(),
                lease_namespace(&config),
                audit,
                config.reconciler,
                shutdown_token,
            ));

            let _ = tokio::join!(registry_task, pool_task, sandbox_task);
        }

        Commands::Gateway => {
            let shutdown_grace = std::time::Duration::from_secs(config.reconciler.shutdown_grace_seconds);
            let state = Arc::new(GatewayState::new(
                client,
                audit,
                config.namespace.watch.clone(),
                config.gateway.clone(),
            ));
            let bind_addr = state.config.bind_addr.clone();
            gateway::http::run(state, &bind_addr, shutdown_grace, shutdown_token).await?;
        }
    }

    Ok(())
}
