//! Kiln controller daemon.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;
use kiln_executor::{EcsExecutor, K8sExecutor};
use kiln_server::config::ControllerConfig;
use kiln_server::http::{AppState, router};
use kiln_server::orchestrator::{Orchestrator, OrchestratorOptions};
use kiln_server::push::RegistryClient;
use kiln_state::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "kilnd")]
#[command(about = "Kiln build controller - fans manifests out to remote build workers")]
struct Args {
    /// Address to serve the controller API on
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "LISTEN_ADDR")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("SERVER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = ControllerConfig::from_env().wrap_err("load configuration")?;

    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.ecs.region.clone()))
        .load()
        .await;
    let ecs = Arc::new(EcsExecutor::new(
        aws_sdk_ecs::Client::new(&sdk_config),
        config.ecs.clone(),
        config.storage.clone(),
        config.controller_url.clone(),
    ));

    let registry = Arc::new(Registry::new());
    let mut orchestrator = Orchestrator::new(
        registry.clone(),
        Arc::new(RegistryClient::new()),
        OrchestratorOptions {
            controller_url: config.controller_url.clone(),
            task_timeout: config.task_timeout,
            result_timeout: config.result_timeout,
            defaults: config.defaults.clone(),
        },
    )
    .with_ecs(ecs.clone());

    match k8s_client(&config).await? {
        Some(client) => {
            orchestrator = orchestrator.with_k8s(Arc::new(K8sExecutor::new(
                client,
                config.k8s.clone(),
                config.storage.clone(),
                config.controller_url.clone(),
            )));
            info!(namespace = %config.k8s.namespace, "kubernetes executor enabled");
        }
        None => info!("kubernetes executor disabled"),
    }

    let app = router(AppState {
        registry,
        orchestrator: Arc::new(orchestrator),
        context_bucket: config.context_bucket.clone(),
        auth_token: config.auth_token.clone(),
    });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .wrap_err_with(|| format!("bind {}", args.listen))?;
    info!(
        listen = %args.listen,
        cluster = %config.ecs.cluster,
        bucket = %config.context_bucket,
        "controller listening"
    );

    let shutdown = CancellationToken::new();
    let serve_token = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_token.cancelled().await })
            .await
    });

    wait_for_signal().await?;
    info!("shutdown signal received, draining connections");
    shutdown.cancel();
    match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
        Ok(result) => result.wrap_err("server task")?.wrap_err("serve")?,
        Err(_) => warn!("drain window expired, abandoning open connections"),
    }

    if config.cleanup_task_definitions {
        info!("deregistering cached task definitions");
        ecs.cleanup_task_definitions().await;
    }

    Ok(())
}

/// Kubernetes enablement: an explicit `K8S_CONFIG_PATH` must load, while
/// failed in-cluster/default inference just disables the executor.
async fn k8s_client(config: &ControllerConfig) -> eyre::Result<Option<kube::Client>> {
    match &config.k8s_config_path {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .wrap_err_with(|| format!("read kubeconfig {}", path.display()))?;
            let client_config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .wrap_err("load kubeconfig")?;
            Ok(Some(
                kube::Client::try_from(client_config).wrap_err("kubernetes client")?,
            ))
        }
        None => match kube::Config::infer().await {
            Ok(client_config) => Ok(Some(
                kube::Client::try_from(client_config).wrap_err("kubernetes client")?,
            )),
            Err(err) => {
                info!(error = %err, "no kubernetes configuration inferred");
                Ok(None)
            }
        },
    }
}

async fn wait_for_signal() -> eyre::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .wrap_err("install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.wrap_err("install SIGINT handler")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.wrap_err("install SIGINT handler")?;
    Ok(())
}
