//! Playbook Operator - runs ansible playbooks in response to custom resource
//! lifecycle events

mod config;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use playbook_common::events::KubeEventPublisher;
use playbook_common::metrics::ControllerMetrics;
use playbook_common::telemetry::{init_telemetry, TelemetryConfig};
use playbook_common::{KubeResourceStore, ReconciliationStatus};
use playbook_controller::{dispatcher, Controller, PlaybookRunner};

use crate::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_status_schema {
        let schema = schemars::schema_for!(ReconciliationStatus);
        let yaml = serde_yaml::to_string(&schema)
            .map_err(|e| anyhow::anyhow!("Failed to serialize status schema: {}", e))?;
        println!("{yaml}");
        return Ok(());
    }

    init_telemetry(&TelemetryConfig {
        service_name: cli.service_name.clone(),
        json_logs: !cli.plain_logs,
        ..Default::default()
    })?;

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let api_resource = cli.api_resource()?;
    for missing in cli.check_playbooks()? {
        warn!(playbook = %missing.display(), "playbook not found; that workflow will fail");
    }

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let api = watched_api(client.clone(), &api_resource, cli.namespace.as_deref());
    verify_resource(&api, &api_resource).await?;

    let store = KubeResourceStore::new(client.clone(), api_resource.clone())
        .with_status_subresource(cli.status_subresource);
    let runner = PlaybookRunner::new(&cli.playbook_dir)
        .with_program(&cli.ansible_playbook)
        .with_timeout(cli.workflow_timeout());
    let metrics = Arc::new(ControllerMetrics::global(&api_resource.kind));
    let interrupt = CancellationToken::new();

    let controller = Controller::builder(Arc::new(store), Arc::new(runner))
        .metrics(metrics.clone())
        .events(Arc::new(KubeEventPublisher::new(
            client.clone(),
            &cli.service_name,
        )))
        .schema(cli.schema())
        .status_retries(cli.status_retries)
        .shutdown(interrupt.clone())
        .build();

    info!(
        kind = %api_resource.kind,
        api_version = %api_resource.api_version,
        namespace = cli.namespace.as_deref().unwrap_or("<all>"),
        playbooks = %cli.playbook_dir.display(),
        "starting playbook operator"
    );

    let stream = watcher(api, watcher::Config::default()).default_backoff();
    dispatcher::run(
        Arc::new(controller),
        stream,
        shutdown_signal(),
        cli.shutdown_grace(),
        interrupt,
    )
    .await;

    let totals = metrics.snapshot();
    info!(
        events = totals.events,
        managed = totals.managed,
        created = totals.created,
        updated = totals.updated,
        deleted = totals.deleted,
        "playbook operator stopped"
    );
    Ok(())
}

fn watched_api(
    client: Client,
    api_resource: &ApiResource,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    match namespace {
        Some(namespace) => Api::namespaced_with(client, namespace, api_resource),
        None => Api::all_with(client, api_resource),
    }
}

/// Fail fast if the API server is unreachable or the resource type is unknown
async fn verify_resource(
    api: &Api<DynamicObject>,
    api_resource: &ApiResource,
) -> anyhow::Result<()> {
    api.list(&ListParams::default().limit(1))
        .await
        .with_context(|| {
            format!(
                "cannot list {} ({}); is the CRD installed and the API server reachable?",
                api_resource.plural, api_resource.api_version
            )
        })?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
