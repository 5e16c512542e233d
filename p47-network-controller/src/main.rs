#[macro_use]
extern crate log;

use clap::Parser;
use controller::Controller;
use error_sink::LogErrorSink;
use informer::{Informer, watch_events};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Node};
use kube::{
    Api, Client, Config,
    config::{KubeConfigOptions, Kubeconfig},
};
use kube_runtime::events::{Recorder, Reporter};
use p47_network_apis::Network;
use prometheus_exporter::{init_metrics, start_prometheus_metrics_server};
use rate_limiter::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, default_controller_rate_limiter};
use reconciler::NetworkReconciler;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{
    signal::unix::{SignalKind, signal},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use workqueue::WorkQueue;

mod cache_sync;
mod controller;
mod error_sink;
mod errors;
mod informer;
mod keys;
mod prometheus_exporter;
mod rate_limiter;
mod reconciler;
mod utils;
mod workqueue;

/// The component name used for K8s events.
const MANAGER: &'static str = "p47-network-controller";

/// Watches `Network` objects and reconciles them.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// The address of the Kubernetes API server. Overrides any value in kubeconfig.
    #[arg(long)]
    master: Option<String>,

    /// Number of concurrent reconcile workers.
    #[arg(long, default_value_t = 16)]
    workers: usize,

    /// Only watch networks and deployments in this namespace, all namespaces if unset.
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Period of informer resyncs in seconds, 0 disables resyncs.
    #[arg(long, default_value_t = 30)]
    resync_period_secs: u64,

    /// Give up if the informer caches make no sync progress for this many seconds.
    #[arg(long, default_value_t = 300)]
    cache_sync_timeout_secs: u64,

    /// Retry delay after the first reconcile failure of a key, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_BASE_DELAY.as_millis() as u64)]
    retry_base_delay_ms: u64,

    /// Upper bound of the per key retry delay, in seconds.
    #[arg(long, default_value_t = DEFAULT_MAX_DELAY.as_secs())]
    retry_max_delay_secs: u64,

    /// Listen address of the Prometheus metrics endpoint.
    #[arg(long, env = "METRICS_LISTEN_ADDR", default_value = "0.0.0.0:9000")]
    metrics_listen_addr: SocketAddr,
}

impl Args {
    fn resync_period(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.resync_period_secs)).filter(|d| !d.is_zero())
    }

    fn namespaced<K>(&self, client: &Client) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(namespace) => Api::namespaced(client.clone(), namespace),
            None => Api::all(client.clone()),
        }
    }
}

async fn client(args: &Args) -> anyhow::Result<Client> {
    let mut config = match args.kubeconfig.as_ref().filter(|p| !p.as_os_str().is_empty()) {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };
    if let Some(master) = &args.master {
        config.cluster_url = master.parse()?;
    }
    info!("using Kubernetes API server {}", config.cluster_url);
    Ok(Client::try_from(config)?)
}

/// The first SIGINT or SIGTERM cancels `stop`, a second one exits immediately.
fn setup_signal_handler(stop: CancellationToken) -> anyhow::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => (),
            _ = terminate.recv() => (),
        }
        info!("shutdown requested, stopping controller");
        stop.cancel();
        tokio::select! {
            _ = interrupt.recv() => (),
            _ = terminate.recv() => (),
        }
        error!("received second shutdown signal, exiting");
        std::process::exit(1);
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let stop = CancellationToken::new();
    setup_signal_handler(stop.clone())?;
    let (registry, meter_provider) = init_metrics()?;
    let metrics_server =
        start_prometheus_metrics_server(args.metrics_listen_addr, registry, stop.clone()).await?;

    let client = client(&args).await?;
    match &args.namespace {
        Some(namespace) => info!("watching networks in namespace {}", namespace),
        None => info!("watching networks in all namespaces"),
    }
    let resync_period = args.resync_period();
    let mut network_informer = Informer::<Network>::new(resync_period);
    let node_informer = Informer::<Node>::new(resync_period);
    let deployment_informer = Informer::<Deployment>::new(resync_period);

    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: MANAGER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        },
    );
    let reconciler = NetworkReconciler::new(
        network_informer.store(),
        node_informer.store(),
        deployment_informer.store(),
        Some(recorder),
    );
    let queue = WorkQueue::new(
        "network",
        default_controller_rate_limiter(
            Duration::from_millis(args.retry_base_delay_ms),
            Duration::from_secs(args.retry_max_delay_secs),
        ),
    );
    let mut controller = Controller::new(
        queue,
        reconciler,
        Arc::new(LogErrorSink::new()),
        Duration::from_secs(args.cache_sync_timeout_secs),
    );
    controller.add_synced(Arc::new(network_informer.has_synced()));
    controller.add_synced(Arc::new(node_informer.has_synced()));
    controller.add_synced(Arc::new(deployment_informer.has_synced()));
    let controller = Arc::new(controller);
    network_informer.add_event_handler(controller.clone());

    let informers = vec![
        tokio::spawn(network_informer.run(
            watch_events(args.namespaced::<Network>(&client)),
            stop.clone(),
        )),
        tokio::spawn(node_informer.run(
            watch_events(Api::<Node>::all(client.clone())),
            stop.clone(),
        )),
        tokio::spawn(deployment_informer.run(
            watch_events(args.namespaced::<Deployment>(&client)),
            stop.clone(),
        )),
    ];

    info!("start controllers ...");
    let result = controller.run(args.workers, stop.clone()).await;
    stop.cancel();
    for informer in informers {
        if let Err(e) = informer.await {
            warn!("informer task failed: {}", e);
        }
    }
    match metrics_server.await {
        Ok(Err(e)) => warn!("metrics server failed: {}", e),
        Err(e) => warn!("metrics server task failed: {}", e),
        Ok(Ok(())) => (),
    }
    if let Err(e) = meter_provider.shutdown() {
        debug!("meter provider shutdown: {}", e);
    }
    result?;
    info!("controller stopped");
    Ok(())
}
