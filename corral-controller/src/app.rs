use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::coordination::{LeaderElectionConfig, LeaderElector};
use crate::nodes;
use crate::rebalancer::RebalanceLoop;
use crate::reporter::Reporter;
use crate::server::spawn_metrics_server;
use corral_core::controller::Controller;
use corral_core::models::ClusterConfig;
use corral_core::participant::{LocalTransport, Participant};
use corral_core::paths::PathBuilder;
use corral_core::statemodel;
use corral_core::store::{self, Expected, NodeMode, SledStore, StoreRef};
use corral_core::verifier::{ClusterVerifier, Verifier};
use corral_core::StoreError;

/// The application object for when Corral is running as a controller.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The coordination store.
    store: SledStore,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The in-process message transport.
    transport: LocalTransport,
    /// Nodes hosted by this process.
    local_nodes: Vec<Participant>,

    /// The metrics server task.
    server: TaskHandle,
    /// The leader elector task.
    elector: TaskHandle,
    /// The rebalance loop task.
    rebalancer: TaskHandle,
    /// The reporter task.
    reporter: TaskHandle,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics_handle: PrometheusHandle) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Open the coordination store and ensure the cluster exists.
        let store = SledStore::open(&config.storage_data_path).await.context("error opening coordination store")?;
        let store_ref: StoreRef = Arc::new(store.clone());
        let paths = PathBuilder::new(config.cluster_name.clone());
        ensure_cluster(&store_ref, &paths).await?;

        // Start local nodes.
        let transport = LocalTransport::new();
        let local_nodes = nodes::start_local_nodes(&config.local_nodes, store_ref.clone(), paths.clone(), &transport)
            .await
            .context("error starting local nodes")?;

        // Spawn various core tasks.
        let server = TaskHandle::new("metrics server", spawn_metrics_server(&config, metrics_handle, shutdown_tx.subscribe()));
        let election_config = LeaderElectionConfig::new(
            config.controller_name.clone(),
            chrono::Duration::seconds(config.lease_duration_seconds.into()),
            chrono::Duration::seconds(config.lease_renew_seconds.into()),
        )?;
        let (elector, leader_rx) = LeaderElector::new(store_ref.clone(), paths.clone(), election_config, shutdown_tx.subscribe());
        let elector = elector.spawn();
        let elector = TaskHandle::new(
            "leader elector",
            tokio::spawn(async move { elector.await.context("error joining leader elector task") }),
        );

        let definitions = statemodel::builtin_definitions();
        let controller = Controller::new(
            config.controller_name.clone(),
            store_ref.clone(),
            paths.clone(),
            definitions.clone(),
            Arc::new(transport.clone()),
        );
        let rebalancer = RebalanceLoop::new(
            controller,
            store_ref.clone(),
            paths.clone(),
            config.rebalance_interval(),
            leader_rx,
            shutdown_tx.subscribe(),
        )
        .spawn();
        let rebalancer = TaskHandle::new("rebalance loop", rebalancer);
        let verifier = ClusterVerifier::new(store_ref.clone(), paths.clone(), definitions, Verifier::OneShot);
        let reporter = Reporter::new(
            store_ref,
            paths,
            verifier,
            config.report_interval(),
            config.verify_interval(),
            shutdown_tx.subscribe(),
        )
        .spawn();
        let reporter = TaskHandle::new("reporter", reporter);

        Ok(Self {
            _config: config,
            store,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            transport,
            local_nodes,
            server,
            elector,
            rebalancer,
            reporter,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
                res = self.rebalancer.exited() => {
                    self.rebalancer.task_exited_early(res, &self.shutdown_tx);
                    break;
                }
                res = self.reporter.exited() => {
                    self.reporter.task_exited_early(res, &self.shutdown_tx);
                    break;
                }
                res = self.elector.exited() => {
                    self.elector.task_exited_early(res, &self.shutdown_tx);
                    break;
                }
                res = self.server.exited() => {
                    self.server.task_exited_early(res, &self.shutdown_tx);
                    break;
                }
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Corral controller is shutting down");
        self.rebalancer.join().await;
        self.reporter.join().await;
        self.elector.join().await;
        nodes::stop_local_nodes(self.local_nodes, &self.transport).await;
        self.server.join().await;
        if let Err(err) = self.store.flush().await {
            tracing::error!(error = ?err, "error flushing coordination store");
        }

        tracing::debug!("Corral controller shutdown complete");
        Ok(())
    }
}

/// The join handle of a long-running task, awaited at most once.
pub(crate) struct TaskHandle {
    /// The name of the task used in logs.
    name: &'static str,
    /// The join handle, taken once the task's exit has been observed.
    handle: Option<JoinHandle<Result<()>>>,
}

impl TaskHandle {
    /// Create a new instance.
    pub(crate) fn new(name: &'static str, handle: JoinHandle<Result<()>>) -> Self {
        Self { name, handle: Some(handle) }
    }

    /// Wait for the task to exit.
    ///
    /// Cancel safe. Once the task's exit has been observed this never resolves again.
    pub(crate) async fn exited(&mut self) -> Result<()> {
        let handle = match self.handle.as_mut() {
            Some(handle) => handle,
            None => return futures::future::pending().await,
        };
        let res = handle.await;
        self.handle = None;
        res.with_context(|| format!("error joining {} task", self.name)).and_then(|res| res)
    }

    /// Whether the task's exit has been observed.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_none()
    }

    /// Log the exit of a task which stopped before shutdown and trigger shutdown.
    pub(crate) fn task_exited_early(&self, res: Result<()>, shutdown_tx: &broadcast::Sender<()>) {
        match res {
            Ok(()) => tracing::error!(task = self.name, "task exited before shutdown, beginning graceful shutdown"),
            Err(err) => tracing::error!(error = ?err, task = self.name, "task failed, beginning graceful shutdown"),
        }
        let _ = shutdown_tx.send(());
    }

    /// Join the task unless its exit has already been observed.
    pub(crate) async fn join(&mut self) {
        if self.is_finished() {
            return;
        }
        if let Err(err) = self.exited().await {
            tracing::error!(error = ?err, task = self.name, "error shutting down task");
        }
    }
}

/// Create the cluster config of the managed cluster if it does not exist yet.
async fn ensure_cluster(store: &StoreRef, paths: &PathBuilder) -> Result<()> {
    let config = ClusterConfig::new(paths.cluster());
    match store::write_model(store.as_ref(), &paths.cluster_config(), &config, Expected::Absent, NodeMode::Persistent).await {
        Ok(_) => {
            tracing::info!(cluster = paths.cluster(), "created cluster config");
            Ok(())
        }
        Err(err) => match err.downcast_ref::<StoreError>() {
            Some(StoreError::NodeExists(_)) => Ok(()),
            _ => Err(err.context("error creating cluster config")),
        },
    }
}
