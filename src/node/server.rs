//! Node runtime
//!
//! Wires the collaborators to the four loops (plus the optional admin API)
//! and runs them until shutdown is signalled.

use futures_util::future::select_all;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use super::announcer::Announcer;
use super::backoff;
use super::capacity::CapacityEstimator;
use super::detector::FailureDetector;
use super::enforcer::{Enforcer, EnforcerSettings};
use super::http::{create_router, AdminState};
use super::ingestor::Ingestor;
use super::Shutdown;
use crate::common::{Error, NodeConfig, NodeMetrics, Result, StateBackend};
use crate::content::{ContentStore, IpfsContentStore};
use crate::state::{MemoryStateStore, RocksStateStore, StateStore};
use crate::transport::{IpfsPubsub, Transport};

pub struct Node {
    config: NodeConfig,
    state: Arc<dyn StateStore>,
    content: Arc<dyn ContentStore>,
    transport: Arc<dyn Transport>,
    metrics: Arc<NodeMetrics>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        state: Arc<dyn StateStore>,
        content: Arc<dyn ContentStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            state,
            content,
            transport,
            metrics: Arc::new(NodeMetrics::new()),
        }
    }

    /// Open the configured state backend and connect to the Kubo daemon
    pub fn from_config(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let peer_id = config.resolve_peer_id()?;

        let state: Arc<dyn StateStore> = match config.state_backend {
            StateBackend::Rocksdb => {
                std::fs::create_dir_all(&config.data_dir)?;
                Arc::new(RocksStateStore::open(config.state_path(), peer_id)?)
            }
            StateBackend::Memory => Arc::new(MemoryStateStore::new(peer_id)),
        };
        let content = Arc::new(IpfsContentStore::new(
            config.ipfs_api.clone(),
            config.disk_path.clone(),
        )?);
        let transport = Arc::new(IpfsPubsub::new(config.ipfs_api.clone())?);

        Ok(Self::new(config, state, content, transport))
    }

    pub fn peer_id(&self) -> &str {
        self.state.local_peer_id()
    }

    pub fn state(&self) -> Arc<dyn StateStore> {
        self.state.clone()
    }

    pub fn metrics(&self) -> Arc<NodeMetrics> {
        self.metrics.clone()
    }

    /// Start every loop; they run until `shutdown` turns true
    pub async fn spawn(&self, shutdown: Shutdown) -> Result<NodeTasks> {
        let config = &self.config;
        let estimator = Arc::new(CapacityEstimator::new(
            self.content.clone(),
            config.storage_ceiling_gb,
        ));

        let ingestor = Ingestor::new(self.state.clone(), self.metrics.clone());
        let announcer = Announcer::new(
            self.state.clone(),
            self.content.clone(),
            self.transport.clone(),
            estimator.clone(),
            self.metrics.clone(),
            config.channel.clone(),
            config.announce_interval(),
        );
        let enforcer = Enforcer::new(
            self.state.clone(),
            self.content.clone(),
            estimator.clone(),
            backoff::from_config(config.pin_backoff),
            self.metrics.clone(),
            EnforcerSettings::from_config(config),
            config.enforce_interval(),
        );
        let detector = FailureDetector::new(
            self.state.clone(),
            self.metrics.clone(),
            config.peer_timeout_secs,
            config.content_ttl_secs,
            config.prune_interval(),
        );

        let mut handles: Vec<(&'static str, JoinHandle<Result<()>>)> = vec![
            (
                "ingestor",
                tokio::spawn(ingestor.run(
                    self.transport.clone(),
                    config.channel.clone(),
                    shutdown.clone(),
                )),
            ),
            ("announcer", tokio::spawn(announcer.run(shutdown.clone()))),
            ("enforcer", tokio::spawn(enforcer.run(shutdown.clone()))),
            ("detector", tokio::spawn(detector.run(shutdown.clone()))),
        ];

        let mut admin_addr = None;
        if let Some(addr) = config.admin_addr {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let bound = listener.local_addr()?;
            let router = create_router(AdminState {
                state: self.state.clone(),
                estimator,
                metrics: self.metrics.clone(),
                target_replication_factor: config.target_replication_factor,
            });
            let mut stop = shutdown.clone();
            handles.push((
                "admin",
                tokio::spawn(async move {
                    axum::serve(listener, router)
                        .with_graceful_shutdown(async move {
                            let _ = stop.wait_for(|stop| *stop).await;
                        })
                        .await?;
                    Ok::<(), Error>(())
                }),
            ));
            tracing::info!("  Admin API: http://{}", bound);
            admin_addr = Some(bound);
        }

        Ok(NodeTasks {
            handles,
            admin_addr,
        })
    }

    /// Run until Ctrl+C
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting tnet node: {}", self.peer_id());
        tracing::info!("  Channel: {}", self.config.channel);
        tracing::info!(
            "  Target replication factor: {}",
            self.config.target_replication_factor
        );
        tracing::info!("  Peer timeout: {}s", self.config.peer_timeout_secs);

        let (tx, rx) = watch::channel(false);
        let tasks = self.spawn(rx).await?;
        tracing::info!("✓ Node ready");

        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Could not listen for Ctrl+C: {}", e);
            }
        };
        tasks.run_until(ctrl_c, tx).await
    }
}

/// Handles of a running node's tasks
pub struct NodeTasks {
    handles: Vec<(&'static str, JoinHandle<Result<()>>)>,
    admin_addr: Option<SocketAddr>,
}

impl NodeTasks {
    /// Address the admin API actually bound to, if enabled
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    /// Run until `signal` resolves or any task exits, then signal shutdown
    /// through `stop` and wait for the rest. Returns the first failure.
    pub async fn run_until<F>(self, signal: F, stop: watch::Sender<bool>) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let NodeTasks {
            handles,
            admin_addr,
        } = self;
        if handles.is_empty() {
            signal.await;
            return Ok(());
        }
        let (mut names, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let mut running = select_all(handles);

        let (remaining, early) = tokio::select! {
            _ = signal => {
                tracing::info!("Shutdown requested");
                (None, Ok(()))
            }
            (result, index, rest) = &mut running => {
                // select_all swap-removes the finished handle
                let name = names.swap_remove(index);
                let result = task_result(name, result);
                match &result {
                    Ok(()) => tracing::warn!(task = name, "Task exited before shutdown"),
                    Err(e) => tracing::error!(task = name, "Task stopped, shutting down node: {}", e),
                }
                (Some(rest), result)
            }
        };
        let remaining = remaining.unwrap_or_else(|| running.into_inner());
        let _ = stop.send(true);

        let rest = NodeTasks {
            handles: names.into_iter().zip(remaining).collect(),
            admin_addr,
        }
        .join()
        .await;
        early.and(rest)
    }

    /// Wait for every task to finish, returning the first failure
    pub async fn join(self) -> Result<()> {
        let mut outcome = Ok(());
        for (name, handle) in self.handles {
            if let Err(e) = task_result(name, handle.await) {
                tracing::error!(task = name, "Task failed: {}", e);
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

fn task_result(name: &str, joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(Error::Internal(format!("{} task aborted: {}", name, e))),
    }
}
