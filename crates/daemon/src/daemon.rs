//! Daemon startup and main loop for recstation
//!
//! The parent process owns the reservation set, the store and the recorder,
//! and answers the worker's requests over the control channel. The worker is
//! the same executable started with the `worker` subcommand.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::control::ControlHandler;
use crate::encode::{EncodeOutcome, EncodeProgram};
use crate::ipc::message::{EncodeFinishedPayload, WorkerStatusPayload};
use crate::ipc::{kind, IpcError, IpcServer, PushRouter, IPC_CHANNEL_ENV};
use crate::metrics::{new_shared_status, ReservationCounts, SharedStatus};
use crate::metrics_server::run_metrics_server;
use crate::model::{current_timestamp_ms, Tuner};
use crate::recorder::Recorder;
use crate::scheduler::{ReserveError, ReservationManager};
use crate::store::{MemoryStore, Store, StoreError};
use crate::worker::Worker;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WORKER_STOP_GRACE: Duration = Duration::from_secs(10);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage error
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Reservation error
    #[error("Reservation error: {0}")]
    Reserve(#[from] ReserveError),

    /// IPC error
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// Worker process error
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Path the configuration was loaded from; handed to the worker
    pub config_path: PathBuf,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    store: Arc<dyn Store>,
    manager: Arc<ReservationManager>,
    recorder: Recorder,
    status: SharedStatus,
    worker_link: Arc<OnceLock<IpcServer>>,
}

impl Daemon {
    /// Load configuration, open the store and rebuild the schedule.
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path.as_ref())?;
        Self::with_config_path(config, config_path.as_ref().to_path_buf()).await
    }

    /// Initialize with an already loaded configuration; `config_path` is passed on to the worker.
    pub async fn with_config_path(config: Config, config_path: PathBuf) -> Result<Self, DaemonError> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::open(&config.storage.state_file)?);
        Self::with_store(config, config_path, store).await
    }

    /// Initialize the daemon with an existing configuration and store.
    pub async fn with_store(
        config: Config,
        config_path: PathBuf,
        store: Arc<dyn Store>,
    ) -> Result<Self, DaemonError> {
        let concurrency_plan = derive_plan(&config);
        let tuners: Vec<Tuner> = config.tuners.iter().map(Tuner::from).collect();
        if tuners.is_empty() {
            warn!("no tuners configured; every reservation will conflict");
        }

        let worker_link: Arc<OnceLock<IpcServer>> = Arc::new(OnceLock::new());
        let link = worker_link.clone();
        let manager = Arc::new(
            ReservationManager::new(store.clone(), tuners).with_notifier(Arc::new(move || {
                if let Some(server) = link.get() {
                    if let Err(e) = server.push::<()>(kind::NOTIFY_CLIENT, None) {
                        debug!(error = %e, "notify not delivered");
                    }
                }
            })),
        );
        manager.resync().await?;

        let recorder = Recorder::new(&config.recording, manager.clone(), store.clone());
        recorder.recover_interrupted().await;

        Ok(Self {
            config,
            config_path,
            concurrency_plan,
            store,
            manager,
            recorder,
            status: new_shared_status(),
            worker_link,
        })
    }

    pub fn manager(&self) -> &Arc<ReservationManager> {
        &self.manager
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Serve the control channel over the given pipe. The returned task ends
    /// when the worker hangs up.
    pub fn attach_worker<R, W>(&self, reader: R, writer: W) -> Result<JoinHandle<()>, DaemonError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::new(ControlHandler::new(self.manager.clone(), self.store.clone()));
        let (server, task) = IpcServer::serve(reader, writer, handler, self.worker_pushes());
        self.worker_link
            .set(server)
            .map_err(|_| DaemonError::Worker("a worker is already attached".to_string()))?;
        Ok(task)
    }

    fn worker_pushes(&self) -> PushRouter {
        let finished_status = self.status.clone();
        let worker_status = self.status.clone();

        PushRouter::new()
            .on(kind::ENCODE_FINISHED, move |value| {
                let Some(payload) = parse_push::<EncodeFinishedPayload>(kind::ENCODE_FINISHED, value) else {
                    return;
                };
                match &payload.outcome {
                    EncodeOutcome::Failed { reason } => {
                        warn!(recorded_id = payload.recorded_id, name = %payload.name, %reason, "encode failed")
                    }
                    outcome => {
                        info!(recorded_id = payload.recorded_id, name = %payload.name, outcome = outcome.as_str(), "encode finished")
                    }
                }
                let status = finished_status.clone();
                tokio::spawn(async move {
                    let mut snapshot = status.write().await;
                    match payload.outcome {
                        EncodeOutcome::Succeeded { .. } => snapshot.encode.succeeded += 1,
                        EncodeOutcome::Failed { .. } => snapshot.encode.failed += 1,
                        EncodeOutcome::Cancelled => snapshot.encode.cancelled += 1,
                    }
                });
            })
            .on(kind::WORKER_STATUS, move |value| {
                let Some(payload) = parse_push::<WorkerStatusPayload>(kind::WORKER_STATUS, value) else {
                    return;
                };
                let status = worker_status.clone();
                tokio::spawn(async move {
                    let mut snapshot = status.write().await;
                    snapshot.worker_running = true;
                    snapshot.encode.queued = payload.encode_queued;
                    snapshot.encode.running = payload.encode_running;
                    snapshot.active_streams = payload.active_streams;
                });
            })
    }

    /// One recorder pass: start and finish captures, hand encodes to the
    /// worker, refresh the status snapshot.
    pub async fn tick(&self, now_ms: i64) {
        let encodes = self.recorder.tick(now_ms).await;
        self.dispatch_encodes(encodes);
        self.refresh_status(now_ms).await;
    }

    fn dispatch_encodes(&self, encodes: Vec<EncodeProgram>) {
        for program in encodes {
            match self.worker_link.get() {
                Some(server) => {
                    if let Err(e) = server.push(kind::SET_ENCODE_TO_CLIENT, Some(&program)) {
                        warn!(recorded_id = program.recorded_id, error = %e, "encode request not delivered");
                    }
                }
                None => warn!(recorded_id = program.recorded_id, "no worker attached; encode dropped"),
            }
        }
    }

    async fn refresh_status(&self, now_ms: i64) {
        let reservations = match self.store.list_reservations() {
            Ok(reservations) => ReservationCounts::tally(&reservations),
            Err(e) => {
                warn!(error = %e, "could not read reservations for status");
                return;
            }
        };

        let mut snapshot = self.status.write().await;
        snapshot.timestamp_unix_ms = now_ms;
        snapshot.reservations = reservations;
        snapshot.active_recordings = self.recorder.active_count();
    }

    fn spawn_worker(&self) -> Result<Child, DaemonError> {
        let exe = std::env::current_exe()
            .map_err(|e| DaemonError::Worker(format!("cannot locate executable: {}", e)))?;

        Command::new(exe)
            .arg("worker")
            .arg("--config")
            .arg(&self.config_path)
            .env(IPC_CHANNEL_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaemonError::Worker(format!("failed to spawn worker: {}", e)))
    }

    /// Start the status server as a background task.
    pub fn start_metrics_server(&self) -> Option<JoinHandle<()>> {
        if !self.config.metrics.enabled {
            return None;
        }
        let status = self.status.clone();
        let listen = self.config.metrics.listen.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(status, &listen).await {
                error!(error = %e, "metrics server error");
            }
        }))
    }

    /// Run until ctrl-c or until the worker exits.
    pub async fn run(self) -> Result<(), DaemonError> {
        let mut child = self.spawn_worker()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DaemonError::Worker("worker stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DaemonError::Worker("worker stdout not piped".to_string()))?;
        info!(pid = child.id(), "worker started");

        let _channel = self.attach_worker(stdout, stdin)?;
        let _metrics = self.start_metrics_server();

        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.scheduler.tick_interval_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(current_timestamp_ms()).await,
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("worker exited: {}", status),
                        Err(e) => format!("worker wait failed: {}", e),
                    };
                    error!(%reason, "worker lost");
                    break Err(DaemonError::Worker(reason));
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break Ok(());
                }
            }
        };

        let encodes = self.recorder.stop_all().await;
        self.dispatch_encodes(encodes);
        self.status.write().await.worker_running = false;

        if result.is_ok() {
            match tokio::time::timeout(WORKER_STOP_GRACE, child.wait()).await {
                Ok(_) => info!("worker stopped"),
                Err(_) => {
                    warn!("worker did not stop in time; killing it");
                    let _ = child.kill().await;
                }
            }
        }

        result
    }
}

/// Worker entry point: attach to the parent over stdio and run until the
/// parent hangs up or ctrl-c arrives.
pub async fn run_worker(config: Config) -> Result<(), DaemonError> {
    let plan = derive_plan(&config);
    info!(
        max_encode_jobs = plan.max_encode_jobs,
        max_streams = plan.max_streams,
        "worker starting"
    );

    let worker = Worker::attach_stdio(&config, &plan)?;
    worker
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}

fn parse_push<T: DeserializeOwned>(msg: &str, value: Option<Value>) -> Option<T> {
    match serde_json::from_value(value.unwrap_or(Value::Null)) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(msg, error = %e, "malformed push");
            None
        }
    }
}
