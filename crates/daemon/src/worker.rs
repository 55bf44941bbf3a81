//! Worker process.
//!
//! Hosts the encode supervisor and the stream manager. Everything the worker
//! learns (parent pushes, encode completions, stream transitions) arrives as a
//! [`WorkerEvent`] on one channel and is handled in order by [`Worker::run`].

use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::encode::{EncodeCompletion, EncodeOutcome, EncodeProgram, EncodeSupervisor};
use crate::ipc::message::{EncodeFinishedPayload, WorkerStatusPayload};
use crate::ipc::{kind, IpcClient, IpcError, PushRouter};
use crate::process::ProcessPool;
use crate::stream::{StreamManager, StreamNumber, StreamObserver, StreamState};
use serde_json::Value;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const STREAM_REAP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum WorkerEvent {
    EncodeRequested(EncodeProgram),
    ReservationsChanged,
    EncodeCompleted(EncodeCompletion),
    StreamChanged(StreamNumber, StreamState),
}

/// Client-state-changed hook: fired after reservation changes, encode
/// completions and stream transitions.
pub type NotifyHook = Arc<dyn Fn() + Send + Sync>;

pub struct Worker {
    client: IpcClient,
    encoder: EncodeSupervisor,
    streams: StreamManager,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    on_notify: Option<NotifyHook>,
}

impl Worker {
    /// Attach to the parent over stdio.
    pub fn attach_stdio(config: &Config, plan: &ConcurrencyPlan) -> Result<Self, IpcError> {
        let timeout = Duration::from_millis(config.ipc.timeout_ms);
        Self::build(config, plan, |pushes| IpcClient::attach_stdio(timeout, pushes))
    }

    pub fn connect<R, W>(config: &Config, plan: &ConcurrencyPlan, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let timeout = Duration::from_millis(config.ipc.timeout_ms);
        let built = Self::build(config, plan, |pushes| {
            Ok::<_, Infallible>(IpcClient::connect(reader, writer, timeout, pushes))
        });
        match built {
            Ok(worker) => worker,
            Err(never) => match never {},
        }
    }

    fn build<F, E>(config: &Config, plan: &ConcurrencyPlan, connect: F) -> Result<Self, E>
    where
        F: FnOnce(PushRouter) -> Result<IpcClient, E>,
    {
        let (tx, events) = mpsc::unbounded_channel();

        let pushes = {
            let encode_tx = tx.clone();
            let notify_tx = tx.clone();
            PushRouter::new()
                .on(kind::SET_ENCODE_TO_CLIENT, move |value| {
                    match serde_json::from_value::<EncodeProgram>(value.unwrap_or(Value::Null)) {
                        Ok(program) => {
                            let _ = encode_tx.send(WorkerEvent::EncodeRequested(program));
                        }
                        Err(e) => warn!(error = %e, "malformed encode request"),
                    }
                })
                .on(kind::NOTIFY_CLIENT, move |_| {
                    let _ = notify_tx.send(WorkerEvent::ReservationsChanged);
                })
        };
        let client = connect(pushes)?;

        let completion_tx = tx.clone();
        let encoder = EncodeSupervisor::new(
            &config.encode,
            ProcessPool::new("encode", plan.max_encode_jobs as usize),
            Arc::new(move |completion| {
                let _ = completion_tx.send(WorkerEvent::EncodeCompleted(completion));
            }),
        );

        let observer: StreamObserver = Arc::new(move |number, state| {
            let _ = tx.send(WorkerEvent::StreamChanged(number, state));
        });
        let streams = StreamManager::new(
            &config.stream,
            config.encode.ffmpeg_path.clone(),
            ProcessPool::new("stream", plan.max_streams as usize),
            Arc::new(client.clone()),
            Some(observer),
        );

        Ok(Self {
            client,
            encoder,
            streams,
            events,
            on_notify: None,
        })
    }

    pub fn with_notify_hook(mut self, hook: NotifyHook) -> Self {
        self.on_notify = Some(hook);
        self
    }

    pub fn client(&self) -> &IpcClient {
        &self.client
    }

    pub fn encoder(&self) -> &EncodeSupervisor {
        &self.encoder
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Process events until `shutdown` resolves or the parent hangs up, then
    /// stop every stream and cancel every encode.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.report_status();
        info!("worker running");

        let mut reaper = tokio::time::interval(STREAM_REAP_INTERVAL);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("worker shutting down");
                    break;
                }
                _ = reaper.tick() => {
                    let reaped = self.streams.reap_idle().await;
                    if !reaped.is_empty() {
                        debug!(?reaped, "idle streams stopped");
                    }
                }
                _ = self.client.closed() => {
                    warn!("parent closed the ipc channel");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        self.streams.stop_all().await;
        self.encoder.cancel_all().await;
        info!("worker stopped");
    }

    fn handle(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::EncodeRequested(program) => {
                let recorded_id = program.recorded_id;
                let name = program.name.clone();
                match self.encoder.push(program) {
                    Ok(job) => debug!(%job, recorded_id, "encode admitted"),
                    Err(e) => {
                        warn!(recorded_id, error = %e, "encode rejected");
                        let payload = EncodeFinishedPayload {
                            recorded_id,
                            name,
                            outcome: EncodeOutcome::Failed {
                                reason: e.to_string(),
                            },
                        };
                        self.push(kind::ENCODE_FINISHED, &payload);
                    }
                }
                self.report_status();
            }
            WorkerEvent::ReservationsChanged => {
                debug!("reservations changed");
                self.notify();
            }
            WorkerEvent::EncodeCompleted(completion) => {
                self.report_status();
                self.notify();
                let client = self.client.clone();
                tokio::spawn(async move { hand_off_encode(client, completion).await });
            }
            WorkerEvent::StreamChanged(number, state) => {
                debug!(stream = number, %state, "stream state changed");
                self.report_status();
                self.notify();
            }
        }
    }

    fn notify(&self) {
        if let Some(hook) = &self.on_notify {
            hook();
        }
    }

    fn report_status(&self) {
        let stats = self.encoder.stats();
        let payload = WorkerStatusPayload {
            encode_queued: stats.queued,
            encode_running: stats.running,
            active_streams: self.streams.active_count(),
        };
        self.push(kind::WORKER_STATUS, &payload);
    }

    fn push<T: serde::Serialize>(&self, msg: &str, payload: &T) {
        if let Err(e) = self.client.push(msg, Some(payload)) {
            debug!(msg, error = %e, "push dropped");
        }
    }
}

/// Register a successful encode with the parent, then report the outcome.
/// An in-place job only has the parent refresh the recording's size.
async fn hand_off_encode(client: IpcClient, completion: EncodeCompletion) {
    let EncodeCompletion {
        job_id,
        program,
        outcome,
        ts_modify,
    } = completion;

    if let EncodeOutcome::Succeeded { output } = &outcome {
        if ts_modify {
            match client.update_ts_file_size(program.recorded_id).await {
                Ok(()) => info!(job = %job_id, recorded_id = program.recorded_id, "recording size refreshed"),
                Err(e) => warn!(job = %job_id, error = %e, "failed to refresh recording size"),
            }
        } else {
            match client
                .add_encode_file(program.recorded_id, program.name.clone(), output.clone(), program.del_ts)
                .await
            {
                Ok(encoded_id) => info!(job = %job_id, encoded_id, "encoded file registered"),
                Err(e) => warn!(job = %job_id, error = %e, "failed to register encoded file"),
            }
        }
    }

    let payload = EncodeFinishedPayload {
        recorded_id: program.recorded_id,
        name: program.name,
        outcome,
    };
    if let Err(e) = client.push(kind::ENCODE_FINISHED, Some(&payload)) {
        debug!(job = %job_id, error = %e, "encode result not delivered");
    }
}
