//! Encode queue and supervisor
//!
//! Jobs are admitted to a priority queue and started only while the encode
//! pool has a free slot. A running job is never preempted; a higher priority
//! only moves a job ahead of queued ones. Every job ends with exactly one
//! completion delivered to the registered callback.

use crate::model::RecordedId;
use crate::process::{self, build_command, CommandSpec, ProcessError, ProcessExit, ProcessHandle, ProcessPool};
use parking_lot::Mutex;
use recstation_config::{EncodeConfig, EncodePreset};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub type JobId = Uuid;

/// Error type for encode admission
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Encode preset {0} is not configured")]
    PresetNotConfigured(usize),

    #[error("Encode source not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("Failed to prepare output directory: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Encode request for a recorded item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeProgram {
    pub recorded_id: RecordedId,
    pub name: String,
    pub source: PathBuf,
    /// Index into the configured encode presets.
    pub mode: usize,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub del_ts: bool,
    #[serde(default)]
    pub priority: i32,
}

/// Terminal result of an encode job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EncodeOutcome {
    Succeeded { output: PathBuf },
    Failed { reason: String },
    Cancelled,
}

impl EncodeOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            EncodeOutcome::Succeeded { .. } => "succeeded",
            EncodeOutcome::Failed { .. } => "failed",
            EncodeOutcome::Cancelled => "cancelled",
        }
    }
}

/// Delivered once per job.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeCompletion {
    pub job_id: JobId,
    pub program: EncodeProgram,
    pub outcome: EncodeOutcome,
    /// The job rewrote its source recording instead of producing a new file.
    pub ts_modify: bool,
}

pub type CompletionCallback = Arc<dyn Fn(EncodeCompletion) + Send + Sync>;

/// A resolved encode job.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub id: JobId,
    pub program: EncodeProgram,
    pub output: PathBuf,
    pub command: CommandSpec,
    pub ts_modify: bool,
}

/// Job state for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeJobInfo {
    pub id: JobId,
    pub recorded_id: RecordedId,
    pub name: String,
    pub priority: i32,
    pub state: JobState,
}

/// Queue and outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

struct Queued {
    seq: u64,
    job: EncodeJob,
}

impl Queued {
    fn priority(&self) -> i32 {
        self.job.program.priority
    }
}

// Max-heap: higher priority first, then earlier admission.
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

struct Running {
    job: EncodeJob,
    handle: ProcessHandle,
    cancelled: bool,
}

#[derive(Default)]
struct QueueState {
    queue: BinaryHeap<Queued>,
    running: HashMap<JobId, Running>,
    next_seq: u64,
    stats: EncodeStats,
}

struct Inner {
    presets: Vec<EncodePreset>,
    ffmpeg_path: String,
    output_dir: PathBuf,
    pool: ProcessPool,
    state: Mutex<QueueState>,
    on_complete: CompletionCallback,
}

/// Priority-ordered encode supervisor.
#[derive(Clone)]
pub struct EncodeSupervisor {
    inner: Arc<Inner>,
}

impl EncodeSupervisor {
    pub fn new(cfg: &EncodeConfig, pool: ProcessPool, on_complete: CompletionCallback) -> Self {
        Self {
            inner: Arc::new(Inner {
                presets: cfg.presets.clone(),
                ffmpeg_path: cfg.ffmpeg_path.clone(),
                output_dir: cfg.output_dir.clone(),
                pool,
                state: Mutex::new(QueueState::default()),
                on_complete,
            }),
        }
    }

    /// Admit a job. Returns immediately; the outcome arrives through the
    /// completion callback. Errors here leave the queue untouched and are
    /// never also reported through the callback.
    pub fn push(&self, program: EncodeProgram) -> Result<JobId, EncodeError> {
        let job = self.inner.prepare(program)?;
        let id = job.id;

        {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            info!(job = %id, recorded_id = job.program.recorded_id, priority = job.program.priority, "encode queued");
            state.queue.push(Queued { seq, job });
        }

        let mut result = Ok(id);
        for (job, err) in self.inner.dispatch() {
            if job.id == id {
                warn!(job = %id, error = %err, "encode failed to start");
                result = Err(EncodeError::Process(err));
            } else {
                let reason = err.to_string();
                self.inner.complete(job, EncodeOutcome::Failed { reason }, false);
            }
        }
        result
    }

    /// Cancel a queued or running job. Returns false for unknown or finished jobs.
    pub async fn cancel(&self, id: JobId) -> bool {
        let handle = {
            let mut state = self.inner.state.lock();

            let mut removed = None;
            let queue = std::mem::take(&mut state.queue);
            state.queue = queue
                .into_iter()
                .filter_map(|q| {
                    if q.job.id == id {
                        removed = Some(q.job);
                        None
                    } else {
                        Some(q)
                    }
                })
                .collect();

            if let Some(job) = removed {
                drop(state);
                self.inner.complete(job, EncodeOutcome::Cancelled, false);
                return true;
            }

            match state.running.get_mut(&id) {
                Some(running) => {
                    running.cancelled = true;
                    running.handle.clone()
                }
                None => return false,
            }
        };

        handle.kill().await;
        true
    }

    /// Cancel everything, queued jobs first.
    pub async fn cancel_all(&self) {
        let ids: Vec<JobId> = {
            let state = self.inner.state.lock();
            state
                .queue
                .iter()
                .map(|q| q.job.id)
                .chain(state.running.keys().copied())
                .collect()
        };
        for id in ids {
            self.cancel(id).await;
        }
    }

    pub fn jobs(&self) -> Vec<EncodeJobInfo> {
        let state = self.inner.state.lock();
        let info = |job: &EncodeJob, state: JobState| EncodeJobInfo {
            id: job.id,
            recorded_id: job.program.recorded_id,
            name: job.program.name.clone(),
            priority: job.program.priority,
            state,
        };

        let mut queued: Vec<&Queued> = state.queue.iter().collect();
        queued.sort_by(|a, b| b.cmp(a));

        state
            .running
            .values()
            .map(|r| info(&r.job, JobState::Running))
            .chain(queued.into_iter().map(|q| info(&q.job, JobState::Queued)))
            .collect()
    }

    pub fn stats(&self) -> EncodeStats {
        let state = self.inner.state.lock();
        EncodeStats {
            queued: state.queue.len(),
            running: state.running.len(),
            ..state.stats.clone()
        }
    }
}

impl Inner {
    fn prepare(&self, program: EncodeProgram) -> Result<EncodeJob, EncodeError> {
        let preset = self
            .presets
            .get(program.mode)
            .ok_or(EncodeError::PresetNotConfigured(program.mode))?;

        if !program.source.is_file() {
            return Err(EncodeError::SourceNotFound(program.source.clone()));
        }

        let output = if preset.ts_modify {
            program.source.clone()
        } else {
            let dir = match &program.directory {
                Some(sub) if !sub.is_empty() => self.output_dir.join(sub),
                _ => self.output_dir.clone(),
            };
            std::fs::create_dir_all(&dir)?;
            unique_output_path(&dir, &program.source, &preset.suffix)
        };

        let input = program.source.to_string_lossy();
        let output_str = output.to_string_lossy();
        let command = build_command(
            &preset.command,
            &[
                ("%FFMPEG%", self.ffmpeg_path.as_str()),
                ("%INPUT%", input.as_ref()),
                ("%OUTPUT%", output_str.as_ref()),
            ],
        )?;

        Ok(EncodeJob {
            id: Uuid::new_v4(),
            program,
            output,
            command,
            ts_modify: preset.ts_modify,
        })
    }

    /// Start queued jobs while slots are free. Returns jobs whose spawn failed.
    fn dispatch(self: &Arc<Self>) -> Vec<(EncodeJob, ProcessError)> {
        let mut failures = Vec::new();
        let mut started = Vec::new();

        {
            let mut state = self.state.lock();
            while self.pool.available() > 0 {
                let Some(Queued { job, .. }) = state.queue.pop() else {
                    break;
                };

                match process::spawn(&self.pool, &job.command, format!("encode {}", job.id)) {
                    Ok(handle) => {
                        info!(job = %job.id, output = %job.output.display(), "encode started");
                        started.push((job.id, handle.clone()));
                        state.running.insert(
                            job.id,
                            Running {
                                job,
                                handle,
                                cancelled: false,
                            },
                        );
                    }
                    Err(e) => failures.push((job, e)),
                }
            }
        }

        for (id, handle) in started {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let exit = handle.wait().await;
                inner.finish(id, exit);
            });
        }

        failures
    }

    fn finish(self: &Arc<Self>, id: JobId, exit: ProcessExit) {
        let Some(running) = self.state.lock().running.remove(&id) else {
            return;
        };

        let outcome = if running.cancelled {
            EncodeOutcome::Cancelled
        } else if exit.is_success() {
            EncodeOutcome::Succeeded {
                output: running.job.output.clone(),
            }
        } else {
            EncodeOutcome::Failed {
                reason: exit.describe(),
            }
        };
        self.complete(running.job, outcome, true);

        for (job, err) in self.dispatch() {
            let reason = err.to_string();
            self.complete(job, EncodeOutcome::Failed { reason }, false);
        }
    }

    /// Clean up and report a job that reached its terminal state.
    fn complete(&self, job: EncodeJob, outcome: EncodeOutcome, started: bool) {
        if started {
            cleanup(&job, &outcome);
        }

        {
            let mut state = self.state.lock();
            match &outcome {
                EncodeOutcome::Succeeded { .. } => state.stats.succeeded += 1,
                EncodeOutcome::Failed { .. } => state.stats.failed += 1,
                EncodeOutcome::Cancelled => state.stats.cancelled += 1,
            }
        }

        match &outcome {
            EncodeOutcome::Succeeded { output } => {
                info!(job = %job.id, output = %output.display(), "encode succeeded")
            }
            EncodeOutcome::Failed { reason } => warn!(job = %job.id, reason = %reason, "encode failed"),
            EncodeOutcome::Cancelled => info!(job = %job.id, "encode cancelled"),
        }

        (self.on_complete)(EncodeCompletion {
            job_id: job.id,
            program: job.program,
            outcome,
            ts_modify: job.ts_modify,
        });
    }
}

/// Remove partial output of a job that did not succeed. In-place jobs write
/// to the recording itself, which is never removed here.
fn cleanup(job: &EncodeJob, outcome: &EncodeOutcome) {
    if job.ts_modify || matches!(outcome, EncodeOutcome::Succeeded { .. }) {
        return;
    }
    if job.output.exists() {
        if let Err(e) = std::fs::remove_file(&job.output) {
            warn!(job = %job.id, path = %job.output.display(), error = %e, "failed to remove partial output");
        }
    }
}

/// `dir/<stem><suffix>`, or `dir/<stem>(n)<suffix>` when taken.
fn unique_output_path(dir: &Path, source: &Path, suffix: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "encoded".to_string());

    let mut candidate = dir.join(format!("{}{}", stem, suffix));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}({}){}", stem, n, suffix));
        n += 1;
    }
    candidate
}
