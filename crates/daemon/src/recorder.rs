//! Recording driver.
//!
//! Runs on the parent. Each tick starts captures for reservations whose window
//! opened, finishes the ones whose window closed, reports captures that died
//! early, and drops reservations that expired without a tuner.

use crate::encode::EncodeProgram;
use crate::model::{ProgramId, Reservation};
use crate::process::{self, build_command, ProcessError, ProcessHandle, ProcessPool};
use crate::scheduler::{RecordingHandoff, ReservationManager};
use crate::store::Store;
use parking_lot::Mutex;
use recstation_config::RecordingConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for starting a capture
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Failed to prepare recording directory: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

struct Capture {
    name: String,
    path: Option<PathBuf>,
    handle: Option<ProcessHandle>,
}

pub struct Recorder {
    manager: Arc<ReservationManager>,
    store: Arc<dyn Store>,
    pool: ProcessPool,
    record_dir: PathBuf,
    command: Option<String>,
    captures: Mutex<HashMap<ProgramId, Capture>>,
}

impl Recorder {
    pub fn new(
        cfg: &RecordingConfig,
        manager: Arc<ReservationManager>,
        store: Arc<dyn Store>,
    ) -> Self {
        if cfg.command.is_none() {
            warn!("no recording command configured; reservations run without capture");
        }
        let pool = ProcessPool::new("record", manager.tuners().len().max(1));

        Self {
            manager,
            store,
            pool,
            record_dir: cfg.record_dir.clone(),
            command: cfg.command.clone(),
            captures: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.captures.lock().len()
    }

    /// Fail recordings left over from a previous run; nothing captures them any more.
    pub async fn recover_interrupted(&self) {
        let reservations = match self.store.list_reservations() {
            Ok(reservations) => reservations,
            Err(e) => {
                warn!(error = %e, "could not list reservations for recovery");
                return;
            }
        };

        for reservation in reservations {
            if reservation.status != crate::model::ReservationStatus::Recording {
                continue;
            }
            if self.captures.lock().contains_key(&reservation.program_id) {
                continue;
            }
            if let Err(e) = self
                .manager
                .fail_recording(reservation.program_id, "interrupted by restart")
                .await
            {
                warn!(program_id = reservation.program_id, error = %e, "recovery failed");
            }
        }
    }

    /// Advance every reservation to `now_ms`. Returns encodes to hand to the worker.
    pub async fn tick(&self, now_ms: i64) -> Vec<EncodeProgram> {
        let due = self.manager.due(now_ms).await;
        let mut encodes = Vec::new();

        for reservation in &due.to_start {
            self.start(reservation).await;
        }

        self.reap_failed().await;
        self.reap_orphaned().await;

        for reservation in &due.to_finish {
            if let Some(program) = self.finish(reservation.program_id).await {
                encodes.push(program);
            }
        }

        if let Err(e) = self.manager.drop_expired(&due.expired).await {
            warn!(error = %e, "failed to drop expired reservations");
        }

        encodes
    }

    /// Kill every capture and finish its recording with what was written so far.
    pub async fn stop_all(&self) -> Vec<EncodeProgram> {
        let ids: Vec<ProgramId> = self.captures.lock().keys().copied().collect();
        let mut encodes = Vec::new();
        for id in ids {
            if let Some(program) = self.finish(id).await {
                encodes.push(program);
            }
        }
        encodes
    }

    async fn start(&self, reservation: &Reservation) {
        let program_id = reservation.program_id;
        if let Err(e) = self.manager.begin_recording(program_id).await {
            warn!(program_id, error = %e, "could not begin recording");
            return;
        }

        let name = match self.store.find_program_by_id(program_id) {
            Ok(Some(program)) if !program.name.is_empty() => program.name,
            _ => format!("program {}", program_id),
        };

        let capture = match &self.command {
            Some(template) => match self.spawn_capture(template, reservation, &name).await {
                Ok(capture) => capture,
                Err(err) => {
                    let reason = err.to_string();
                    if let Err(e) = self.manager.fail_recording(program_id, &reason).await {
                        warn!(program_id, error = %e, "could not fail recording");
                    }
                    return;
                }
            },
            None => Capture {
                name,
                path: None,
                handle: None,
            },
        };

        info!(program_id, tuner = ?reservation.tuner_id, "recording started");
        self.captures.lock().insert(program_id, capture);
    }

    async fn spawn_capture(
        &self,
        template: &str,
        reservation: &Reservation,
        name: &str,
    ) -> Result<Capture, RecordError> {
        tokio::fs::create_dir_all(&self.record_dir).await?;
        let path = self.record_dir.join(record_file_name(reservation.program_id, name));

        let program = reservation.program_id.to_string();
        let channel = reservation.channel_id.to_string();
        let output = path.to_string_lossy();
        let spec = build_command(
            template,
            &[
                ("%PROGRAM%", program.as_str()),
                ("%CHANNEL%", channel.as_str()),
                ("%OUTPUT%", output.as_ref()),
            ],
        )?;

        let handle = process::spawn(&self.pool, &spec, format!("record {}", reservation.program_id))?;

        Ok(Capture {
            name: name.to_string(),
            path: Some(path),
            handle: Some(handle),
        })
    }

    /// Report captures that exited with an error before their window closed.
    async fn reap_failed(&self) {
        let failed: Vec<(ProgramId, String)> = {
            let mut captures = self.captures.lock();
            let ids: Vec<(ProgramId, String)> = captures
                .iter()
                .filter_map(|(id, capture)| {
                    let exit = capture.handle.as_ref()?.try_exit()?;
                    (!exit.is_success()).then(|| (*id, exit.describe()))
                })
                .collect();
            for (id, _) in &ids {
                captures.remove(id);
            }
            ids
        };

        for (program_id, reason) in failed {
            if let Err(e) = self.manager.fail_recording(program_id, &reason).await {
                warn!(program_id, error = %e, "could not fail recording");
            }
        }
    }

    /// Kill captures whose reservation was dropped underneath them.
    async fn reap_orphaned(&self) {
        let ids: Vec<ProgramId> = self.captures.lock().keys().copied().collect();
        for program_id in ids {
            if self.manager.find(program_id).await.is_some() {
                continue;
            }
            let capture = self.captures.lock().remove(&program_id);
            if let Some(handle) = capture.and_then(|c| c.handle) {
                handle.kill().await;
            }
            warn!(program_id, "capture stopped; its reservation is gone");
        }
    }

    async fn finish(&self, program_id: ProgramId) -> Option<EncodeProgram> {
        let capture = self.captures.lock().remove(&program_id);
        let (name, path) = match capture {
            Some(capture) => {
                if let Some(handle) = &capture.handle {
                    handle.kill().await;
                }
                (capture.name, capture.path)
            }
            None => (format!("program {}", program_id), None),
        };

        match self.manager.finish_recording(program_id, name, path).await {
            Ok(handoff) => encode_for(&handoff, self.store.as_ref()),
            Err(e) => {
                warn!(program_id, error = %e, "could not finish recording");
                None
            }
        }
    }
}

/// Encode request for a finished recording, if one was asked for.
fn encode_for(handoff: &RecordingHandoff, store: &dyn Store) -> Option<EncodeProgram> {
    let option = handoff.reservation.encode.as_ref()?;
    let recorded = store.find_recorded_by_id(handoff.recorded_id).ok()??;
    let source = recorded.rec_path?;

    Some(EncodeProgram {
        recorded_id: recorded.id,
        name: recorded.name,
        source,
        mode: option.mode,
        directory: option.directory.clone(),
        del_ts: option.del_ts,
        priority: 0,
    })
}

fn record_file_name(program_id: ProgramId, name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    format!("{}_{}.ts", program_id, cleaned)
}
