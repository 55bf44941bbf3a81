//! HLS stream sessions.
//!
//! A stream moves through `created -> starting -> active -> stopping -> stopped`,
//! or ends in `error` when it cannot start or its process dies. Each stream owns
//! the `stream{N}*` files in the stream directory: they are purged before the
//! process is spawned and again after it is dead.
//!
//! Stream numbers are reused, so every registration also gets a generation.
//! Work started for one session never touches a later session on the same
//! number. With a session timeout configured, streams nobody accessed for that
//! long are stopped by [`StreamManager::reap_idle`].

use crate::model::{ChannelId, EncodedId, EncodedItem, RecordedId, RecordedItem};
use crate::process::{self, build_command, ProcessError, ProcessHandle, ProcessPool};
use crate::store::{Store, StoreError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use recstation_config::{StreamConfig, StreamMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub type StreamNumber = u32;

/// Error type for stream operations
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Recorded item {0} is not found")]
    RecordedNotFound(RecordedId),

    #[error("Encoded item {0} is not found")]
    EncodedNotFound(EncodedId),

    #[error("Stream source file is not found: {0}")]
    FileNotFound(String),

    #[error("Stream mode {0} is not configured")]
    ModeNotConfigured(usize),

    #[error("Live source is not configured")]
    LiveSourceNotConfigured,

    #[error("Stream limit reached ({0} running)")]
    LimitReached(usize),

    #[error("Stream {0} is not found")]
    NotFound(StreamNumber),

    #[error("Source lookup failed: {0}")]
    Lookup(String),

    #[error("Stream directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Spawn(#[from] ProcessError),
}

/// Resolves recorded and encoded items to files.
pub trait SourceLookup: Send + Sync {
    fn recorded(&self, id: RecordedId) -> BoxFuture<'_, Result<Option<RecordedItem>, StreamError>>;

    fn encoded(&self, id: EncodedId) -> BoxFuture<'_, Result<Option<EncodedItem>, StreamError>>;
}

/// Lookup backed directly by a store.
pub struct StoreLookup(pub Arc<dyn Store>);

fn lookup_error(e: StoreError) -> StreamError {
    StreamError::Lookup(e.to_string())
}

impl SourceLookup for StoreLookup {
    fn recorded(&self, id: RecordedId) -> BoxFuture<'_, Result<Option<RecordedItem>, StreamError>> {
        Box::pin(async move { self.0.find_recorded_by_id(id).map_err(lookup_error) })
    }

    fn encoded(&self, id: EncodedId) -> BoxFuture<'_, Result<Option<EncodedItem>, StreamError>> {
        Box::pin(async move { self.0.find_encoded_by_id(id).map_err(lookup_error) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Created,
    Starting,
    Active,
    Stopping,
    Stopped,
    Error,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Error)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamState::Created => "created",
            StreamState::Starting => "starting",
            StreamState::Active => "active",
            StreamState::Stopping => "stopping",
            StreamState::Stopped => "stopped",
            StreamState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a stream plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum StreamSource {
    #[serde(rename_all = "camelCase")]
    RecordedHls {
        recorded_id: RecordedId,
        #[serde(default)]
        encoded_id: Option<EncodedId>,
    },
    #[serde(rename_all = "camelCase")]
    LiveHls { channel_id: ChannelId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub stream_number: StreamNumber,
    pub source: StreamSource,
    pub mode: usize,
    pub state: StreamState,
}

/// Called on every state transition. Must not call back into the manager.
pub type StreamObserver = Arc<dyn Fn(StreamNumber, StreamState) + Send + Sync>;

struct Session {
    generation: u64,
    source: StreamSource,
    mode: usize,
    state: StreamState,
    handle: Option<ProcessHandle>,
    last_access: Instant,
}

/// One registration of a stream number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    number: StreamNumber,
    generation: u64,
}

struct Inner {
    stream_dir: PathBuf,
    ffmpeg_path: String,
    live_source: Option<String>,
    recorded_hls: Vec<StreamMode>,
    live_hls: Vec<StreamMode>,
    pool: ProcessPool,
    lookup: Arc<dyn SourceLookup>,
    sessions: Mutex<BTreeMap<StreamNumber, Session>>,
    next_generation: AtomicU64,
    session_timeout: Option<Duration>,
    observer: Option<StreamObserver>,
}

/// Owner of every stream session.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl StreamManager {
    pub fn new(
        cfg: &StreamConfig,
        ffmpeg_path: impl Into<String>,
        pool: ProcessPool,
        lookup: Arc<dyn SourceLookup>,
        observer: Option<StreamObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stream_dir: cfg.stream_dir.clone(),
                ffmpeg_path: ffmpeg_path.into(),
                live_source: cfg.live_source.clone(),
                recorded_hls: cfg.recorded_hls.clone(),
                live_hls: cfg.live_hls.clone(),
                pool,
                lookup,
                sessions: Mutex::new(BTreeMap::new()),
                next_generation: AtomicU64::new(0),
                session_timeout: (cfg.session_timeout_secs > 0)
                    .then(|| Duration::from_secs(cfg.session_timeout_secs)),
                observer,
            }),
        }
    }

    pub fn stream_dir(&self) -> &Path {
        &self.inner.stream_dir
    }

    /// Start a stream and return its number.
    pub async fn start(&self, source: StreamSource, mode: usize) -> Result<StreamNumber, StreamError> {
        let slot = self.inner.register(source, mode)?;
        let number = slot.number;
        self.inner.transition(slot, StreamState::Starting);

        match self.inner.launch(slot, source, mode).await {
            Ok(handle) => {
                let promoted = {
                    let mut sessions = self.inner.sessions.lock();
                    match sessions.get_mut(&number) {
                        Some(session)
                            if session.generation == slot.generation
                                && session.state == StreamState::Starting =>
                        {
                            session.handle = Some(handle.clone());
                            true
                        }
                        _ => false,
                    }
                };

                if !promoted {
                    // Stopped while starting; the number may already serve a newer stream.
                    handle.kill().await;
                    self.inner.purge_if_free(number);
                    return Err(StreamError::NotFound(number));
                }

                self.inner.transition(slot, StreamState::Active);
                info!(stream = number, ?source, mode, "stream started");
                self.inner.watch(slot, handle);
                Ok(number)
            }
            Err(e) => {
                warn!(stream = number, error = %e, "stream failed to start");
                self.inner.abort_start(slot);
                Err(e)
            }
        }
    }

    /// Stop a stream. Kills its process and purges its files.
    pub async fn stop(&self, number: StreamNumber) -> Result<(), StreamError> {
        let slot = self
            .inner
            .current(number)
            .ok_or(StreamError::NotFound(number))?;
        self.inner.shutdown(slot, StreamState::Stopped).await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        let slots: Vec<Slot> = self
            .inner
            .sessions
            .lock()
            .iter()
            .map(|(number, s)| Slot {
                number: *number,
                generation: s.generation,
            })
            .collect();
        for slot in slots {
            self.inner.shutdown(slot, StreamState::Stopped).await;
        }
    }

    /// Record a client access, keeping the stream from timing out.
    pub fn touch(&self, number: StreamNumber) -> Result<(), StreamError> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(&number)
            .ok_or(StreamError::NotFound(number))?;
        session.last_access = Instant::now();
        Ok(())
    }

    /// Stop active streams that were not accessed within the session timeout.
    /// Returns the numbers that were stopped.
    pub async fn reap_idle(&self) -> Vec<StreamNumber> {
        let Some(timeout) = self.inner.session_timeout else {
            return Vec::new();
        };

        let now = Instant::now();
        let idle: Vec<Slot> = self
            .inner
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| {
                s.state == StreamState::Active && now.duration_since(s.last_access) >= timeout
            })
            .map(|(number, s)| Slot {
                number: *number,
                generation: s.generation,
            })
            .collect();

        for slot in &idle {
            info!(stream = slot.number, timeout_secs = timeout.as_secs(), "stream session timed out");
            self.inner.shutdown(*slot, StreamState::Stopped).await;
        }
        idle.into_iter().map(|slot| slot.number).collect()
    }

    pub fn infos(&self) -> Vec<StreamInfo> {
        self.inner
            .sessions
            .lock()
            .iter()
            .map(|(number, s)| StreamInfo {
                stream_number: *number,
                source: s.source,
                mode: s.mode,
                state: s.state,
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }
}

impl Inner {
    fn max_streams(&self) -> usize {
        self.pool.limit()
    }

    /// Take the lowest free stream number.
    fn register(&self, source: StreamSource, mode: usize) -> Result<Slot, StreamError> {
        let slot = {
            let mut sessions = self.sessions.lock();
            let max = self.max_streams();
            let number = (0..max as StreamNumber)
                .find(|n| !sessions.contains_key(n))
                .ok_or(StreamError::LimitReached(max))?;
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

            sessions.insert(
                number,
                Session {
                    generation,
                    source,
                    mode,
                    state: StreamState::Created,
                    handle: None,
                    last_access: Instant::now(),
                },
            );
            Slot { number, generation }
        };

        self.notify(slot.number, StreamState::Created);
        Ok(slot)
    }

    fn current(&self, number: StreamNumber) -> Option<Slot> {
        self.sessions.lock().get(&number).map(|s| Slot {
            number,
            generation: s.generation,
        })
    }

    fn is_current(&self, slot: Slot) -> bool {
        self.current(slot.number) == Some(slot)
    }

    fn transition(&self, slot: Slot, to: StreamState) {
        let number = slot.number;
        let changed = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&number) {
                Some(session) if session.generation == slot.generation && session.state != to => {
                    debug!(stream = number, from = %session.state, to = %to, "stream transition");
                    session.state = to;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify(number, to);
        }
    }

    fn notify(&self, number: StreamNumber, state: StreamState) {
        if let Some(observer) = &self.observer {
            observer(number, state);
        }
    }

    async fn resolve_input(&self, source: StreamSource) -> Result<String, StreamError> {
        match source {
            StreamSource::RecordedHls {
                recorded_id,
                encoded_id,
            } => {
                let recorded = self
                    .lookup
                    .recorded(recorded_id)
                    .await?
                    .ok_or(StreamError::RecordedNotFound(recorded_id))?;

                let path = match encoded_id {
                    Some(id) => {
                        let encoded = self
                            .lookup
                            .encoded(id)
                            .await?
                            .ok_or(StreamError::EncodedNotFound(id))?;
                        encoded.path
                    }
                    None => recorded.rec_path.ok_or_else(|| {
                        StreamError::FileNotFound(format!("recorded item {}", recorded_id))
                    })?,
                };

                if !path.is_file() {
                    return Err(StreamError::FileNotFound(path.display().to_string()));
                }
                Ok(path.to_string_lossy().into_owned())
            }
            StreamSource::LiveHls { channel_id } => {
                let template = self
                    .live_source
                    .as_ref()
                    .ok_or(StreamError::LiveSourceNotConfigured)?;
                Ok(template.replace("%CHANNEL%", &channel_id.to_string()))
            }
        }
    }

    fn mode_template(&self, source: StreamSource, mode: usize) -> Result<&str, StreamError> {
        let modes = match source {
            StreamSource::RecordedHls { .. } => &self.recorded_hls,
            StreamSource::LiveHls { .. } => &self.live_hls,
        };
        modes
            .get(mode)
            .map(|m| m.command.as_str())
            .ok_or(StreamError::ModeNotConfigured(mode))
    }

    /// Resolve the source, purge stale files and spawn the stream process.
    async fn launch(
        &self,
        slot: Slot,
        source: StreamSource,
        mode: usize,
    ) -> Result<ProcessHandle, StreamError> {
        let number = slot.number;
        let input = self.resolve_input(source).await?;
        let template = self.mode_template(source, mode)?;

        if !self.is_current(slot) {
            return Err(StreamError::NotFound(number));
        }
        self.purge(number);
        tokio::fs::create_dir_all(&self.stream_dir).await?;

        let dir = self.stream_dir.to_string_lossy();
        let output = self
            .stream_dir
            .join(format!("stream{}.m3u8", number))
            .to_string_lossy()
            .into_owned();
        let num = number.to_string();
        let command = build_command(
            template,
            &[
                ("%FFMPEG%", self.ffmpeg_path.as_str()),
                ("%INPUT%", input.as_str()),
                ("%OUTPUT%", output.as_str()),
                ("%streamFileDir%", dir.as_ref()),
                ("%streamNum%", num.as_str()),
            ],
        )?;

        process::spawn(&self.pool, &command, format!("stream {}", number)).map_err(|e| match e {
            ProcessError::LimitReached { limit, .. } => StreamError::LimitReached(limit),
            other => StreamError::Spawn(other),
        })
    }

    /// Drop a stream that never got a process.
    fn abort_start(&self, slot: Slot) {
        let number = slot.number;
        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&number) {
                Some(session)
                    if session.generation == slot.generation
                        && session.state == StreamState::Starting =>
                {
                    sessions.remove(&number);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.purge(number);
            self.notify(number, StreamState::Error);
        }
    }

    /// Tear a stream down once, whichever path asked first.
    async fn shutdown(&self, slot: Slot, terminal: StreamState) {
        let number = slot.number;
        let handle = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&number) else {
                return;
            };
            if session.generation != slot.generation
                || matches!(session.state, StreamState::Stopping)
                || session.state.is_terminal()
            {
                return;
            }
            session.state = StreamState::Stopping;
            session.handle.clone()
        };
        self.notify(number, StreamState::Stopping);

        if let Some(handle) = handle {
            handle.kill().await;
        }
        self.purge(number);

        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&number) {
                Some(session) if session.generation == slot.generation => {
                    sessions.remove(&number);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.notify(number, terminal);
            info!(stream = number, state = %terminal, "stream ended");
        }
    }

    /// Follow the stream process. Exit 0 leaves the files servable; anything
    /// else ends the stream in error.
    fn watch(self: &Arc<Self>, slot: Slot, handle: ProcessHandle) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let exit = handle.wait().await;
            if exit.is_success() {
                info!(stream = slot.number, "stream process finished");
                return;
            }
            inner.shutdown(slot, StreamState::Error).await;
        });
    }

    /// Purge a number's files unless a newer session already owns it.
    fn purge_if_free(&self, number: StreamNumber) {
        if !self.sessions.lock().contains_key(&number) {
            self.purge(number);
        }
    }

    /// Remove `stream{N}.*` and `stream{N}-*` files.
    fn purge(&self, number: StreamNumber) {
        if !self.stream_dir.is_dir() {
            return;
        }

        for entry in WalkDir::new(&self.stream_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy();
            if is_stream_file(&name, number) {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(stream = number, path = %entry.path().display(), error = %e, "failed to remove stream file");
                }
            }
        }
    }
}

fn is_stream_file(name: &str, number: StreamNumber) -> bool {
    let prefix = format!("stream{}", number);
    match name.strip_prefix(&prefix) {
        Some(rest) => rest.starts_with('.') || rest.starts_with('-'),
        None => false,
    }
}
