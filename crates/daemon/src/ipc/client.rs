//! Worker side of the control channel.

use super::message::{
    kind, AddEncodeFilePayload, AddReservePayload, Envelope, IdGenerator, IdPayload, PageQuery,
    ProgramIdPayload, RecordedIdPayload,
};
use super::push::PushRouter;
use super::transport::{self, Outbox};
use super::IpcError;
use crate::model::{
    EncodeOption, EncodedId, EncodedItem, ProgramId, RecordedId, RecordedItem, ReserveAllId,
    ReserveLimit, ReservationStatus,
};
use crate::stream::{SourceLookup, StreamError};
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Set by the parent on the worker it spawns.
pub const IPC_CHANNEL_ENV: &str = "RECSTATION_IPC_CHANNEL";

struct ClientInner {
    ids: IdGenerator,
    pending: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
    outbox: Outbox,
    timeout: Duration,
    closed: watch::Sender<bool>,
}

/// Request/response client with push dispatch.
#[derive(Clone)]
pub struct IpcClient {
    inner: Arc<ClientInner>,
}

impl IpcClient {
    /// Attach to the parent over stdin/stdout. Fails unless this process was
    /// started by the parent daemon.
    pub fn attach_stdio(timeout: Duration, pushes: PushRouter) -> Result<Self, IpcError> {
        if std::env::var_os(IPC_CHANNEL_ENV).is_none() {
            return Err(IpcError::NotChildProcess);
        }
        Ok(Self::connect(
            tokio::io::stdin(),
            tokio::io::stdout(),
            timeout,
            pushes,
        ))
    }

    pub fn connect<R, W>(reader: R, writer: W, timeout: Duration, pushes: PushRouter) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let inner = Arc::new(ClientInner {
            ids: IdGenerator::new(),
            pending: Mutex::new(HashMap::new()),
            outbox: transport::spawn_writer(writer),
            timeout,
            closed: watch::Sender::new(false),
        });

        tokio::spawn(read_loop(reader, inner.clone(), pushes));
        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the parent side has hung up.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Send a request and wait for its response or the timeout.
    pub async fn request(&self, msg: &str, value: Option<Value>) -> Result<Value, IpcError> {
        if self.is_closed() {
            return Err(IpcError::Closed);
        }

        let id = self.inner.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        if self.is_closed() {
            self.inner.pending.lock().remove(&id);
            return Err(IpcError::Closed);
        }

        if let Err(e) = transport::send(&self.inner.outbox, Envelope::request(id, msg, value)) {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(error) => Err(IpcError::Remote(error)),
                None => Ok(response.value.unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(IpcError::Closed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                warn!(id, msg, "ipc request timed out");
                Err(IpcError::Timeout {
                    msg: msg.to_string(),
                    id,
                    timeout_ms: self.inner.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Typed request.
    pub async fn call<T, R>(&self, msg: &str, payload: Option<&T>) -> Result<R, IpcError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = payload.map(serde_json::to_value).transpose()?;
        let result = self.request(msg, value).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send an id-less message.
    pub fn push<T: Serialize + ?Sized>(&self, msg: &str, payload: Option<&T>) -> Result<(), IpcError> {
        let value = payload.map(serde_json::to_value).transpose()?;
        transport::send(&self.inner.outbox, Envelope::push(msg, value))
    }

    pub async fn get_reserve_all_id(&self) -> Result<ReserveAllId, IpcError> {
        self.call::<(), _>(kind::GET_RESERVE_ALL_ID, None).await
    }

    pub async fn get_reserves(&self, limit: Option<usize>, offset: usize) -> Result<ReserveLimit, IpcError> {
        self.call(kind::GET_RESERVES, Some(&PageQuery { limit, offset }))
            .await
    }

    pub async fn get_reserve_conflicts(&self, limit: Option<usize>, offset: usize) -> Result<ReserveLimit, IpcError> {
        self.call(kind::GET_RESERVE_CONFLICTS, Some(&PageQuery { limit, offset }))
            .await
    }

    pub async fn get_reserve_skips(&self, limit: Option<usize>, offset: usize) -> Result<ReserveLimit, IpcError> {
        self.call(kind::GET_RESERVE_SKIPS, Some(&PageQuery { limit, offset }))
            .await
    }

    pub async fn add_reserve(
        &self,
        program_id: ProgramId,
        encode: Option<EncodeOption>,
    ) -> Result<ReservationStatus, IpcError> {
        self.call(kind::ADD_RESERVE, Some(&AddReservePayload { program_id, encode }))
            .await
    }

    pub async fn cancel_reserve(&self, program_id: ProgramId) -> Result<(), IpcError> {
        self.call(kind::CANCEL_RESERVE, Some(&ProgramIdPayload { program_id }))
            .await
    }

    pub async fn remove_reserve_skip(&self, program_id: ProgramId) -> Result<(), IpcError> {
        self.call(kind::REMOVE_RESERVE_SKIP, Some(&ProgramIdPayload { program_id }))
            .await
    }

    pub async fn add_encode_file(
        &self,
        recorded_id: RecordedId,
        name: String,
        file_path: PathBuf,
        del_ts: bool,
    ) -> Result<EncodedId, IpcError> {
        let payload = AddEncodeFilePayload {
            recorded_id,
            name,
            file_path,
            del_ts,
        };
        self.call(kind::ADD_ENCODE_FILE, Some(&payload)).await
    }

    /// Ask the parent to re-read the size of a recording rewritten in place.
    pub async fn update_ts_file_size(&self, recorded_id: RecordedId) -> Result<(), IpcError> {
        self.call(kind::UPDATE_TS_FILE_SIZE, Some(&RecordedIdPayload { recorded_id }))
            .await
    }

    pub async fn update_reserves(&self) -> Result<(), IpcError> {
        self.call::<(), _>(kind::UPDATE_RESERVES, None).await
    }

    pub async fn get_recorded(&self, id: RecordedId) -> Result<Option<RecordedItem>, IpcError> {
        self.call(kind::GET_RECORDED, Some(&IdPayload { id })).await
    }

    pub async fn get_encoded(&self, id: EncodedId) -> Result<Option<EncodedItem>, IpcError> {
        self.call(kind::GET_ENCODED, Some(&IdPayload { id })).await
    }
}

impl SourceLookup for IpcClient {
    fn recorded(&self, id: RecordedId) -> BoxFuture<'_, Result<Option<RecordedItem>, StreamError>> {
        Box::pin(async move {
            self.get_recorded(id)
                .await
                .map_err(|e| StreamError::Lookup(e.to_string()))
        })
    }

    fn encoded(&self, id: EncodedId) -> BoxFuture<'_, Result<Option<EncodedItem>, StreamError>> {
        Box::pin(async move {
            self.get_encoded(id)
                .await
                .map_err(|e| StreamError::Lookup(e.to_string()))
        })
    }
}

async fn read_loop<R>(reader: R, inner: Arc<ClientInner>, pushes: PushRouter)
where
    R: AsyncRead + Unpin,
{
    let mut frames = transport::frames(reader);

    while let Some(line) = frames.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "ipc read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let envelope = match transport::decode(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "ignoring malformed ipc message");
                continue;
            }
        };

        match envelope.id {
            Some(id) => {
                let waiter = inner.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(envelope);
                    }
                    None => debug!(id, msg = %envelope.msg, "ignoring response with no pending request"),
                }
            }
            None => {
                pushes.dispatch(&envelope.msg, envelope.value);
            }
        }
    }

    inner.closed.send_replace(true);
    inner.pending.lock().clear();
    debug!("ipc reader finished");
}
