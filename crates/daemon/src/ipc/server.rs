//! Parent side of the control channel.

use super::message::Envelope;
use super::push::PushRouter;
use super::transport::{self, Outbox};
use super::IpcError;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Answers worker requests. An `Err` is sent back in the envelope's error field.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, msg: String, value: Option<Value>) -> BoxFuture<'static, Result<Value, String>>;
}

/// Handle for pushing to the worker.
#[derive(Clone)]
pub struct IpcServer {
    outbox: Outbox,
}

impl IpcServer {
    /// Serve requests read from `reader` until the pipe closes. The returned
    /// task finishes when the worker side hangs up.
    pub fn serve<R, W>(
        reader: R,
        writer: W,
        handler: Arc<dyn RequestHandler>,
        pushes: PushRouter,
    ) -> (Self, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let outbox = transport::spawn_writer(writer);
        let task = tokio::spawn(read_loop(reader, outbox.clone(), handler, pushes));
        (Self { outbox }, task)
    }

    pub fn push<T: Serialize + ?Sized>(&self, msg: &str, payload: Option<&T>) -> Result<(), IpcError> {
        let value = payload.map(serde_json::to_value).transpose()?;
        transport::send(&self.outbox, Envelope::push(msg, value))
    }
}

async fn read_loop<R>(reader: R, outbox: Outbox, handler: Arc<dyn RequestHandler>, pushes: PushRouter)
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

        let Some(id) = envelope.id else {
            pushes.dispatch(&envelope.msg, envelope.value);
            continue;
        };

        // Requests are answered concurrently; the id ties each reply to its call.
        let response = handler.handle(envelope.msg.clone(), envelope.value);
        let outbox = outbox.clone();
        let msg = envelope.msg;
        tokio::spawn(async move {
            let result = response.await;
            if let Err(error) = &result {
                debug!(id, msg = %msg, error = %error, "request rejected");
            }
            if transport::send(&outbox, Envelope::reply(id, msg, result)).is_err() {
                debug!(id, "worker gone before reply");
            }
        });
    }

    debug!("ipc server reader finished");
}
