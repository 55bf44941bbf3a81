//! Newline-delimited JSON over a byte pipe.

use super::message::Envelope;
use super::IpcError;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Sending half shared by everything that writes to the pipe.
pub type Outbox = mpsc::UnboundedSender<Envelope>;

pub fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LENGTH)
}

pub fn frames<R: AsyncRead>(reader: R) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, codec())
}

/// Serialize envelopes onto `writer` from a dedicated task, in send order.
pub fn spawn_writer<W>(writer: W) -> Outbox
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let mut sink = FramedWrite::new(writer, codec());

    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let line = match serde_json::to_string(&envelope) {
                Ok(line) => line,
                Err(e) => {
                    warn!(msg = %envelope.msg, error = %e, "dropping unserializable message");
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                warn!(error = %e, "ipc pipe closed for writing");
                break;
            }
        }
        debug!("ipc writer finished");
    });

    tx
}

pub fn decode(line: &str) -> Result<Envelope, IpcError> {
    Ok(serde_json::from_str(line)?)
}

pub fn send(outbox: &Outbox, envelope: Envelope) -> Result<(), IpcError> {
    outbox.send(envelope).map_err(|_| IpcError::Closed)
}
