//! TCP transport for remote workers
//!
//! Each message is one frame: a 4-byte big-endian length followed by the
//! message as JSON. The worker speaks first with its hello.

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::{BenchError, BenchResult};
use crate::protocol::{CoordinatorMessage, WorkerMessage};
use crate::worker::{Worker, WorkerStats};

use super::{LinkEvent, WorkerEvent, WorkerLink};

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one message frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> BenchResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)
        .map_err(|e| BenchError::protocol(format!("failed to encode message: {e}")))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(BenchError::protocol(format!(
            "message of {} bytes exceeds the frame limit",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    writer
        .write_all(&frame)
        .await
        .map_err(|e| BenchError::transport(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BenchError::transport(format!("flush failed: {e}")))
}

/// Read one message frame
///
/// Returns `Ok(None)` when the peer closed the connection between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> BenchResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BenchError::transport(format!("read failed: {e}"))),
    };
    if len > MAX_FRAME_LEN {
        return Err(BenchError::protocol(format!(
            "frame of {len} bytes exceeds the frame limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| BenchError::transport(format!("truncated frame: {e}")))?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| BenchError::protocol(format!("malformed message: {e}")))
}

/// Connect to a remote worker
///
/// Waits up to `timeout` for the TCP handshake and again for the worker's
/// hello, which is forwarded to `events` like any later message. Reader and
/// writer tasks then pump frames until either side closes.
pub async fn connect(
    id: usize,
    addr: SocketAddr,
    events: mpsc::Sender<WorkerEvent>,
    timeout: Duration,
    buffer: usize,
) -> BenchResult<WorkerLink> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| BenchError::transport(format!("timed out connecting to {addr}")))?
        .map_err(|e| BenchError::transport(format!("failed to connect to {addr}: {e}")))?;
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let hello = match tokio::time::timeout(timeout, read_frame::<_, WorkerMessage>(&mut reader)).await
    {
        Ok(Ok(Some(hello @ WorkerMessage::Hello { .. }))) => hello,
        Ok(Ok(Some(other))) => {
            return Err(BenchError::protocol(format!(
                "expected hello from {addr}, got {}",
                other.kind()
            )))
        }
        Ok(Ok(None)) => {
            return Err(BenchError::transport(format!(
                "{addr} closed the connection before hello"
            )))
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(BenchError::transport(format!(
                "timed out waiting for hello from {addr}"
            )))
        }
    };
    tracing::info!(worker_id = id, addr = %addr, "Connected to remote worker");

    events
        .send(WorkerEvent {
            worker: id,
            event: LinkEvent::Message(hello),
        })
        .await
        .map_err(|_| BenchError::shutdown())?;

    tokio::spawn(async move {
        let reason = loop {
            match read_frame::<_, WorkerMessage>(&mut reader).await {
                Ok(Some(message)) => {
                    let event = WorkerEvent {
                        worker: id,
                        event: LinkEvent::Message(message),
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break "connection closed by worker".to_string(),
                Err(e) => break e.to_string(),
            }
        };
        tracing::debug!(worker_id = id, reason = %reason, "Remote link closed");
        let _ = events
            .send(WorkerEvent {
                worker: id,
                event: LinkEvent::Disconnected(reason),
            })
            .await;
    });

    let (tx, mut rx) = mpsc::channel::<CoordinatorMessage>(buffer);
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                tracing::warn!(worker_id = id, error = %e, "Failed to send to remote worker");
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    Ok(WorkerLink::new(id, addr.to_string(), tx))
}

/// Run one worker over an accepted connection
///
/// Returns once the worker stopped and its last message was written.
pub async fn serve_connection<C: Send + 'static>(
    stream: TcpStream,
    worker: Worker<C>,
    buffer: usize,
) -> BenchResult<WorkerStats> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (down_tx, down_rx) = mpsc::channel(buffer);
    let (up_tx, mut up_rx) = mpsc::channel::<WorkerMessage>(buffer);

    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame::<_, CoordinatorMessage>(&mut reader).await {
                Ok(Some(message)) => {
                    if down_tx.send(message).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping coordinator connection");
                    return;
                }
            }
        }
    });

    let writer_task = tokio::spawn(async move {
        while let Some(message) = up_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                tracing::warn!(error = %e, "Failed to send to coordinator");
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    let result = worker.run(down_rx, up_tx).await;
    let _ = writer_task.await;
    reader_task.abort();
    result
}

/// Accept coordinators on `listener`, one worker per connection
///
/// `make_worker` builds a fresh worker for each connection. Runs until the
/// listener fails.
pub async fn serve<C, F>(listener: TcpListener, buffer: usize, make_worker: F) -> BenchResult<()>
where
    C: Send + 'static,
    F: Fn() -> BenchResult<Worker<C>>,
{
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| BenchError::transport(format!("accept failed: {e}")))?;
        let worker = make_worker()?;
        tracing::info!(peer = %peer, worker = worker.name(), "Coordinator connected");

        tokio::spawn(async move {
            match serve_connection(stream, worker, buffer).await {
                Ok(stats) => tracing::info!(
                    peer = %peer,
                    completed = stats.completed,
                    errors = stats.errors,
                    "Race finished"
                ),
                Err(e) => tracing::warn!(peer = %peer, error = %e, "Race ended with error"),
            }
        });
    }
}
