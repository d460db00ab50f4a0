//! Links between the coordinator and its workers
//!
//! The coordinator sees every worker the same way: a [`WorkerLink`] to send
//! control messages down, and a shared event queue carrying [`WorkerEvent`]s
//! up. In-process workers are wired with bounded channels ([`spawn_local`]),
//! remote workers over TCP ([`tcp::connect`]).

pub mod tcp;

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{BenchError, BenchResult};
use crate::protocol::{CoordinatorMessage, WorkerMessage};
use crate::worker::Worker;

/// Coordinator side of one worker link
#[derive(Debug, Clone)]
pub struct WorkerLink {
    id: usize,
    endpoint: String,
    tx: mpsc::Sender<CoordinatorMessage>,
}

impl WorkerLink {
    /// Wrap the sending half of a link
    pub fn new(id: usize, endpoint: impl Into<String>, tx: mpsc::Sender<CoordinatorMessage>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            tx,
        }
    }

    /// Worker id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Where the worker runs (`local` or a socket address)
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send a control message, waiting at most `timeout` for queue space
    pub async fn send(&self, message: CoordinatorMessage, timeout: Duration) -> BenchResult<()> {
        match tokio::time::timeout(timeout, self.tx.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BenchError::transport(format!(
                "link to worker {} closed",
                self.id
            ))),
            Err(_) => Err(BenchError::transport(format!(
                "timed out sending to worker {}",
                self.id
            ))),
        }
    }
}

/// Something that happened on a link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A message from the worker
    Message(WorkerMessage),
    /// The link is gone; no more events follow
    Disconnected(String),
}

/// An event tagged with the worker it came from
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    /// Worker id
    pub worker: usize,
    /// What happened
    pub event: LinkEvent,
}

/// Run a worker in-process and link it to the coordinator's event queue
///
/// The worker task and a forwarder are spawned on the current runtime. When the
/// worker stops, the forwarder reports [`LinkEvent::Disconnected`] with the
/// worker's exit reason.
pub fn spawn_local<C: Send + 'static>(
    id: usize,
    worker: Worker<C>,
    events: mpsc::Sender<WorkerEvent>,
    buffer: usize,
) -> WorkerLink {
    let (down_tx, down_rx) = mpsc::channel(buffer);
    let (up_tx, mut up_rx) = mpsc::channel(buffer);
    let name = worker.name().to_string();

    let handle = tokio::spawn(worker.run(down_rx, up_tx));

    tokio::spawn(async move {
        while let Some(message) = up_rx.recv().await {
            let event = WorkerEvent {
                worker: id,
                event: LinkEvent::Message(message),
            };
            if events.send(event).await.is_err() {
                // Coordinator is gone; dropping the receiver stops the worker
                return;
            }
        }

        let reason = match handle.await {
            Ok(Ok(_)) => "worker exited".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("worker task failed: {e}"),
        };
        tracing::debug!(worker_id = id, worker = %name, reason = %reason, "Local link closed");
        let _ = events
            .send(WorkerEvent {
                worker: id,
                event: LinkEvent::Disconnected(reason),
            })
            .await;
    });

    WorkerLink::new(id, "local", down_tx)
}
