//! Integration tests for the Worker module
//!
//! Each test plays the coordinator's side of the link by hand.

use super::*;
use crate::channel::ChannelConfig;
use crate::clock::RaceClock;
use crate::config::ErrorPolicy;
use crate::error::BenchErrorKind;
use crate::operation::{
    ConnectionError, ConnectionFactory, Operation, OperationError, OperationRegistry,
    OperationResponse,
};
use crate::protocol::{Assignment, Barrier, CoordinatorMessage, WorkerMessage};
use crate::sample::{LaneId, Sample};
use crate::scheduler::{LaneSpec, PhasePlan, PlanNode, StepReport};
use crate::task::{Completion, Phase, Task};

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// Mocks
// ============================================================================

struct MockOperation {
    latency: Duration,
}

#[async_trait]
impl Operation<()> for MockOperation {
    async fn execute(&self, _connection: &mut ()) -> Result<OperationResponse, OperationError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(OperationResponse::new())
    }
}

struct FailingOperation;

#[async_trait]
impl Operation<()> for FailingOperation {
    async fn execute(&self, _connection: &mut ()) -> Result<OperationResponse, OperationError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Err(OperationError::Connection("connection refused".into()))
    }
}

struct MockConnections;

#[async_trait]
impl ConnectionFactory<()> for MockConnections {
    async fn connect(&self, _lane: LaneId) -> Result<(), ConnectionError> {
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Link {
    down: mpsc::Sender<CoordinatorMessage>,
    up: mpsc::Receiver<WorkerMessage>,
    handle: JoinHandle<crate::error::BenchResult<WorkerStats>>,
}

impl Link {
    async fn send(&self, message: CoordinatorMessage) {
        self.down.send(message).await.unwrap();
    }

    /// Next message that is not a heartbeat
    async fn next(&mut self) -> WorkerMessage {
        loop {
            match self.up.recv().await.expect("worker hung up") {
                WorkerMessage::Heartbeat => continue,
                message => return message,
            }
        }
    }

    /// Collect samples until the worker reports ready
    async fn until_ready(&mut self) -> (Vec<Sample>, Barrier, StepReport) {
        let mut samples = Vec::new();
        loop {
            match self.next().await {
                WorkerMessage::Samples { samples: batch } => samples.extend(batch),
                WorkerMessage::Ready { barrier, summary } => return (samples, barrier, summary),
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }
}

fn spawn_worker(operation: impl Operation<()> + 'static, channels: ChannelConfig) -> Link {
    let registry = OperationRegistry::<()>::new().with("op", Arc::new(operation));
    let worker = WorkerBuilder::new("loadgen")
        .registry(Arc::new(registry))
        .connections(Arc::new(MockConnections))
        .channels(channels)
        .clock(RaceClock::start())
        .build()
        .unwrap();

    let (down, downlink) = mpsc::channel(16);
    let (uplink, up) = mpsc::channel(1024);
    let handle = tokio::spawn(worker.run(downlink, uplink));
    Link { down, up, handle }
}

fn node(worker: usize, task: Task) -> PlanNode {
    let lanes = (0..task.concurrency)
        .map(|index| LaneSpec {
            id: LaneId::new(worker, index),
            index,
            iterations: task.iterations_for_lane(index),
        })
        .collect();
    PlanNode::Task { task, lanes }
}

fn assignment(worker: usize, steps: Vec<PlanNode>, error_policy: ErrorPolicy) -> Assignment {
    Assignment {
        worker,
        race: "test".into(),
        epoch: Utc::now(),
        error_policy,
        heartbeat_interval: Duration::from_millis(100),
        phases: vec![PhasePlan {
            phase: Phase::Measurement,
            steps,
        }],
    }
}

/// Hello, assignment, provisioned
async fn provision(link: &mut Link, assignment: Assignment) {
    match link.next().await {
        WorkerMessage::Hello { name, operations } => {
            assert_eq!(name, "loadgen");
            assert_eq!(operations, vec!["op".to_string()]);
        }
        other => panic!("expected hello, got {:?}", other),
    }
    link.send(CoordinatorMessage::Assign(assignment)).await;
    match link.next().await {
        WorkerMessage::Ready { barrier, .. } => assert_eq!(barrier, Barrier::Provisioned),
        other => panic!("expected provisioned, got {:?}", other),
    }
}

fn proceed(step: usize) -> CoordinatorMessage {
    CoordinatorMessage::Proceed {
        phase: Phase::Measurement,
        step,
    }
}

fn paced_task() -> Task {
    Task::new("paced", "op")
        .with_rate(10.0)
        .with_completion(Completion::Duration(Duration::from_secs(1)))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_worker_lifecycle() {
    let mut link = spawn_worker(
        MockOperation {
            latency: Duration::from_millis(1),
        },
        ChannelConfig::default(),
    );
    provision(
        &mut link,
        assignment(3, vec![node(3, paced_task())], ErrorPolicy::Continue),
    )
    .await;

    link.send(proceed(0)).await;
    let (samples, barrier, summary) = link.until_ready().await;

    assert_eq!(
        barrier,
        Barrier::Step {
            phase: Phase::Measurement,
            step: 0
        }
    );
    assert!((9..=11).contains(&samples.len()), "got {}", samples.len());
    // Every sample of the step arrives before the acknowledgment
    assert_eq!(summary.issued, samples.len() as u64);
    assert!(summary.is_clean());
    assert!(samples.iter().all(|s| s.lane.worker == 3 && s.is_success()));

    link.send(CoordinatorMessage::Shutdown).await;
    let stats = match link.next().await {
        WorkerMessage::Finished { stats } => stats,
        other => panic!("expected finished, got {:?}", other),
    };
    assert_eq!(stats.completed, samples.len() as u64);
    assert_eq!(stats.steps, 1);

    let returned = link.handle.await.unwrap().unwrap();
    assert_eq!(returned, stats);
}

#[tokio::test(start_paused = true)]
async fn test_worker_shutdown_before_assignment() {
    let mut link = spawn_worker(
        MockOperation {
            latency: Duration::ZERO,
        },
        ChannelConfig::default(),
    );
    assert!(matches!(link.next().await, WorkerMessage::Hello { .. }));

    link.send(CoordinatorMessage::Shutdown).await;
    match link.next().await {
        WorkerMessage::Finished { stats } => assert_eq!(stats.total_samples(), 0),
        other => panic!("expected finished, got {:?}", other),
    }
    assert!(link.handle.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_worker_proceed_before_assignment() {
    let mut link = spawn_worker(
        MockOperation {
            latency: Duration::ZERO,
        },
        ChannelConfig::default(),
    );
    assert!(matches!(link.next().await, WorkerMessage::Hello { .. }));

    link.send(proceed(0)).await;
    let err = link.handle.await.unwrap().unwrap_err();
    assert_eq!(err.kind, BenchErrorKind::Protocol);
}

#[tokio::test(start_paused = true)]
async fn test_worker_unknown_step() {
    let mut link = spawn_worker(
        MockOperation {
            latency: Duration::ZERO,
        },
        ChannelConfig::default(),
    );
    provision(
        &mut link,
        assignment(0, vec![node(0, paced_task())], ErrorPolicy::Continue),
    )
    .await;

    link.send(proceed(5)).await;
    let err = link.handle.await.unwrap().unwrap_err();
    assert_eq!(err.kind, BenchErrorKind::Protocol);
    assert!(err.message.contains("step 5"));
}

#[tokio::test(start_paused = true)]
async fn test_worker_rejects_overlapping_steps() {
    let mut link = spawn_worker(
        MockOperation {
            latency: Duration::from_millis(1),
        },
        ChannelConfig::default(),
    );
    let steps = vec![node(0, paced_task()), node(0, paced_task())];
    provision(&mut link, assignment(0, steps, ErrorPolicy::Continue)).await;

    link.send(proceed(0)).await;
    link.send(proceed(1)).await;

    let err = link.handle.await.unwrap().unwrap_err();
    assert_eq!(err.kind, BenchErrorKind::Protocol);
}

#[tokio::test(start_paused = true)]
async fn test_worker_interrupt_ends_step() {
    let mut link = spawn_worker(
        MockOperation {
            latency: Duration::from_millis(1),
        },
        ChannelConfig::default(),
    );
    let task = Task::new("endless", "op")
        .with_rate(100.0)
        .with_completion(Completion::UntilInterrupted);
    provision(
        &mut link,
        assignment(0, vec![node(0, task)], ErrorPolicy::Continue),
    )
    .await;

    link.send(proceed(0)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    link.send(CoordinatorMessage::Interrupt).await;

    let (samples, _, summary) = link.until_ready().await;
    assert!(summary.interrupted);
    assert!(
        (45..=55).contains(&samples.len()),
        "expected about 50 samples, got {}",
        samples.len()
    );
    assert_eq!(summary.issued, samples.len() as u64);

    link.send(CoordinatorMessage::Shutdown).await;
    assert!(link.handle.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_worker_abort_policy() {
    let mut link = spawn_worker(FailingOperation, ChannelConfig::default());
    let task = Task::new("doomed", "op").with_completion(Completion::Iterations(5));
    provision(&mut link, assignment(0, vec![node(0, task)], ErrorPolicy::Abort)).await;

    link.send(proceed(0)).await;

    let mut samples = Vec::new();
    let reason = loop {
        match link.next().await {
            WorkerMessage::Samples { samples: batch } => samples.extend(batch),
            WorkerMessage::Aborted { reason } => break reason,
            other => panic!("unexpected message: {:?}", other),
        }
    };
    assert!(reason.contains("connection refused"));
    assert_eq!(samples.len(), 1);
    assert!(!samples[0].is_success());

    let (rest, _, summary) = link.until_ready().await;
    assert!(rest.is_empty());
    assert!(summary.aborted.is_some());
    assert_eq!(summary.issued, 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_backpressure_keeps_every_sample() {
    let channels = ChannelConfig::default()
        .with_sample_buffer(1)
        .with_sample_batch(1);
    let mut link = spawn_worker(
        MockOperation {
            latency: Duration::ZERO,
        },
        channels,
    );
    let task = Task::new("burst", "op")
        .with_concurrency(2)
        .with_completion(Completion::Iterations(50));
    provision(
        &mut link,
        assignment(0, vec![node(0, task)], ErrorPolicy::Continue),
    )
    .await;

    link.send(proceed(0)).await;

    let mut batches = 0;
    let mut samples = Vec::new();
    let summary = loop {
        match link.next().await {
            WorkerMessage::Samples { samples: batch } => {
                assert_eq!(batch.len(), 1);
                batches += 1;
                samples.extend(batch);
            }
            WorkerMessage::Ready { summary, .. } => break summary,
            other => panic!("unexpected message: {:?}", other),
        }
    };

    assert_eq!(batches, 50);
    assert_eq!(summary.issued, 50);
    for lane in 0..2 {
        let sequences: Vec<u64> = samples
            .iter()
            .filter(|s| s.lane.lane == lane)
            .map(|s| s.sequence)
            .collect();
        assert_eq!(sequences, (0..25).collect::<Vec<_>>());
    }
}

#[tokio::test(start_paused = true)]
async fn test_worker_closed_downlink() {
    let mut link = spawn_worker(
        MockOperation {
            latency: Duration::ZERO,
        },
        ChannelConfig::default(),
    );
    provision(
        &mut link,
        assignment(0, vec![node(0, paced_task())], ErrorPolicy::Continue),
    )
    .await;

    drop(link.down);
    let err = link.handle.await.unwrap().unwrap_err();
    assert_eq!(err.kind, BenchErrorKind::Transport);
}

#[tokio::test(start_paused = true)]
async fn test_worker_sends_heartbeats() {
    let mut link = spawn_worker(
        MockOperation {
            latency: Duration::ZERO,
        },
        ChannelConfig::default(),
    );
    provision(
        &mut link,
        assignment(0, vec![node(0, paced_task())], ErrorPolicy::Continue),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(350)).await;

    let mut heartbeats = 0;
    while let Ok(message) = link.up.try_recv() {
        assert_eq!(message, WorkerMessage::Heartbeat);
        heartbeats += 1;
    }
    assert!(heartbeats >= 3, "got {heartbeats} heartbeats");
}
