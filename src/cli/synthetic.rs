//! Synthetic operation for smoke runs
//!
//! Sleeps for a latency drawn from a configurable distribution and fails a
//! configurable share of requests. Latency models use the same notation as
//! the `--latency` flag:
//! - **Deterministic**: `D(5)` always takes 5 ms
//! - **Normal**: `N(5,1)` samples from a normal distribution, clamped at zero
//! - **Uniform**: `U(1,10)` samples uniformly between the bounds

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use racebench_core::{
    ChannelConfig, ConnectionError, ConnectionFactory, LaneId, Operation, OperationError,
    OperationRegistry, OperationResponse, Worker, WorkerBuilder,
};

/// Operation reference the synthetic registry answers to
pub const OPERATION: &str = "synthetic";

/// Distribution of synthetic request latency, in milliseconds
#[derive(Debug, Clone, Copy)]
pub enum LatencyModel {
    Deterministic(f64),
    Normal(Normal<f64>),
    Uniform(Uniform<f64>),
}

impl LatencyModel {
    /// Draw one latency
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        let ms = match self {
            LatencyModel::Deterministic(ms) => *ms,
            LatencyModel::Normal(distribution) => distribution.sample(rng),
            LatencyModel::Uniform(distribution) => distribution.sample(rng),
        };
        Duration::from_secs_f64(ms.max(0.0) / 1000.0)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LatencyModel::Deterministic(_) => "deterministic",
            LatencyModel::Normal(_) => "normal",
            LatencyModel::Uniform(_) => "uniform",
        }
    }
}

impl FromStr for LatencyModel {
    type Err = anyhow::Error;

    /// Parse strings like "D(5)", "N(5,1)" or "U(1,10)"
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let params = extract_params(s)?;
        let kind = s.chars().next().map(|c| c.to_ascii_uppercase());

        match (kind, params.as_slice()) {
            (Some('D'), [delay]) => {
                if *delay < 0.0 {
                    anyhow::bail!("Deterministic latency must not be negative: {}", s);
                }
                Ok(LatencyModel::Deterministic(*delay))
            }
            (Some('N'), [mean, std_dev]) => {
                let distribution = Normal::new(*mean, *std_dev)
                    .map_err(|e| anyhow::anyhow!("Invalid normal distribution parameters: {}", e))?;
                Ok(LatencyModel::Normal(distribution))
            }
            (Some('U'), [min, max]) => {
                if min >= max {
                    anyhow::bail!("Uniform latency requires min < max, got: {}", s);
                }
                Ok(LatencyModel::Uniform(Uniform::new(*min, *max)))
            }
            (Some('D'), _) => anyhow::bail!("Deterministic latency requires 1 parameter: D(ms), got: {}", s),
            (Some('N'), _) => anyhow::bail!("Normal latency requires 2 parameters: N(mean_ms,std_dev_ms), got: {}", s),
            (Some('U'), _) => anyhow::bail!("Uniform latency requires 2 parameters: U(min_ms,max_ms), got: {}", s),
            _ => anyhow::bail!(
                "Invalid latency format: {}. Expected D(ms), N(mean,std) or U(min,max)",
                s
            ),
        }
    }
}

/// Extract parameters from a string like "N(5,1)" -> [5.0, 1.0]
fn extract_params(s: &str) -> Result<Vec<f64>> {
    let start = s
        .find('(')
        .ok_or_else(|| anyhow::anyhow!("Missing opening parenthesis in latency: {}", s))?;
    let end = s
        .rfind(')')
        .ok_or_else(|| anyhow::anyhow!("Missing closing parenthesis in latency: {}", s))?;

    if start >= end {
        anyhow::bail!("Invalid parentheses in latency: {}", s);
    }

    s[start + 1..end]
        .split(',')
        .map(|p| {
            let p = p.trim();
            p.parse::<f64>()
                .with_context(|| format!("Invalid latency parameter: {}", p))
        })
        .collect()
}

/// Per-lane state: every lane draws from its own generator
pub struct SyntheticConnection {
    rng: StdRng,
}

/// Opens one seeded connection per lane
pub struct SyntheticConnections {
    seed: u64,
}

#[async_trait]
impl ConnectionFactory<SyntheticConnection> for SyntheticConnections {
    async fn connect(&self, lane: LaneId) -> Result<SyntheticConnection, ConnectionError> {
        let seed = self.seed ^ ((lane.worker as u64) << 32) ^ lane.lane as u64;
        Ok(SyntheticConnection {
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

/// Sleeps, then succeeds or fails at random
pub struct SyntheticOperation {
    latency: LatencyModel,
    error_rate: f64,
}

impl SyntheticOperation {
    pub fn new(latency: LatencyModel, error_rate: f64) -> Self {
        Self {
            latency,
            error_rate: error_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl Operation<SyntheticConnection> for SyntheticOperation {
    async fn execute(
        &self,
        connection: &mut SyntheticConnection,
    ) -> Result<OperationResponse, OperationError> {
        let latency = self.latency.sample(&mut connection.rng);
        let fail = connection.rng.gen_bool(self.error_rate);
        tokio::time::sleep(latency).await;

        if fail {
            return Err(OperationError::Connection("injected failure".into()));
        }
        Ok(OperationResponse::new())
    }
}

/// Build a worker whose registry holds the synthetic operation
pub fn worker(
    name: impl Into<String>,
    latency: LatencyModel,
    error_rate: f64,
    seed: u64,
    channels: ChannelConfig,
) -> Result<Worker<SyntheticConnection>> {
    let registry = OperationRegistry::new().with(
        OPERATION,
        Arc::new(SyntheticOperation::new(latency, error_rate)),
    );

    let worker = WorkerBuilder::new(name)
        .registry(Arc::new(registry))
        .connections(Arc::new(SyntheticConnections { seed }))
        .channels(channels)
        .build()?;
    Ok(worker)
}
