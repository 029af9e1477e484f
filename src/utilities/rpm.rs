//! Per-agent requests-per-minute limiting.
//!
//! Each agent gets a token bucket keyed by its name. Buckets refill
//! continuously at `max_rpm / 60` tokens per second and hold at most
//! `max_rpm` tokens. Callers block cooperatively until a token is available
//! or the configured wait budget elapses, at which point the acquire fails
//! with [`EngineError::RateBudgetExceeded`] (retryable).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::utilities::errors::EngineError;

/// How long to sleep between bucket polls while waiting for a token.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single agent's token bucket.
#[derive(Debug)]
pub struct RpmBucket {
    max_rpm: u32,
    state: Mutex<BucketState>,
}

impl RpmBucket {
    fn new(max_rpm: u32) -> Self {
        Self {
            max_rpm,
            state: Mutex::new(BucketState {
                tokens: max_rpm as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available. Returns false when the bucket is empty.
    fn try_take(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let refill = elapsed * self.max_rpm as f64 / 60.0;
        state.tokens = (state.tokens + refill).min(self.max_rpm as f64);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Registry of per-agent rate buckets.
///
/// `max_rpm = 0` means unlimited: no bucket is created and acquire returns
/// immediately.
pub struct RpmController {
    buckets: DashMap<String, Arc<RpmBucket>>,
    default_rpm: u32,
    wait_budget: Duration,
}

impl RpmController {
    /// Create a controller with a default RPM limit and wait budget.
    pub fn new(default_rpm: u32, wait_budget: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            default_rpm,
            wait_budget,
        }
    }

    /// Effective limit for an agent: its own `max_rpm` or the default.
    fn effective_rpm(&self, agent_rpm: u32) -> u32 {
        if agent_rpm > 0 {
            agent_rpm
        } else {
            self.default_rpm
        }
    }

    /// Acquire one request token for `agent`, waiting up to the budget.
    pub async fn acquire(&self, agent: &str, agent_rpm: u32) -> Result<(), EngineError> {
        let rpm = self.effective_rpm(agent_rpm);
        if rpm == 0 {
            return Ok(());
        }

        let bucket = self
            .buckets
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(RpmBucket::new(rpm)))
            .value()
            .clone();

        let deadline = Instant::now() + self.wait_budget;
        loop {
            if bucket.try_take() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "agent '{}' exhausted its rpm wait budget ({:?})",
                    agent,
                    self.wait_budget
                );
                return Err(EngineError::RateBudgetExceeded {
                    agent: agent.to_string(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Current token count for an agent's bucket, if one exists.
    pub fn available_tokens(&self, agent: &str) -> Option<f64> {
        self.buckets.get(agent).map(|b| b.state.lock().tokens)
    }
}
