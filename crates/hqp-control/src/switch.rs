//! Profile switching: activate a profile, restart the daemon, then wait for
//! the control port to come back.
//!
//! ```text
//!   Idle ─► Activating ─► Restarting ─► Polling ─► Ready
//!              │              │            └─────► TimedOut
//!              └──────────────┴──────────────────► Failed
//! ```
//!
//! At most one switch runs per host.  Activation and restart execute in a
//! spawned task that owns the host's lease, so a caller that goes away mid
//! switch only stops waiting; it never interrupts a copy or restart that has
//! already been issued.  Polling runs in the caller's future and is freely
//! cancellable.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hqp_proto::config::SwitchConfig;
use hqp_proto::{ControlError, ErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::client::ReadinessProbe;
use crate::store::{validate_profile_id, ProfileRef, ProfileStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPhase {
    Idle,
    Activating,
    Restarting,
    Polling,
    Ready,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchOutcome {
    /// The control port answered after the restart.
    Ready,
    /// The wait budget ran out; the restart may still complete.
    TimedOut,
    /// Returned without waiting for readiness.
    Started,
    /// Activation or restart failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchResult {
    pub requested_profile: ProfileRef,
    pub activation_accepted: bool,
    pub restarted: bool,
    pub ready_observed: bool,
    pub elapsed_ms: u64,
    pub outcome: SwitchOutcome,
    pub error: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl SwitchResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SwitchOutcome::Ready | SwitchOutcome::Started)
    }
}

/// Floor for the gap between readiness probes.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Readiness polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Total time a waiting switch may take, measured from the call.
    pub budget: Duration,
    pub probe_timeout: Duration,
    pub interval: Duration,
    pub max_interval: Duration,
}

impl PollPolicy {
    pub fn from_config(config: &SwitchConfig) -> Self {
        let interval = Duration::from_millis(config.poll_interval_ms).max(MIN_POLL_INTERVAL);
        Self {
            budget: Duration::from_millis(config.wait_budget_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            interval,
            max_interval: Duration::from_millis(config.max_poll_interval_ms).max(interval),
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current
            .max(MIN_POLL_INTERVAL)
            .mul_f64(1.5)
            .min(self.max_interval.max(self.interval).max(MIN_POLL_INTERVAL))
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_config(&SwitchConfig::default())
    }
}

/// Per-host switch leases.  Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct SwitchLocks {
    inner: Arc<Mutex<HashMap<String, SwitchPhase>>>,
}

impl SwitchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `host`, or fail with `SwitchInProgress`.
    pub fn try_acquire(&self, host: &str) -> Result<SwitchLease, ControlError> {
        let mut table = self.table();
        if let Some(phase) = table.get(host) {
            debug!("Switch on {} refused, one is already {:?}", host, phase);
            return Err(ControlError::SwitchInProgress(host.to_string()));
        }
        table.insert(host.to_string(), SwitchPhase::Idle);
        Ok(SwitchLease {
            locks: self.clone(),
            host: host.to_string(),
        })
    }

    /// Phase of the switch in flight on `host`, `Idle` when there is none.
    pub fn phase(&self, host: &str) -> SwitchPhase {
        self.table().get(host).copied().unwrap_or(SwitchPhase::Idle)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, SwitchPhase>> {
        // The table holds plain data; a panicked holder cannot leave it torn.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive right to switch one host.  Released on drop.
#[derive(Debug)]
pub struct SwitchLease {
    locks: SwitchLocks,
    host: String,
}

impl SwitchLease {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn advance(&self, phase: SwitchPhase) {
        info!("Switch on {}: {:?}", self.host, phase);
        self.locks.table().insert(self.host.clone(), phase);
    }
}

impl Drop for SwitchLease {
    fn drop(&mut self) {
        self.locks.table().remove(&self.host);
    }
}

/// What the activation task managed before it stopped.
struct Steps {
    activated: bool,
    restarted: bool,
    error: Option<ControlError>,
}

pub struct SwitchOrchestrator {
    store: Arc<dyn ProfileStore>,
    probe: Arc<dyn ReadinessProbe>,
    locks: SwitchLocks,
    policy: PollPolicy,
}

impl SwitchOrchestrator {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        probe: Arc<dyn ReadinessProbe>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            store,
            probe,
            locks: SwitchLocks::new(),
            policy,
        }
    }

    /// Share a lease table with other orchestrators targeting the same hosts.
    pub fn with_locks(mut self, locks: SwitchLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &SwitchLocks {
        &self.locks
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn phase(&self) -> SwitchPhase {
        self.locks.phase(self.store.host())
    }

    /// Switch the host to profile `id`.
    ///
    /// `Err` means nothing was touched: bad id, unknown profile, store
    /// unreachable or another switch in flight.  Once activation has been
    /// attempted the call always returns `Ok`, with the outcome and any
    /// failure recorded in the [`SwitchResult`].
    pub async fn switch(
        &self,
        id: &str,
        wait: bool,
        budget: Option<Duration>,
    ) -> Result<SwitchResult, ControlError> {
        validate_profile_id(id)?;
        let started = Instant::now();
        let started_at = Utc::now();
        let budget = budget.unwrap_or(self.policy.budget);

        let lease = self.locks.try_acquire(self.store.host())?;
        let profile = self
            .store
            .list()
            .await?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| ControlError::ProfileNotFound(id.to_string()))?;

        lease.advance(SwitchPhase::Activating);
        let store = Arc::clone(&self.store);
        let profile_id = profile.id.clone();
        let task = tokio::spawn(async move {
            let steps = activate_and_restart(store.as_ref(), &profile_id, &lease).await;
            (lease, steps)
        });

        let result = |steps: &Steps, outcome: SwitchOutcome, ready_observed: bool| SwitchResult {
            requested_profile: profile.clone(),
            activation_accepted: steps.activated,
            restarted: steps.restarted,
            ready_observed,
            elapsed_ms: started.elapsed().as_millis() as u64,
            outcome,
            error: steps.error.as_ref().map(ControlError::kind),
            error_message: steps.error.as_ref().map(ToString::to_string),
            started_at,
        };

        let (lease, steps) = match task.await {
            Ok(done) => done,
            Err(e) => {
                let steps = Steps {
                    activated: false,
                    restarted: false,
                    error: Some(ControlError::ActivationFailed {
                        id: id.to_string(),
                        reason: format!("switch task aborted: {e}"),
                    }),
                };
                error!("Switch to '{}' aborted: {}", id, e);
                return Ok(result(&steps, SwitchOutcome::Failed, false));
            }
        };

        if let Some(err) = &steps.error {
            lease.advance(SwitchPhase::Failed);
            error!("Switch to '{}' failed: {}", id, err);
            return Ok(result(&steps, SwitchOutcome::Failed, false));
        }

        if !wait {
            info!("Switch to '{}' started, not waiting for readiness", id);
            return Ok(result(&steps, SwitchOutcome::Started, false));
        }

        lease.advance(SwitchPhase::Polling);
        let deadline = started + budget;
        if self.poll_until_ready(deadline).await {
            lease.advance(SwitchPhase::Ready);
            Ok(result(&steps, SwitchOutcome::Ready, true))
        } else {
            lease.advance(SwitchPhase::TimedOut);
            warn!(
                "Switch to '{}': control port not ready within {:?}",
                id, budget
            );
            Ok(result(&steps, SwitchOutcome::TimedOut, false))
        }
    }

    /// Probes at least once, even when activation used up the whole budget.
    async fn poll_until_ready(&self, deadline: Instant) -> bool {
        let mut interval = self.policy.interval;
        let mut attempt = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let probe_timeout = if attempt == 0 {
                self.policy.probe_timeout
            } else if remaining.is_zero() {
                return false;
            } else {
                self.policy.probe_timeout.min(remaining)
            };
            attempt += 1;
            if self.probe.probe(probe_timeout).await {
                debug!("Control port ready after {} probes", attempt);
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(jittered(interval).min(remaining)).await;
            interval = self.policy.next_interval(interval);
        }
    }
}

async fn activate_and_restart(store: &dyn ProfileStore, id: &str, lease: &SwitchLease) -> Steps {
    if let Err(e) = store.activate(id).await {
        let error = match e {
            ControlError::ActivationFailed { .. } => e,
            other => ControlError::ActivationFailed {
                id: id.to_string(),
                reason: other.to_string(),
            },
        };
        return Steps {
            activated: false,
            restarted: false,
            error: Some(error),
        };
    }

    lease.advance(SwitchPhase::Restarting);
    if let Err(e) = store.restart().await {
        let error = match e {
            ControlError::RestartFailed(_) => e,
            other => ControlError::RestartFailed(other.to_string()),
        };
        return Steps {
            activated: true,
            restarted: false,
            error: Some(error),
        };
    }

    Steps {
        activated: true,
        restarted: true,
        error: None,
    }
}

/// Adds up to 10% so several waiters do not probe in lockstep.
fn jittered(interval: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.1);
    interval.mul_f64(factor)
}
