// Integration health monitor.
//
// A small per-integration state machine driving adaptive re-check
// cadence. States live in process memory only; the map is rebuildable
// from zero at any time and is an alerting signal, not a source of
// truth. The pure pieces (update, status derivation, backoff) are free
// functions; `HealthMonitor` wraps them in a concurrency-safe map.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lazy_static::lazy_static;
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{SyncError, SyncResult};
use crate::models::{CalendarIntegration, Provider};
use crate::providers::AdapterRegistry;
use crate::utils::logging::log_health_transition;

pub const MIN_BACKOFF_MS: u64 = 5 * 60 * 1000;
pub const MAX_BACKOFF_MS: u64 = 60 * 60 * 1000;
/// Jitter applied around a scheduled re-check so recovering
/// integrations do not stampede the providers in lockstep.
pub const CHECK_JITTER_MS: i64 = 30_000;

const UNHEALTHY_FAILURE_THRESHOLD: u32 = 3;
const HEALTHY_SUCCESS_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    TransientError,
    HardError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Transient,
    Hard,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthState {
    pub failures: u32,
    pub successes: u32,
    pub status: HealthStatus,
    pub backoff_ms: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error_class: Option<ErrorClass>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            failures: 0,
            successes: 0,
            status: HealthStatus::Degraded,
            backoff_ms: MIN_BACKOFF_MS,
            last_check: None,
            last_error_class: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    InitialFailure,
    BecameUnhealthy,
    BecameHealthy,
    BecameDegraded,
    NoChange,
}

/// Transition report for alerting: the kind plus both statuses, so a
/// consumer never has to reconstruct where the integration came from.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub kind: TransitionKind,
    pub previous: HealthStatus,
    pub current: HealthStatus,
}

/// Apply one check outcome to the state machine.
///
/// Transient errors are expected noise: they record the error class and
/// touch nothing else. Hard errors and successes move the counters and
/// re-derive the status.
pub fn update(state: &mut HealthState, outcome: Outcome) -> StatusTransition {
    let previous = state.status;
    let previous_failures = state.failures;

    match outcome {
        Outcome::Success => {
            state.failures = 0;
            state.successes += 1;
        }
        Outcome::TransientError => {
            state.last_error_class = Some(ErrorClass::Transient);
            return StatusTransition {
                kind: TransitionKind::NoChange,
                previous,
                current: previous,
            };
        }
        Outcome::HardError => {
            state.failures += 1;
            state.successes = 0;
            state.last_error_class = Some(ErrorClass::Hard);
        }
    }

    state.status = derive_status(state);
    StatusTransition {
        kind: classify_transition(previous, state.status, outcome, previous_failures),
        previous,
        current: state.status,
    }
}

fn derive_status(state: &HealthState) -> HealthStatus {
    if state.failures >= UNHEALTHY_FAILURE_THRESHOLD {
        HealthStatus::Unhealthy
    } else if state.successes >= HEALTHY_SUCCESS_THRESHOLD {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

fn classify_transition(
    previous: HealthStatus,
    current: HealthStatus,
    outcome: Outcome,
    previous_failures: u32,
) -> TransitionKind {
    if current == HealthStatus::Unhealthy && previous != HealthStatus::Unhealthy {
        TransitionKind::BecameUnhealthy
    } else if current == HealthStatus::Healthy && previous != HealthStatus::Healthy {
        TransitionKind::BecameHealthy
    } else if current == HealthStatus::Degraded && previous != HealthStatus::Degraded {
        TransitionKind::BecameDegraded
    } else if outcome == Outcome::HardError && previous_failures == 0 {
        TransitionKind::InitialFailure
    } else {
        TransitionKind::NoChange
    }
}

/// True when the integration was never checked or the backoff interval
/// has elapsed since the last check.
pub fn due_for_check(state: &HealthState, now: DateTime<Utc>) -> bool {
    match state.last_check {
        None => true,
        Some(last_check) => now - last_check >= ChronoDuration::milliseconds(state.backoff_ms as i64),
    }
}

/// Double the interval, clamped to [5 min, 60 min].
pub fn next_backoff(current_ms: u64) -> u64 {
    current_ms.saturating_mul(2).clamp(MIN_BACKOFF_MS, MAX_BACKOFF_MS)
}

/// The actual wait before the next check: the backoff plus ±30 s of
/// random jitter.
pub fn jittered_interval_ms(backoff_ms: u64) -> u64 {
    let jitter = rand::thread_rng().gen_range(-CHECK_JITTER_MS..=CHECK_JITTER_MS);
    (backoff_ms as i64 + jitter).max(0) as u64
}

pub type HealthKey = (Provider, i64);

/// Process-local health map. Updates are atomic per key: every
/// read-modify-write happens under the map's write lock, so concurrent
/// success/failure reports for the same integration never lose updates.
pub struct HealthMonitor {
    states: RwLock<HashMap<HealthKey, HealthState>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Record a check outcome and reschedule the integration: success
    /// returns the cadence to the minimum, a hard failure doubles it.
    pub async fn record(
        &self,
        provider: Provider,
        integration_id: i64,
        outcome: Outcome,
    ) -> StatusTransition {
        let mut states = self.states.write().await;
        let state = states.entry((provider, integration_id)).or_default();

        let transition = update(state, outcome);
        state.last_check = Some(Utc::now());
        match outcome {
            Outcome::Success => state.backoff_ms = MIN_BACKOFF_MS,
            Outcome::HardError => state.backoff_ms = next_backoff(state.backoff_ms),
            Outcome::TransientError => {}
        }

        if transition.kind != TransitionKind::NoChange {
            log_health_transition(provider.as_str(), integration_id, &transition);
        }
        transition
    }

    /// Report a sync error against the integration. `RefreshInProgress`
    /// is not a health signal and is ignored.
    pub async fn record_error(
        &self,
        provider: Provider,
        integration_id: i64,
        error: &SyncError,
    ) -> Option<StatusTransition> {
        if matches!(error, SyncError::RefreshInProgress) {
            return None;
        }
        let outcome = if error.is_hard() {
            Outcome::HardError
        } else {
            Outcome::TransientError
        };
        Some(self.record(provider, integration_id, outcome).await)
    }

    /// Lightweight connectivity probe through the provider adapter,
    /// recorded like any other check.
    pub async fn probe(
        &self,
        registry: &AdapterRegistry,
        integration: &CalendarIntegration,
    ) -> SyncResult<StatusTransition> {
        let provider = integration.provider()?;
        let id = integration
            .id
            .ok_or_else(|| SyncError::configuration("cannot probe an unsaved integration"))?;
        let adapter = registry.get(provider)?;

        let outcome = match adapter.test_connection(integration).await {
            Ok(_) => Outcome::Success,
            Err(e) => {
                log::debug!(
                    "Probe of {}/{} failed ({}): {}",
                    provider.as_str(),
                    id,
                    e.class(),
                    e
                );
                if e.is_hard() {
                    Outcome::HardError
                } else {
                    Outcome::TransientError
                }
            }
        };

        Ok(self.record(provider, id, outcome).await)
    }

    pub async fn snapshot(&self, provider: Provider, integration_id: i64) -> Option<HealthState> {
        self.states
            .read()
            .await
            .get(&(provider, integration_id))
            .cloned()
    }

    /// Keys whose re-check interval has elapsed.
    pub async fn due_integrations(&self, now: DateTime<Utc>) -> Vec<HealthKey> {
        self.states
            .read()
            .await
            .iter()
            .filter(|(_, state)| due_for_check(state, now))
            .map(|(key, _)| *key)
            .collect()
    }

    pub async fn all_states(&self) -> HashMap<HealthKey, HealthState> {
        self.states.read().await.clone()
    }
}

lazy_static! {
    static ref GLOBAL_MONITOR: HealthMonitor = HealthMonitor::new();
}

/// The process-wide monitor used when no explicit instance is injected.
pub fn health_monitor() -> &'static HealthMonitor {
    &GLOBAL_MONITOR
}
