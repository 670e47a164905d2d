//! Circuit breakers for external resources.
//!
//! Each resource (a platform, an API, a hook) has a breaker:
//!
//! - **closed** → **open** after `failure_threshold` consecutive failures;
//! - **open** → **half-open** on a successful probe once the cooldown has
//!   elapsed (a success during cooldown leaves it open);
//! - **half-open** → **closed** on one more success, or straight back to
//!   **open** on any failure.
//!
//! A failure while open restarts the cooldown. Entries are created lazily
//! and never deleted.
//!
//! Recovery probing runs on a background task during the pass, so an open
//! resource can recover without waiting for the next full health check.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CircuitConfig;
use crate::process::{self, ProcessSpec};
use crate::util::tail_excerpt;
use crate::{klog, klog_debug, klog_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        })
    }
}

/// Persisted health of one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitState {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Thresholds applied to every breaker in a registry.
#[derive(Debug, Clone, Copy)]
pub struct CircuitPolicy {
    pub failure_threshold: u32,
    pub cooldown: chrono::Duration,
}

impl From<&CircuitConfig> for CircuitPolicy {
    fn from(config: &CircuitConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: chrono::Duration::seconds(config.cooldown_secs),
        }
    }
}

/// A state change worth logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub resource: String,
    pub from: BreakerState,
    pub to: BreakerState,
}

/// Three-valued platform classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformHealth {
    Healthy,
    /// Usable, but its health endpoint is failing; ranked behind healthy.
    Degraded,
    Unavailable,
}

/// Collaborator-reported access and health for a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformProbe {
    pub id: String,
    pub credentials_ok: bool,
    /// `None` when the platform has no health endpoint.
    #[serde(default)]
    pub health_ok: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformEligibility {
    pub id: String,
    pub health: PlatformHealth,
    pub circuit: BreakerState,
}

/// Result of one background recovery probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub resource: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CircuitRegistry {
    circuits: BTreeMap<String, CircuitState>,
    policy: CircuitPolicy,
}

impl CircuitRegistry {
    pub fn new(policy: CircuitPolicy) -> Self {
        Self::from_records(BTreeMap::new(), policy)
    }

    pub fn from_records(circuits: BTreeMap<String, CircuitState>, policy: CircuitPolicy) -> Self {
        Self { circuits, policy }
    }

    /// The persisted form: resource id to state.
    pub fn records(&self) -> &BTreeMap<String, CircuitState> {
        &self.circuits
    }

    pub fn get(&self, resource: &str) -> Option<&CircuitState> {
        self.circuits.get(resource)
    }

    pub fn state_of(&self, resource: &str) -> BreakerState {
        self.get(resource).map(|c| c.state).unwrap_or_default()
    }

    fn cooldown_elapsed(&self, circuit: &CircuitState, now: DateTime<Utc>) -> bool {
        circuit
            .opened_at
            .map(|at| now - at >= self.policy.cooldown)
            .unwrap_or(true)
    }

    /// Closed and half-open resources may be used.
    pub fn is_usable(&self, resource: &str) -> bool {
        self.state_of(resource) != BreakerState::Open
    }

    /// Open resources whose cooldown has elapsed, ready for a probe.
    pub fn recovery_candidates(&self, now: DateTime<Utc>) -> Vec<String> {
        self.circuits
            .iter()
            .filter(|(_, c)| c.state == BreakerState::Open && self.cooldown_elapsed(c, now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn record_success(&mut self, resource: &str, now: DateTime<Utc>) -> Option<Transition> {
        let policy = self.policy;
        let circuit = self.circuits.entry(resource.to_string()).or_default();
        let from = circuit.state;
        circuit.total_successes += 1;

        match circuit.state {
            BreakerState::Closed => {
                circuit.consecutive_failures = 0;
            }
            BreakerState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|at| now - at >= policy.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    circuit.state = BreakerState::HalfOpen;
                    circuit.half_open_at = Some(now);
                } else {
                    klog_debug!("Circuit {} probe succeeded during cooldown; staying open", resource);
                }
            }
            BreakerState::HalfOpen => {
                circuit.state = BreakerState::Closed;
                circuit.consecutive_failures = 0;
                circuit.opened_at = None;
                circuit.half_open_at = None;
            }
        }
        transition(resource, from, circuit.state)
    }

    pub fn record_failure(
        &mut self,
        resource: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        let threshold = self.policy.failure_threshold;
        let circuit = self.circuits.entry(resource.to_string()).or_default();
        let from = circuit.state;
        circuit.total_failures += 1;
        circuit.consecutive_failures += 1;
        circuit.last_error = Some(tail_excerpt(error, 200));

        match circuit.state {
            BreakerState::Closed => {
                if circuit.consecutive_failures >= threshold {
                    circuit.state = BreakerState::Open;
                    circuit.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                circuit.state = BreakerState::Open;
                circuit.opened_at = Some(now);
                circuit.half_open_at = None;
            }
            BreakerState::Open => {
                circuit.opened_at = Some(now);
            }
        }
        transition(resource, from, circuit.state)
    }

    /// Classify a platform from its access, probe result and breaker.
    pub fn check_platform_health(&self, probe: &PlatformProbe) -> PlatformHealth {
        if !probe.credentials_ok || !self.is_usable(&probe.id) {
            return PlatformHealth::Unavailable;
        }
        match probe.health_ok {
            Some(false) => PlatformHealth::Degraded,
            _ => PlatformHealth::Healthy,
        }
    }

    /// Eligible platforms, healthy before degraded, input order otherwise.
    pub fn rank_platforms(&self, probes: &[PlatformProbe]) -> Vec<PlatformEligibility> {
        let mut ranked: Vec<PlatformEligibility> = probes
            .iter()
            .map(|p| PlatformEligibility {
                id: p.id.clone(),
                health: self.check_platform_health(p),
                circuit: self.state_of(&p.id),
            })
            .filter(|e| e.health != PlatformHealth::Unavailable)
            .collect();
        ranked.sort_by_key(|e| e.health);
        ranked
    }

    /// Apply background probe results.
    pub fn apply_probe_outcomes(
        &mut self,
        outcomes: &[ProbeOutcome],
        now: DateTime<Utc>,
    ) -> Vec<Transition> {
        outcomes
            .iter()
            .filter_map(|o| {
                if o.ok {
                    self.record_success(&o.resource, now)
                } else {
                    let error = o.error.as_deref().unwrap_or("probe failed");
                    self.record_failure(&o.resource, error, now)
                }
            })
            .collect()
    }
}

fn transition(resource: &str, from: BreakerState, to: BreakerState) -> Option<Transition> {
    if from == to {
        return None;
    }
    klog!("Circuit {}: {} -> {}", resource, from, to);
    Some(Transition {
        resource: resource.to_string(),
        from,
        to,
    })
}

/// Probe the given resources on a background task.
///
/// `probes` pairs each resource with its shell probe command. Resources
/// without a configured command are not probed.
pub fn spawn_recovery_probes(
    probes: Vec<(String, String)>,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<Vec<ProbeOutcome>> {
    tokio::spawn(async move {
        let runs = probes.into_iter().map(|(resource, command)| {
            let cancel = cancel.clone();
            async move {
                let spec = match ProcessSpec::shell(&command, timeout) {
                    Ok(spec) => spec,
                    Err(e) => {
                        klog_warn!("Recovery probe for {} not runnable: {}", resource, e);
                        return ProbeOutcome {
                            resource,
                            ok: false,
                            error: Some(e.to_string()),
                        };
                    }
                };
                let out = process::run(&spec, &cancel).await;
                ProbeOutcome {
                    ok: out.success(),
                    error: (!out.success()).then(|| tail_excerpt(&out.combined(), 200)),
                    resource,
                }
            }
        });
        join_all(runs).await
    })
}
