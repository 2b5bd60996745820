//! Failover and failback orchestration.
//!
//! Enforces the single-active invariant per (failover_group, kind): when the
//! active endpoint turns unhealthy the best healthy peer is promoted in one
//! store transaction, and a recovered primary is failed back once it has
//! been stable long enough and the group's cooldown has elapsed.
//!
//! Transitions within one failover group are serialized by a keyed async
//! mutex; distinct groups proceed in parallel. Store-level row locking is
//! deliberately not used — the registry is a single-writer process.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use warden_health::ProbeSink;
use warden_proto::{
    Endpoint, EndpointRole, EndpointStatus, FailoverEvent, ProbeOutcome, TransitionKind,
};
use warden_store::{ProbeApplied, RegistryStore, StoreError, Transition};

// ─── Policy ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    /// Consecutive healthy probes a recovered primary must accumulate
    /// before failback.
    pub stability_count: u32,
    /// Cooldown since the group's most recent transition before failback.
    pub failback_delay: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            stability_count: 3,
            failback_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ─── Pure decision helpers ───────────────────────────────────────────────────

/// Candidate ordering: priority desc, health_check_count desc, id asc.
/// Deterministic for equal keys.
pub fn candidate_order(a: &Endpoint, b: &Endpoint) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(b.health_check_count.cmp(&a.health_check_count))
        .then(a.id.cmp(&b.id))
}

/// True once at least `delay` has elapsed since `last_transition`.
/// The boundary is inclusive: failback is permitted at exactly the delay.
pub fn cooldown_elapsed(last_transition: DateTime<Utc>, now: DateTime<Utc>, delay: Duration) -> bool {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    now - last_transition >= delay
}

/// Select the best failover candidate among a failing endpoint's group
/// peers: healthy, live, and of the opposite role when the failing endpoint
/// is a primary (a failing active backup may hand off to any healthy peer).
pub fn select_candidate<'a>(failing: &Endpoint, peers: &'a [Endpoint]) -> Option<&'a Endpoint> {
    let mut candidates: Vec<&Endpoint> = peers
        .iter()
        .filter(|p| p.id != failing.id && p.is_live() && p.kind == failing.kind)
        .filter(|p| p.status == EndpointStatus::Healthy)
        .filter(|p| failing.role != EndpointRole::Primary || p.role == EndpointRole::Backup)
        .collect();
    candidates.sort_by(|a, b| candidate_order(a, b));
    candidates.first().copied()
}

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct FailoverManager {
    store: Arc<dyn RegistryStore>,
    policy: FailoverPolicy,
    /// Keyed per-group locks. The map itself is guarded by a sync mutex;
    /// the inner async mutex is held across store awaits.
    group_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Consecutive-healthy counters, reset on any unhealthy probe.
    stability: parking_lot::Mutex<HashMap<String, u32>>,
}

impl FailoverManager {
    pub fn new(store: Arc<dyn RegistryStore>, policy: FailoverPolicy) -> Self {
        Self {
            store,
            policy,
            group_locks: parking_lot::Mutex::new(HashMap::new()),
            stability: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn group_lock(&self, group: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.group_locks.lock();
        Arc::clone(locks.entry(group.to_string()).or_default())
    }

    /// Fold one probe outcome into the endpoint's stability counter.
    pub fn note_probe(&self, endpoint_id: &str, outcome: ProbeOutcome) {
        let mut stability = self.stability.lock();
        match outcome {
            ProbeOutcome::Healthy => {
                *stability.entry(endpoint_id.to_string()).or_insert(0) += 1;
            }
            ProbeOutcome::Unhealthy => {
                stability.insert(endpoint_id.to_string(), 0);
            }
        }
    }

    pub fn stability_of(&self, endpoint_id: &str) -> u32 {
        *self.stability.lock().get(endpoint_id).unwrap_or(&0)
    }

    /// Reconstruct stability counters from the health log. Called once at
    /// startup so failback gating does not assume in-memory continuity
    /// across restarts.
    pub async fn rebuild_stability(&self) -> Result<(), StoreError> {
        let endpoints = self.store.live_endpoints().await?;
        let mut rebuilt = HashMap::new();
        for endpoint in &endpoints {
            let checks = self
                .store
                .recent_checks(&endpoint.id, self.policy.stability_count as usize)
                .await?;
            let streak = checks
                .iter()
                .take_while(|c| c.outcome == ProbeOutcome::Healthy)
                .count() as u32;
            rebuilt.insert(endpoint.id.clone(), streak);
        }
        info!(endpoints = rebuilt.len(), "stability counters rebuilt from health log");
        *self.stability.lock() = rebuilt;
        Ok(())
    }

    /// Evaluate an endpoint for a transition, serialized per failover group.
    ///
    /// The endpoint is refetched under the group lock, so decisions are made
    /// on the freshest row even when probes and API calls race.
    pub async fn evaluate(
        &self,
        endpoint_id: &str,
        group: &str,
    ) -> Result<Option<FailoverEvent>, FailoverError> {
        let lock = self.group_lock(group);
        let _guard = lock.lock().await;

        let endpoint = self.store.endpoint(endpoint_id).await?;
        if !endpoint.is_live() {
            return Ok(None);
        }

        if endpoint.status == EndpointStatus::Unhealthy && endpoint.is_active {
            return self.try_failover(&endpoint).await;
        }
        if endpoint.status == EndpointStatus::Healthy
            && endpoint.role == EndpointRole::Primary
            && !endpoint.is_active
        {
            return self.try_failback(&endpoint).await;
        }
        Ok(None)
    }

    /// Elect a replacement for an endpoint being decommissioned, without
    /// applying it — the decommission transaction applies both together.
    pub async fn elect_replacement(
        &self,
        endpoint: &Endpoint,
        reason: &str,
    ) -> Result<Option<Transition>, FailoverError> {
        let peers = self.store.group_endpoints(&endpoint.failover_group).await?;
        Ok(select_candidate(endpoint, &peers).map(|candidate| Transition {
            failover_group: endpoint.failover_group.clone(),
            service_kind: endpoint.kind,
            demote_id: endpoint.id.clone(),
            promote_id: candidate.id.clone(),
            kind: TransitionKind::Failover,
            reason: reason.to_string(),
            automatic: false,
        }))
    }

    async fn try_failover(&self, failing: &Endpoint) -> Result<Option<FailoverEvent>, FailoverError> {
        let peers = self.store.group_endpoints(&failing.failover_group).await?;
        let Some(candidate) = select_candidate(failing, &peers) else {
            warn!(
                endpoint = %failing.id,
                group = %failing.failover_group,
                "no healthy failover candidate; group is degraded"
            );
            return Ok(None);
        };

        let transition = Transition {
            failover_group: failing.failover_group.clone(),
            service_kind: failing.kind,
            demote_id: failing.id.clone(),
            promote_id: candidate.id.clone(),
            kind: TransitionKind::Failover,
            reason: format!(
                "{} consecutive failed health checks",
                failing.failed_health_count
            ),
            automatic: true,
        };

        match self.store.apply_failover(transition).await {
            Ok(event) => {
                info!(
                    group = %event.failover_group,
                    from = %event.old_endpoint_id,
                    to = %event.new_endpoint_id,
                    "failover complete"
                );
                Ok(Some(event))
            }
            Err(e) => {
                // The transaction rolled back: the failing endpoint is still
                // the active one, which beats leaving the group with none.
                error!(
                    endpoint = %failing.id,
                    group = %failing.failover_group,
                    error = %e,
                    "failover transaction failed; group left in pre-transition state"
                );
                Err(e.into())
            }
        }
    }

    async fn try_failback(&self, primary: &Endpoint) -> Result<Option<FailoverEvent>, FailoverError> {
        let stability = self.stability_of(&primary.id);
        if stability < self.policy.stability_count {
            debug!(
                endpoint = %primary.id,
                stability,
                required = self.policy.stability_count,
                "failback deferred: stability window not met"
            );
            return Ok(None);
        }

        if let Some(event) = self
            .store
            .latest_failover_event(&primary.failover_group)
            .await?
        {
            if !cooldown_elapsed(event.timestamp, Utc::now(), self.policy.failback_delay) {
                debug!(
                    endpoint = %primary.id,
                    group = %primary.failover_group,
                    "failback deferred: cooldown window not met"
                );
                return Ok(None);
            }
        }

        let peers = self.store.group_endpoints(&primary.failover_group).await?;
        let Some(active) = peers
            .iter()
            .find(|p| p.id != primary.id && p.is_active && p.is_live() && p.kind == primary.kind)
        else {
            warn!(
                endpoint = %primary.id,
                group = %primary.failover_group,
                "failback skipped: no active peer to demote"
            );
            return Ok(None);
        };

        let transition = Transition {
            failover_group: primary.failover_group.clone(),
            service_kind: primary.kind,
            demote_id: active.id.clone(),
            promote_id: primary.id.clone(),
            kind: TransitionKind::Failback,
            reason: format!("primary recovered: {stability} consecutive healthy checks"),
            automatic: true,
        };

        match self.store.apply_failover(transition).await {
            Ok(event) => {
                self.stability.lock().insert(primary.id.clone(), 0);
                info!(
                    group = %event.failover_group,
                    from = %event.old_endpoint_id,
                    to = %event.new_endpoint_id,
                    "failback complete"
                );
                Ok(Some(event))
            }
            Err(e) => {
                error!(
                    endpoint = %primary.id,
                    group = %primary.failover_group,
                    error = %e,
                    "failback transaction failed; group left in pre-transition state"
                );
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl ProbeSink for FailoverManager {
    async fn on_probe(&self, applied: &ProbeApplied) {
        let endpoint = &applied.endpoint;
        // A healthy probe resets failed_health_count to zero in the same
        // transaction, so the counter tells us what this probe was even
        // while the status lags behind the failure threshold.
        let outcome = if endpoint.failed_health_count == 0 {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::Unhealthy
        };
        self.note_probe(&endpoint.id, outcome);

        // Cheap pre-filter before taking the group lock. Unhealthy-active
        // endpoints are re-evaluated on every probe so a degraded group
        // recovers as soon as a candidate turns healthy; inactive primaries
        // are re-evaluated so the stability window can mature.
        let worth_evaluating = (endpoint.status == EndpointStatus::Unhealthy && endpoint.is_active)
            || (endpoint.status == EndpointStatus::Healthy
                && endpoint.role == EndpointRole::Primary
                && !endpoint.is_active);
        if !worth_evaluating {
            return;
        }

        if let Err(e) = self.evaluate(&endpoint.id, &endpoint.failover_group).await {
            error!(endpoint = %endpoint.id, error = %e, "transition evaluation failed");
        }
    }
}
