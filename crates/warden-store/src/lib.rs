//! Transactional registry store for the warden service registry.
//!
//! Owns the four durable tables: the endpoint registry and the three
//! append-only logs (health checks, failover events, rotation audits).
//! The trait exposes one method per query pattern; every compound mutation
//! (probe recording, active-flag flips, decommission cascades, rotations)
//! is a single atomic store call — either all of its writes persist or none.
//!
//! Backends: [`SqliteStore`] for durable deployments, [`MemoryStore`] for
//! tests and ephemeral runs. Both enforce identical semantics.

#![forbid(unsafe_code)]

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use warden_proto::{
    Endpoint, FailoverEvent, HealthCheckRecord, ProbeOutcome, RotationAudit, ServiceKind,
    TransitionKind,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    /// (name, kind, url) already taken by a non-deleted row.
    #[error("duplicate endpoint: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The mutation would break a registry invariant (e.g. two active
    /// endpoints in one failover group). The transaction was rolled back.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

// ─── Compound operation inputs ───────────────────────────────────────────────

/// Patchable endpoint fields for the update operation.
#[derive(Debug, Clone, Default)]
pub struct EndpointPatch {
    pub version: Option<String>,
    pub url: Option<String>,
    pub health_check_url: Option<String>,
    pub priority: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl EndpointPatch {
    pub fn is_empty(&self) -> bool {
        self.version.is_none()
            && self.url.is_none()
            && self.health_check_url.is_none()
            && self.priority.is_none()
            && self.metadata.is_none()
    }
}

/// One probe outcome, applied to the endpoint row and the health log in a
/// single transaction.
#[derive(Debug, Clone)]
pub struct ProbeRecord {
    pub timestamp: DateTime<Utc>,
    pub outcome: ProbeOutcome,
    pub response_time_ms: i64,
    pub http_status_code: Option<u16>,
    pub error_message: Option<String>,
    pub checked_by: String,
}

/// Result of applying a probe: the updated row plus whether the endpoint's
/// status flipped (the failover manager only evaluates on flips).
#[derive(Debug, Clone)]
pub struct ProbeApplied {
    pub endpoint: Endpoint,
    pub previous_status: warden_proto::EndpointStatus,
    pub status_changed: bool,
}

/// An active-flag transition within a failover group: demote one endpoint,
/// promote another, append the event — atomically.
#[derive(Debug, Clone)]
pub struct Transition {
    pub failover_group: String,
    pub service_kind: ServiceKind,
    pub demote_id: String,
    pub promote_id: String,
    pub kind: TransitionKind,
    pub reason: String,
    pub automatic: bool,
}

/// An endpoint rotation: decommission the old endpoint, adopt the new one
/// into its failover group (transferring the active flag if held), append
/// the audit row — atomically.
#[derive(Debug, Clone)]
pub struct Rotation {
    pub old_id: String,
    pub new_id: String,
    pub reason: String,
    pub requested_by: String,
    pub verification_hash: String,
    /// Verified RSA proof, persisted onto the new endpoint.
    pub signature: String,
}

// ─── Store trait ─────────────────────────────────────────────────────────────

/// Registry persistence. One method per query pattern; compound mutations
/// are atomic.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Insert a freshly registered endpoint.
    ///
    /// The store decides the initial `is_active` flag: the endpoint becomes
    /// active iff its (failover_group, kind) currently has no active live
    /// member. Fails with [`StoreError::Duplicate`] when (name, kind, url)
    /// collides with a non-deleted row. Returns the row as persisted.
    async fn insert_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint, StoreError>;

    async fn endpoint(&self, id: &str) -> Result<Endpoint, StoreError>;

    /// All non-deleted, non-decommissioned endpoints (the health loop's
    /// working set), ordered by id.
    async fn live_endpoints(&self) -> Result<Vec<Endpoint>, StoreError>;

    /// Live endpoints of one kind, ordered by (priority desc,
    /// health_check_count desc, id asc). `only_healthy` filters to
    /// `status=healthy`.
    async fn endpoints_by_kind(
        &self,
        kind: ServiceKind,
        only_healthy: bool,
    ) -> Result<Vec<Endpoint>, StoreError>;

    /// All non-deleted endpoints sharing a failover group, decommissioned
    /// included (callers filter), ordered by id.
    async fn group_endpoints(&self, group: &str) -> Result<Vec<Endpoint>, StoreError>;

    /// Diagnostic listing with visibility toggles, ordered by id.
    async fn all_endpoints(
        &self,
        include_deleted: bool,
        include_decommissioned: bool,
    ) -> Result<Vec<Endpoint>, StoreError>;

    /// Patch named fields on a non-deleted endpoint.
    async fn update_endpoint(
        &self,
        id: &str,
        patch: EndpointPatch,
    ) -> Result<Endpoint, StoreError>;

    /// Append the health-check row and update the endpoint's counters in
    /// one transaction.
    ///
    /// Healthy: `status=healthy`, `failed_health_count=0`. Unhealthy:
    /// `failed_health_count += 1`, and `status=unhealthy` once the counter
    /// reaches `failure_threshold`. `health_check_count` always increments.
    async fn record_probe(
        &self,
        endpoint_id: &str,
        probe: ProbeRecord,
        failure_threshold: u32,
    ) -> Result<ProbeApplied, StoreError>;

    /// Most recent health checks for an endpoint, newest first.
    async fn recent_checks(
        &self,
        endpoint_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthCheckRecord>, StoreError>;

    /// Atomically flip the active flag from one endpoint to another and
    /// append the failover event. Rolls back wholly on any failure and
    /// enforces the at-most-one-active-per-group invariant.
    async fn apply_failover(&self, transition: Transition) -> Result<FailoverEvent, StoreError>;

    async fn latest_failover_event(
        &self,
        group: &str,
    ) -> Result<Option<FailoverEvent>, StoreError>;

    /// Most recent failover events for a group, newest first.
    async fn failover_events(
        &self,
        group: &str,
        limit: usize,
    ) -> Result<Vec<FailoverEvent>, StoreError>;

    /// Decommission an endpoint, optionally promoting a replacement in the
    /// same transaction (used when the decommissioned endpoint was active).
    async fn decommission_endpoint(
        &self,
        id: &str,
        replacement: Option<Transition>,
    ) -> Result<Endpoint, StoreError>;

    /// Execute a verified rotation in one transaction: decommission the old
    /// endpoint, move the new endpoint into its group (adopting the active
    /// flag iff the old endpoint held it), append the success audit.
    async fn apply_rotation(&self, rotation: Rotation) -> Result<RotationAudit, StoreError>;

    /// Append a rotation-audit row directly. Used for failed gate attempts,
    /// which must be audited without mutating any endpoint.
    async fn append_rotation_audit(&self, audit: RotationAudit) -> Result<(), StoreError>;

    /// Most recent rotation audits, newest first.
    async fn rotation_audits(&self, limit: usize) -> Result<Vec<RotationAudit>, StoreError>;
}

// ─── Shared helpers ──────────────────────────────────────────────────────────

/// Discovery ordering: priority desc, then health_check_count desc, then id
/// asc. Deterministic for equal keys.
pub(crate) fn discovery_order(a: &Endpoint, b: &Endpoint) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(b.health_check_count.cmp(&a.health_check_count))
        .then(a.id.cmp(&b.id))
}

/// Apply a probe outcome to an endpoint row. Pure; shared by both backends
/// so counter semantics cannot drift.
pub(crate) fn apply_probe_to_endpoint(
    endpoint: &mut Endpoint,
    probe: &ProbeRecord,
    failure_threshold: u32,
) {
    use warden_proto::EndpointStatus;

    endpoint.last_health_check = Some(probe.timestamp);
    endpoint.health_check_count += 1;

    match probe.outcome {
        ProbeOutcome::Healthy => {
            endpoint.failed_health_count = 0;
            endpoint.status = EndpointStatus::Healthy;
        }
        ProbeOutcome::Unhealthy => {
            endpoint.failed_health_count += 1;
            if endpoint.failed_health_count >= i64::from(failure_threshold) {
                endpoint.status = EndpointStatus::Unhealthy;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_proto::{EndpointRole, EndpointStatus};

    fn endpoint(id: &str, priority: i64, count: i64) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            name: format!("svc-{id}"),
            kind: ServiceKind::Authentication,
            version: "1.0.0".to_string(),
            url: format!("http://{id}:8081"),
            health_check_url: format!("http://{id}:8081/health"),
            public_key: String::new(),
            signature: String::new(),
            certificate: None,
            role: EndpointRole::Primary,
            failover_group: "g1".to_string(),
            is_active: false,
            priority,
            status: EndpointStatus::Healthy,
            metadata: serde_json::Value::Null,
            registered_by: "test".to_string(),
            registered_at: Utc::now(),
            last_health_check: None,
            health_check_count: count,
            failed_health_count: 0,
            last_failover_at: None,
            deleted: false,
        }
    }

    #[test]
    fn discovery_order_priority_then_count_then_id() {
        let mut eps = vec![
            endpoint("c", 5, 100),
            endpoint("a", 10, 1),
            endpoint("b", 5, 100),
            endpoint("d", 5, 200),
        ];
        eps.sort_by(discovery_order);
        let ids: Vec<&str> = eps.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["a", "d", "b", "c"]);
    }

    #[test]
    fn probe_application_healthy_resets_failures() {
        let mut ep = endpoint("a", 1, 7);
        ep.failed_health_count = 2;
        ep.status = EndpointStatus::Healthy;

        let probe = ProbeRecord {
            timestamp: Utc::now(),
            outcome: ProbeOutcome::Healthy,
            response_time_ms: 12,
            http_status_code: Some(200),
            error_message: None,
            checked_by: "test".to_string(),
        };
        apply_probe_to_endpoint(&mut ep, &probe, 3);

        assert_eq!(ep.failed_health_count, 0);
        assert_eq!(ep.health_check_count, 8);
        assert_eq!(ep.status, EndpointStatus::Healthy);
    }

    #[test]
    fn probe_application_flips_at_exact_threshold() {
        let mut ep = endpoint("a", 1, 0);
        ep.status = EndpointStatus::Healthy;

        let probe = ProbeRecord {
            timestamp: Utc::now(),
            outcome: ProbeOutcome::Unhealthy,
            response_time_ms: 0,
            http_status_code: Some(500),
            error_message: None,
            checked_by: "test".to_string(),
        };

        apply_probe_to_endpoint(&mut ep, &probe, 3);
        assert_eq!(ep.status, EndpointStatus::Healthy);
        apply_probe_to_endpoint(&mut ep, &probe, 3);
        assert_eq!(ep.status, EndpointStatus::Healthy);
        apply_probe_to_endpoint(&mut ep, &probe, 3);
        assert_eq!(ep.status, EndpointStatus::Unhealthy);
        assert_eq!(ep.failed_health_count, 3);
    }

    #[test]
    fn probe_application_first_probe_promotes_registering() {
        let mut ep = endpoint("a", 1, 0);
        ep.status = EndpointStatus::Registering;

        let probe = ProbeRecord {
            timestamp: Utc::now(),
            outcome: ProbeOutcome::Healthy,
            response_time_ms: 5,
            http_status_code: Some(204),
            error_message: None,
            checked_by: "test".to_string(),
        };
        apply_probe_to_endpoint(&mut ep, &probe, 3);
        assert_eq!(ep.status, EndpointStatus::Healthy);
    }
}
