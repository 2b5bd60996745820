//! Discovery API for the warden service registry.
//!
//! The [`Discovery`] façade composes the store, signer, health checker, and
//! failover manager behind the public operations: register, discover, list,
//! update, decommission, health history, and rotate. Every mutating
//! operation is gated by the admin-token policy; rotation additionally runs
//! the multi-layer verification chain and audits every attempt, failed ones
//! included.

#![forbid(unsafe_code)]

pub mod error;
pub mod http;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use warden_failover::FailoverManager;
use warden_health::HealthChecker;
use warden_proto::{
    Endpoint, EndpointRole, EndpointStatus, FailoverEvent, HealthCheckRecord, RotationAudit,
    ServiceKind, validate_name, validate_url,
};
use warden_signer as signer;
use warden_store::{EndpointPatch, RegistryStore, Rotation};

pub use error::DiscoveryError;

// ─── Policy ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ApiPolicy {
    /// Minimum accepted admin-token length. The token itself is an opaque
    /// bearer secret; real verification belongs to the surrounding identity
    /// system and is bound behind [`ApiPolicy::check_admin_token`].
    pub admin_token_min_length: usize,
    /// Minimum registration age of a rotation replacement.
    pub min_rotation_age: Duration,
}

impl Default for ApiPolicy {
    fn default() -> Self {
        Self {
            admin_token_min_length: 32,
            min_rotation_age: Duration::from_secs(300),
        }
    }
}

impl ApiPolicy {
    /// The single seam where integrators bind real token verification.
    pub fn check_admin_token(&self, token: &str) -> Result<(), DiscoveryError> {
        if token.trim().is_empty() || token.len() < self.admin_token_min_length {
            return Err(DiscoveryError::AdminTokenTooShort {
                min: self.admin_token_min_length,
            });
        }
        Ok(())
    }
}

/// True once the replacement endpoint's registration age has reached the
/// minimum. The boundary is inclusive: rotation is permitted at exactly the
/// configured age.
pub fn rotation_age_ok(registered_at: DateTime<Utc>, now: DateTime<Utc>, min_age: Duration) -> bool {
    let min_age = chrono::Duration::from_std(min_age).unwrap_or(chrono::Duration::MAX);
    now - registered_at >= min_age
}

// ─── Requests / responses ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub kind: ServiceKind,
    pub version: String,
    pub url: String,
    pub health_check_url: String,
    pub public_key: String,
    #[serde(default)]
    pub certificate: Option<String>,
    pub role: EndpointRole,
    pub failover_group: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub registered_by: String,
    pub admin_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    pub endpoint_id: String,
    pub status: EndpointStatus,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub admin_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecommissionRequest {
    pub reason: String,
    pub admin_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RotateRequest {
    pub current_endpoint_id: String,
    pub new_endpoint_id: String,
    /// Fresh RSA signature over the new endpoint's canonical tuple, proving
    /// the requester holds the new endpoint's private key.
    pub signature: String,
    pub reason: String,
    pub requested_by: String,
    pub admin_token: String,
    #[serde(default)]
    pub verification_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotateResponse {
    pub old_id: String,
    pub new_id: String,
    pub rotation_time: DateTime<Utc>,
    pub verification_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthHistory {
    pub endpoint_id: String,
    pub current_status: EndpointStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub health_check_count: i64,
    pub failed_health_count: i64,
    pub recent_checks: Vec<HealthCheckRecord>,
}

// ─── Façade ──────────────────────────────────────────────────────────────────

pub struct Discovery {
    store: Arc<dyn RegistryStore>,
    failover: Arc<FailoverManager>,
    checker: Arc<HealthChecker>,
    policy: ApiPolicy,
    /// Endpoints currently mid-rotation; a second rotation targeting the
    /// same endpoint is rejected instead of queued.
    rotations_in_flight: Mutex<HashSet<String>>,
}

impl Discovery {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        failover: Arc<FailoverManager>,
        checker: Arc<HealthChecker>,
        policy: ApiPolicy,
    ) -> Self {
        Self {
            store,
            failover,
            checker,
            policy,
            rotations_in_flight: Mutex::new(HashSet::new()),
        }
    }

    // ── Register ────────────────────────────────────────────────────────────

    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, DiscoveryError> {
        self.policy.check_admin_token(&req.admin_token)?;
        validate_register(&req)?;
        signer::parse_public_key(&req.public_key)?;

        let id = Uuid::new_v4().to_string();
        let registered_at = Utc::now();
        let tuple = signer::canonical_tuple(
            &id,
            &req.name,
            req.kind,
            &req.version,
            &req.url,
            &req.public_key,
            registered_at,
        );

        let endpoint = Endpoint {
            id: id.clone(),
            name: req.name,
            kind: req.kind,
            version: req.version,
            url: req.url,
            health_check_url: req.health_check_url,
            public_key: req.public_key,
            signature: signer::tuple_fingerprint(&tuple),
            certificate: req.certificate,
            role: req.role,
            failover_group: req.failover_group,
            is_active: false,
            priority: req.priority,
            status: EndpointStatus::Registering,
            metadata: req.metadata,
            registered_by: req.registered_by,
            registered_at,
            last_health_check: None,
            health_check_count: 0,
            failed_health_count: 0,
            last_failover_at: None,
            deleted: false,
        };

        let inserted = self.store.insert_endpoint(endpoint).await?;
        info!(
            endpoint = %inserted.id,
            name = %inserted.name,
            kind = %inserted.kind,
            group = %inserted.failover_group,
            active = inserted.is_active,
            "endpoint registered"
        );

        // Immediate probe, out of band from the schedule, so the endpoint
        // reaches `healthy` without waiting for the next tick.
        let status = match self.checker.probe_now(&inserted.id).await {
            Ok(applied) => applied.endpoint.status,
            Err(e) => {
                warn!(endpoint = %inserted.id, error = %e, "initial probe failed");
                inserted.status
            }
        };

        Ok(RegisterResponse {
            endpoint_id: inserted.id,
            status,
            registered_at: inserted.registered_at,
        })
    }

    // ── Discover ────────────────────────────────────────────────────────────

    /// Active endpoints of a kind, ordered by (priority desc,
    /// health_check_count desc). No admin token required.
    pub async fn discover(
        &self,
        kind: ServiceKind,
        min_version: Option<&str>,
        only_healthy: bool,
    ) -> Result<Vec<Endpoint>, DiscoveryError> {
        let floor = min_version
            .map(|raw| {
                semver::Version::parse(raw).map_err(|e| DiscoveryError::InvalidFieldValue {
                    field: "min_version",
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let endpoints = self.store.endpoints_by_kind(kind, only_healthy).await?;
        Ok(endpoints
            .into_iter()
            .filter(|e| e.is_active)
            .filter(|e| match &floor {
                None => true,
                Some(min) => semver::Version::parse(&e.version)
                    .map(|v| v >= *min)
                    .unwrap_or(false),
            })
            .collect())
    }

    /// Fast lookup used by upstream request routing: the active endpoint
    /// for a service kind, if any.
    pub async fn active_endpoint(
        &self,
        kind: ServiceKind,
    ) -> Result<Option<Endpoint>, DiscoveryError> {
        let endpoints = self.store.endpoints_by_kind(kind, false).await?;
        Ok(endpoints.into_iter().find(|e| e.is_active))
    }

    // ── List ────────────────────────────────────────────────────────────────

    pub async fn list(
        &self,
        include_deleted: bool,
        include_decommissioned: bool,
        admin_token: &str,
    ) -> Result<Vec<Endpoint>, DiscoveryError> {
        self.policy.check_admin_token(admin_token)?;
        Ok(self
            .store
            .all_endpoints(include_deleted, include_decommissioned)
            .await?)
    }

    // ── Health history ──────────────────────────────────────────────────────

    pub async fn health_history(
        &self,
        endpoint_id: &str,
        limit: usize,
    ) -> Result<HealthHistory, DiscoveryError> {
        let endpoint = self.store.endpoint(endpoint_id).await?;
        if endpoint.deleted {
            return Err(DiscoveryError::NotFound(format!("endpoint {endpoint_id}")));
        }
        let recent_checks = self.store.recent_checks(endpoint_id, limit).await?;
        Ok(HealthHistory {
            endpoint_id: endpoint.id,
            current_status: endpoint.status,
            last_check: endpoint.last_health_check,
            health_check_count: endpoint.health_check_count,
            failed_health_count: endpoint.failed_health_count,
            recent_checks,
        })
    }

    /// Failover events for a group, newest first. Read-only, for admin UIs.
    pub async fn failover_log(
        &self,
        group: &str,
        limit: usize,
    ) -> Result<Vec<FailoverEvent>, DiscoveryError> {
        Ok(self.store.failover_events(group, limit).await?)
    }

    /// Rotation audit trail, newest first. Read-only, for admin UIs.
    pub async fn rotation_log(&self, limit: usize) -> Result<Vec<RotationAudit>, DiscoveryError> {
        Ok(self.store.rotation_audits(limit).await?)
    }

    // ── Update ──────────────────────────────────────────────────────────────

    pub async fn update(
        &self,
        endpoint_id: &str,
        req: UpdateRequest,
    ) -> Result<Endpoint, DiscoveryError> {
        self.policy.check_admin_token(&req.admin_token)?;

        let current = self.store.endpoint(endpoint_id).await?;
        if current.deleted {
            return Err(DiscoveryError::NotFound(format!("endpoint {endpoint_id}")));
        }
        if current.status == EndpointStatus::Decommissioned {
            return Err(DiscoveryError::AlreadyDecommissioned(
                endpoint_id.to_string(),
            ));
        }

        if let Some(version) = &req.version {
            check_semver(version)?;
        }
        if let Some(url) = &req.url {
            check_url("url", url)?;
        }
        if let Some(health_check_url) = &req.health_check_url {
            check_url("health_check_url", health_check_url)?;
        }

        let url_changed = req.url.is_some() || req.health_check_url.is_some();
        let patch = EndpointPatch {
            version: req.version,
            url: req.url,
            health_check_url: req.health_check_url,
            priority: req.priority,
            metadata: req.metadata,
        };
        if patch.is_empty() {
            return Err(DiscoveryError::InvalidFieldValue {
                field: "update",
                reason: "no fields to update".to_string(),
            });
        }

        let updated = self.store.update_endpoint(endpoint_id, patch).await?;
        info!(endpoint = %endpoint_id, "endpoint updated");

        if url_changed {
            if let Err(e) = self.checker.probe_now(endpoint_id).await {
                warn!(endpoint = %endpoint_id, error = %e, "post-update probe failed");
            }
        }
        Ok(updated)
    }

    // ── Decommission ────────────────────────────────────────────────────────

    pub async fn decommission(
        &self,
        endpoint_id: &str,
        reason: &str,
        admin_token: &str,
    ) -> Result<Endpoint, DiscoveryError> {
        self.policy.check_admin_token(admin_token)?;

        let endpoint = self.store.endpoint(endpoint_id).await?;
        if endpoint.deleted {
            return Err(DiscoveryError::NotFound(format!("endpoint {endpoint_id}")));
        }
        if endpoint.status == EndpointStatus::Decommissioned {
            return Err(DiscoveryError::AlreadyDecommissioned(
                endpoint_id.to_string(),
            ));
        }

        // An active endpoint hands its flag to the best healthy peer inside
        // the same transaction. A group can be left without an active member
        // when no candidate exists: decommission is explicit operator intent.
        let replacement = if endpoint.is_active {
            let transition = self
                .failover
                .elect_replacement(&endpoint, &format!("decommissioned: {reason}"))
                .await
                .map_err(|e| match e {
                    warden_failover::FailoverError::Store(s) => DiscoveryError::from(s),
                })?;
            if transition.is_none() {
                warn!(
                    endpoint = %endpoint_id,
                    group = %endpoint.failover_group,
                    "decommissioning active endpoint with no replacement candidate"
                );
            }
            transition
        } else {
            None
        };

        let decommissioned = self
            .store
            .decommission_endpoint(endpoint_id, replacement)
            .await?;
        info!(endpoint = %endpoint_id, reason = %reason, "endpoint decommissioned");
        Ok(decommissioned)
    }

    // ── Rotate ──────────────────────────────────────────────────────────────

    /// Replace an endpoint in place. Gates, in order: admin token; current
    /// endpoint not already mid-rotation, exists, and is not
    /// decommissioned; signature proof over the new endpoint's canonical
    /// tuple; matching service kinds; new endpoint healthy on its most
    /// recent probe; new endpoint old enough. Every failed gate appends a
    /// failure audit and mutates nothing.
    pub async fn rotate(&self, req: RotateRequest) -> Result<RotateResponse, DiscoveryError> {
        // Token policy comes first: an unauthorized caller learns nothing
        // about in-flight rotations. Audited like every other gate failure.
        if let Err(err) = self.policy.check_admin_token(&req.admin_token) {
            self.audit_rotation_failure(&req, &err).await;
            return Err(err);
        }

        let already_in_flight = {
            let mut in_flight = self.rotations_in_flight.lock();
            !in_flight.insert(req.current_endpoint_id.clone())
        };
        if already_in_flight {
            let err = DiscoveryError::RotationInProgress(req.current_endpoint_id.clone());
            self.audit_rotation_failure(&req, &err).await;
            return Err(err);
        }

        let result = self.rotate_gated(&req).await;
        self.rotations_in_flight
            .lock()
            .remove(&req.current_endpoint_id);

        match result {
            Ok(response) => Ok(response),
            Err(err) => {
                self.audit_rotation_failure(&req, &err).await;
                Err(err)
            }
        }
    }

    /// Gates past the token and mid-rotation checks, which [`Self::rotate`]
    /// has already enforced.
    async fn rotate_gated(&self, req: &RotateRequest) -> Result<RotateResponse, DiscoveryError> {
        let old = self.store.endpoint(&req.current_endpoint_id).await?;
        if old.deleted {
            return Err(DiscoveryError::NotFound(format!(
                "endpoint {}",
                req.current_endpoint_id
            )));
        }
        if old.status == EndpointStatus::Decommissioned {
            return Err(DiscoveryError::AlreadyDecommissioned(old.id.clone()));
        }

        let new = self.store.endpoint(&req.new_endpoint_id).await?;
        if new.deleted {
            return Err(DiscoveryError::NotFound(format!(
                "endpoint {}",
                req.new_endpoint_id
            )));
        }
        if new.status == EndpointStatus::Decommissioned {
            return Err(DiscoveryError::AlreadyDecommissioned(new.id.clone()));
        }

        let tuple = signer::endpoint_tuple(&new);
        signer::verify_tuple(&new.public_key, &tuple, &req.signature)?;

        if old.kind != new.kind {
            return Err(DiscoveryError::MismatchedKind {
                current: old.kind,
                replacement: new.kind,
            });
        }

        let latest = self.store.recent_checks(&new.id, 1).await?;
        let healthy_now = latest
            .first()
            .is_some_and(|c| c.outcome == warden_proto::ProbeOutcome::Healthy);
        if !healthy_now {
            return Err(DiscoveryError::UnhealthyCandidate(new.id.clone()));
        }

        let now = Utc::now();
        if !rotation_age_ok(new.registered_at, now, self.policy.min_rotation_age) {
            return Err(DiscoveryError::TooNewToRotate {
                age_secs: (now - new.registered_at).num_seconds(),
                required_secs: self.policy.min_rotation_age.as_secs() as i64,
            });
        }

        let audit = self
            .store
            .apply_rotation(Rotation {
                old_id: old.id.clone(),
                new_id: new.id.clone(),
                reason: req.reason.clone(),
                requested_by: req.requested_by.clone(),
                verification_hash: signer::tuple_fingerprint(&tuple),
                signature: req.signature.clone(),
            })
            .await?;

        info!(
            old = %old.id,
            new = %new.id,
            requested_by = %req.requested_by,
            "endpoint rotated"
        );

        Ok(RotateResponse {
            old_id: old.id,
            new_id: new.id,
            rotation_time: audit.rotation_time,
            verification_hash: audit.verification_hash,
        })
    }

    async fn audit_rotation_failure(&self, req: &RotateRequest, err: &DiscoveryError) {
        let verification_hash = match self.store.endpoint(&req.new_endpoint_id).await {
            Ok(new) => signer::tuple_fingerprint(&signer::endpoint_tuple(&new)),
            Err(_) => String::new(),
        };
        let audit = RotationAudit {
            id: Uuid::new_v4().to_string(),
            old_endpoint_id: req.current_endpoint_id.clone(),
            new_endpoint_id: Some(req.new_endpoint_id.clone()).filter(|s| !s.is_empty()),
            reason: req.reason.clone(),
            requested_by: req.requested_by.clone(),
            rotation_time: Utc::now(),
            verification_hash,
            success: false,
            error_message: Some(err.to_string()),
        };
        if let Err(e) = self.store.append_rotation_audit(audit).await {
            warn!(error = %e, "failed to append rotation failure audit");
        }
    }
}

// ─── Validation helpers ──────────────────────────────────────────────────────

fn check_semver(version: &str) -> Result<(), DiscoveryError> {
    semver::Version::parse(version).map_err(|e| DiscoveryError::InvalidFieldValue {
        field: "version",
        reason: e.to_string(),
    })?;
    Ok(())
}

fn check_url(field: &'static str, url: &str) -> Result<(), DiscoveryError> {
    if !validate_url(url) {
        return Err(DiscoveryError::InvalidFieldValue {
            field,
            reason: format!("not a valid http(s) URL: {url}"),
        });
    }
    Ok(())
}

fn validate_register(req: &RegisterRequest) -> Result<(), DiscoveryError> {
    if req.name.is_empty() {
        return Err(DiscoveryError::MissingField("name"));
    }
    if req.failover_group.is_empty() {
        return Err(DiscoveryError::MissingField("failover_group"));
    }
    if req.registered_by.is_empty() {
        return Err(DiscoveryError::MissingField("registered_by"));
    }
    if req.public_key.is_empty() {
        return Err(DiscoveryError::MissingField("public_key"));
    }
    if !validate_name(&req.name) {
        return Err(DiscoveryError::InvalidFieldValue {
            field: "name",
            reason: "must be non-empty, at most 128 chars, without whitespace".to_string(),
        });
    }
    if !validate_name(&req.failover_group) {
        return Err(DiscoveryError::InvalidFieldValue {
            field: "failover_group",
            reason: "must be non-empty, at most 128 chars, without whitespace".to_string(),
        });
    }
    check_semver(&req.version)?;
    check_url("url", &req.url)?;
    check_url("health_check_url", &req.health_check_url)?;
    Ok(())
}
