//! In-memory registry store.
//!
//! Mirrors the SQLite backend's semantics exactly; compound operations hold
//! the write lock for their full duration, which makes them atomic with
//! respect to every other store call.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use async_trait::async_trait;
use warden_proto::{
    Endpoint, EndpointStatus, FailoverEvent, HealthCheckRecord, RotationAudit, ServiceKind,
};

use crate::{
    EndpointPatch, ProbeApplied, ProbeRecord, RegistryStore, Rotation, StoreError, Transition,
    apply_probe_to_endpoint, discovery_order,
};

#[derive(Default)]
struct Inner {
    endpoints: HashMap<String, Endpoint>,
    checks: Vec<HealthCheckRecord>,
    events: Vec<FailoverEvent>,
    audits: Vec<RotationAudit>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn get_live<'a>(
    endpoints: &'a HashMap<String, Endpoint>,
    id: &str,
) -> Result<&'a Endpoint, StoreError> {
    endpoints
        .get(id)
        .filter(|e| !e.deleted)
        .ok_or_else(|| StoreError::NotFound(format!("endpoint {id}")))
}

fn active_peer_ids(inner: &Inner, group: &str, kind: ServiceKind) -> Vec<String> {
    inner
        .endpoints
        .values()
        .filter(|e| {
            e.failover_group == group
                && e.kind == kind
                && e.is_active
                && !e.deleted
                && e.status != EndpointStatus::Decommissioned
        })
        .map(|e| e.id.clone())
        .collect()
}

fn promote_in_group(inner: &mut Inner, transition: &Transition) -> Result<FailoverEvent, StoreError> {
    let now = Utc::now();

    {
        let promote = get_live(&inner.endpoints, &transition.promote_id)?;
        if promote.status == EndpointStatus::Decommissioned {
            return Err(StoreError::InvariantViolation(format!(
                "cannot activate decommissioned endpoint {}",
                transition.promote_id
            )));
        }
    }

    if let Some(demote) = inner.endpoints.get_mut(&transition.demote_id) {
        demote.is_active = false;
        demote.last_failover_at = Some(now);
    } else {
        return Err(StoreError::NotFound(format!(
            "endpoint {}",
            transition.demote_id
        )));
    }

    let promote = inner
        .endpoints
        .get_mut(&transition.promote_id)
        .ok_or_else(|| StoreError::NotFound(format!("endpoint {}", transition.promote_id)))?;
    promote.is_active = true;
    promote.last_failover_at = Some(now);

    let actives = active_peer_ids(inner, &transition.failover_group, transition.service_kind);
    if actives.len() > 1 {
        return Err(StoreError::InvariantViolation(format!(
            "group {} would have {} active endpoints",
            transition.failover_group,
            actives.len()
        )));
    }

    let event = FailoverEvent {
        id: Uuid::new_v4().to_string(),
        failover_group: transition.failover_group.clone(),
        service_kind: transition.service_kind,
        old_endpoint_id: transition.demote_id.clone(),
        new_endpoint_id: transition.promote_id.clone(),
        reason: transition.reason.clone(),
        kind: transition.kind,
        timestamp: now,
        automatic: transition.automatic,
    };
    inner.events.push(event.clone());
    Ok(event)
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn insert_endpoint(&self, mut endpoint: Endpoint) -> Result<Endpoint, StoreError> {
        let mut inner = self.inner.write();

        let collision = inner.endpoints.values().any(|e| {
            !e.deleted && e.name == endpoint.name && e.kind == endpoint.kind && e.url == endpoint.url
        });
        if collision {
            return Err(StoreError::Duplicate(format!(
                "({}, {}, {})",
                endpoint.name, endpoint.kind, endpoint.url
            )));
        }

        endpoint.is_active =
            active_peer_ids(&inner, &endpoint.failover_group, endpoint.kind).is_empty();

        inner
            .endpoints
            .insert(endpoint.id.clone(), endpoint.clone());
        Ok(endpoint)
    }

    async fn endpoint(&self, id: &str) -> Result<Endpoint, StoreError> {
        let inner = self.inner.read();
        inner
            .endpoints
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("endpoint {id}")))
    }

    async fn live_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let inner = self.inner.read();
        let mut eps: Vec<Endpoint> = inner
            .endpoints
            .values()
            .filter(|e| e.is_live())
            .cloned()
            .collect();
        eps.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(eps)
    }

    async fn endpoints_by_kind(
        &self,
        kind: ServiceKind,
        only_healthy: bool,
    ) -> Result<Vec<Endpoint>, StoreError> {
        let inner = self.inner.read();
        let mut eps: Vec<Endpoint> = inner
            .endpoints
            .values()
            .filter(|e| e.is_live() && e.kind == kind)
            .filter(|e| !only_healthy || e.status == EndpointStatus::Healthy)
            .cloned()
            .collect();
        eps.sort_by(discovery_order);
        Ok(eps)
    }

    async fn group_endpoints(&self, group: &str) -> Result<Vec<Endpoint>, StoreError> {
        let inner = self.inner.read();
        let mut eps: Vec<Endpoint> = inner
            .endpoints
            .values()
            .filter(|e| !e.deleted && e.failover_group == group)
            .cloned()
            .collect();
        eps.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(eps)
    }

    async fn all_endpoints(
        &self,
        include_deleted: bool,
        include_decommissioned: bool,
    ) -> Result<Vec<Endpoint>, StoreError> {
        let inner = self.inner.read();
        let mut eps: Vec<Endpoint> = inner
            .endpoints
            .values()
            .filter(|e| include_deleted || !e.deleted)
            .filter(|e| include_decommissioned || e.status != EndpointStatus::Decommissioned)
            .cloned()
            .collect();
        eps.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(eps)
    }

    async fn update_endpoint(
        &self,
        id: &str,
        patch: EndpointPatch,
    ) -> Result<Endpoint, StoreError> {
        let mut inner = self.inner.write();
        get_live(&inner.endpoints, id)?;

        let ep = inner
            .endpoints
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("endpoint {id}")))?;
        if let Some(version) = patch.version {
            ep.version = version;
        }
        if let Some(url) = patch.url {
            ep.url = url;
        }
        if let Some(health_check_url) = patch.health_check_url {
            ep.health_check_url = health_check_url;
        }
        if let Some(priority) = patch.priority {
            ep.priority = priority;
        }
        if let Some(metadata) = patch.metadata {
            ep.metadata = metadata;
        }
        Ok(ep.clone())
    }

    async fn record_probe(
        &self,
        endpoint_id: &str,
        probe: ProbeRecord,
        failure_threshold: u32,
    ) -> Result<ProbeApplied, StoreError> {
        let mut inner = self.inner.write();

        let previous_status = {
            let ep = get_live(&inner.endpoints, endpoint_id)?;
            if ep.status == EndpointStatus::Decommissioned {
                return Err(StoreError::InvariantViolation(format!(
                    "probe recorded against decommissioned endpoint {endpoint_id}"
                )));
            }
            ep.status
        };

        inner.checks.push(HealthCheckRecord {
            id: Uuid::new_v4().to_string(),
            endpoint_id: endpoint_id.to_string(),
            timestamp: probe.timestamp,
            outcome: probe.outcome,
            response_time_ms: probe.response_time_ms,
            http_status_code: probe.http_status_code,
            error_message: probe.error_message.clone(),
            checked_by: probe.checked_by.clone(),
        });

        let ep = inner
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| StoreError::NotFound(format!("endpoint {endpoint_id}")))?;
        apply_probe_to_endpoint(ep, &probe, failure_threshold);
        let endpoint = ep.clone();

        Ok(ProbeApplied {
            status_changed: endpoint.status != previous_status,
            previous_status,
            endpoint,
        })
    }

    async fn recent_checks(
        &self,
        endpoint_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthCheckRecord>, StoreError> {
        let inner = self.inner.read();
        // Insertion order breaks timestamp ties (timestamps have second
        // resolution once persisted).
        let mut checks: Vec<(usize, HealthCheckRecord)> = inner
            .checks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.endpoint_id == endpoint_id)
            .map(|(i, c)| (i, c.clone()))
            .collect();
        checks.sort_by_key(|(i, c)| std::cmp::Reverse((c.timestamp, *i)));
        checks.truncate(limit);
        Ok(checks.into_iter().map(|(_, c)| c).collect())
    }

    async fn apply_failover(&self, transition: Transition) -> Result<FailoverEvent, StoreError> {
        let mut inner = self.inner.write();
        // Snapshot for rollback: the lock makes the operation atomic, but a
        // failed invariant check must also undo the partial flag writes.
        let snapshot: Vec<Endpoint> = inner
            .endpoints
            .values()
            .filter(|e| e.failover_group == transition.failover_group)
            .cloned()
            .collect();

        match promote_in_group(&mut inner, &transition) {
            Ok(event) => Ok(event),
            Err(e) => {
                for ep in snapshot {
                    inner.endpoints.insert(ep.id.clone(), ep);
                }
                Err(e)
            }
        }
    }

    async fn latest_failover_event(
        &self,
        group: &str,
    ) -> Result<Option<FailoverEvent>, StoreError> {
        let inner = self.inner.read();
        // max_by_key keeps the last maximum, so insertion order breaks ties.
        Ok(inner
            .events
            .iter()
            .filter(|e| e.failover_group == group)
            .max_by_key(|e| e.timestamp)
            .cloned())
    }

    async fn failover_events(
        &self,
        group: &str,
        limit: usize,
    ) -> Result<Vec<FailoverEvent>, StoreError> {
        let inner = self.inner.read();
        let mut events: Vec<(usize, FailoverEvent)> = inner
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.failover_group == group)
            .map(|(i, e)| (i, e.clone()))
            .collect();
        events.sort_by_key(|(i, e)| std::cmp::Reverse((e.timestamp, *i)));
        events.truncate(limit);
        Ok(events.into_iter().map(|(_, e)| e).collect())
    }

    async fn decommission_endpoint(
        &self,
        id: &str,
        replacement: Option<Transition>,
    ) -> Result<Endpoint, StoreError> {
        let mut inner = self.inner.write();
        let snapshot: Vec<Endpoint> = inner.endpoints.values().cloned().collect();

        let result = (|| {
            get_live(&inner.endpoints, id)?;
            let ep = inner
                .endpoints
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("endpoint {id}")))?;
            ep.status = EndpointStatus::Decommissioned;
            ep.is_active = false;
            ep.last_failover_at = Some(Utc::now());
            let decommissioned = ep.clone();

            if let Some(transition) = replacement {
                promote_in_group(&mut inner, &transition)?;
            }
            Ok(decommissioned)
        })();

        if result.is_err() {
            inner.endpoints = snapshot.into_iter().map(|e| (e.id.clone(), e)).collect();
        }
        result
    }

    async fn apply_rotation(&self, rotation: Rotation) -> Result<RotationAudit, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let (group, was_active) = {
            let old = get_live(&inner.endpoints, &rotation.old_id)?;
            if old.status == EndpointStatus::Decommissioned {
                return Err(StoreError::InvariantViolation(format!(
                    "endpoint {} is already decommissioned",
                    rotation.old_id
                )));
            }
            (old.failover_group.clone(), old.is_active)
        };
        get_live(&inner.endpoints, &rotation.new_id)?;

        {
            let old = inner
                .endpoints
                .get_mut(&rotation.old_id)
                .ok_or_else(|| StoreError::NotFound(format!("endpoint {}", rotation.old_id)))?;
            old.status = EndpointStatus::Decommissioned;
            old.is_active = false;
            old.last_failover_at = Some(now);
        }
        {
            let new = inner
                .endpoints
                .get_mut(&rotation.new_id)
                .ok_or_else(|| StoreError::NotFound(format!("endpoint {}", rotation.new_id)))?;
            new.failover_group = group;
            new.is_active = was_active;
            new.signature = rotation.signature.clone();
            if was_active {
                new.last_failover_at = Some(now);
            }
        }

        let audit = RotationAudit {
            id: Uuid::new_v4().to_string(),
            old_endpoint_id: rotation.old_id.clone(),
            new_endpoint_id: Some(rotation.new_id.clone()),
            reason: rotation.reason.clone(),
            requested_by: rotation.requested_by.clone(),
            rotation_time: now,
            verification_hash: rotation.verification_hash.clone(),
            success: true,
            error_message: None,
        };
        inner.audits.push(audit.clone());
        Ok(audit)
    }

    async fn append_rotation_audit(&self, audit: RotationAudit) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.audits.push(audit);
        Ok(())
    }

    async fn rotation_audits(&self, limit: usize) -> Result<Vec<RotationAudit>, StoreError> {
        let inner = self.inner.read();
        let mut audits: Vec<(usize, RotationAudit)> =
            inner.audits.iter().cloned().enumerate().collect();
        audits.sort_by_key(|(i, a)| std::cmp::Reverse((a.rotation_time, *i)));
        audits.truncate(limit);
        Ok(audits.into_iter().map(|(_, a)| a).collect())
    }
}
