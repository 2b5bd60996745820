//! SQLite-backed registry store.
//!
//! Four tables with the indexes required by the registry's query patterns.
//! Timestamps are stored as integer epoch seconds, booleans as 0/1, ids as
//! opaque TEXT. Compound mutations run inside a single SQLite transaction.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;
use uuid::Uuid;

use warden_proto::{
    Endpoint, EndpointRole, EndpointStatus, FailoverEvent, HealthCheckRecord, ProbeOutcome,
    RotationAudit, ServiceKind, TransitionKind,
};

use crate::{
    EndpointPatch, ProbeApplied, ProbeRecord, RegistryStore, Rotation, StoreError, Transition,
    apply_probe_to_endpoint,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS endpoints (
    id                  TEXT PRIMARY KEY,
    name                TEXT NOT NULL,
    kind                TEXT NOT NULL,
    version             TEXT NOT NULL,
    url                 TEXT NOT NULL,
    health_check_url    TEXT NOT NULL,
    public_key          TEXT NOT NULL,
    signature           TEXT NOT NULL,
    certificate         TEXT,
    role                TEXT NOT NULL,
    failover_group      TEXT NOT NULL,
    is_active           INTEGER NOT NULL DEFAULT 0,
    priority            INTEGER NOT NULL DEFAULT 0,
    status              TEXT NOT NULL,
    metadata            TEXT NOT NULL DEFAULT 'null',
    registered_by       TEXT NOT NULL,
    registered_at       INTEGER NOT NULL,
    last_health_check   INTEGER,
    health_check_count  INTEGER NOT NULL DEFAULT 0,
    failed_health_count INTEGER NOT NULL DEFAULT 0,
    last_failover_at    INTEGER,
    deleted             INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_endpoints_identity
    ON endpoints (name, kind, url) WHERE deleted = 0;
CREATE INDEX IF NOT EXISTS idx_endpoints_kind
    ON endpoints (kind, deleted, status);
CREATE INDEX IF NOT EXISTS idx_endpoints_group
    ON endpoints (failover_group, deleted);

CREATE TABLE IF NOT EXISTS health_checks (
    id               TEXT PRIMARY KEY,
    endpoint_id      TEXT NOT NULL,
    timestamp        INTEGER NOT NULL,
    outcome          TEXT NOT NULL,
    response_time_ms INTEGER NOT NULL,
    http_status_code INTEGER,
    error_message    TEXT,
    checked_by       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_health_checks_endpoint
    ON health_checks (endpoint_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS failover_events (
    id              TEXT PRIMARY KEY,
    failover_group  TEXT NOT NULL,
    service_kind    TEXT NOT NULL,
    old_endpoint_id TEXT NOT NULL,
    new_endpoint_id TEXT NOT NULL,
    reason          TEXT NOT NULL,
    kind            TEXT NOT NULL,
    timestamp       INTEGER NOT NULL,
    automatic       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_failover_events_group
    ON failover_events (failover_group, timestamp DESC);

CREATE TABLE IF NOT EXISTS rotation_audits (
    id                TEXT PRIMARY KEY,
    old_endpoint_id   TEXT NOT NULL,
    new_endpoint_id   TEXT,
    reason            TEXT NOT NULL,
    requested_by      TEXT NOT NULL,
    rotation_time     INTEGER NOT NULL,
    verification_hash TEXT NOT NULL,
    success           INTEGER NOT NULL,
    error_message     TEXT
);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("open {}: {e}", path.display())))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database. Mostly useful for tests and the `check`
    /// subcommand.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("open in-memory: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| StoreError::Unavailable(format!("pragma: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Unavailable(format!("schema: {e}")))?;
        info!("sqlite registry store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn bad_column(name: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unrecognized {name}: {value}").into(),
    )
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn endpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Endpoint> {
    let kind: String = row.get("kind")?;
    let role: String = row.get("role")?;
    let status: String = row.get("status")?;
    let metadata: String = row.get("metadata")?;

    Ok(Endpoint {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: ServiceKind::parse(&kind).ok_or_else(|| bad_column("kind", &kind))?,
        version: row.get("version")?,
        url: row.get("url")?,
        health_check_url: row.get("health_check_url")?,
        public_key: row.get("public_key")?,
        signature: row.get("signature")?,
        certificate: row.get("certificate")?,
        role: EndpointRole::parse(&role).ok_or_else(|| bad_column("role", &role))?,
        failover_group: row.get("failover_group")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        priority: row.get("priority")?,
        status: EndpointStatus::parse(&status).ok_or_else(|| bad_column("status", &status))?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        registered_by: row.get("registered_by")?,
        registered_at: ts(row.get("registered_at")?),
        last_health_check: row.get::<_, Option<i64>>("last_health_check")?.map(ts),
        health_check_count: row.get("health_check_count")?,
        failed_health_count: row.get("failed_health_count")?,
        last_failover_at: row.get::<_, Option<i64>>("last_failover_at")?.map(ts),
        deleted: row.get::<_, i64>("deleted")? != 0,
    })
}

fn check_from_row(row: &Row<'_>) -> rusqlite::Result<HealthCheckRecord> {
    let outcome: String = row.get("outcome")?;
    Ok(HealthCheckRecord {
        id: row.get("id")?,
        endpoint_id: row.get("endpoint_id")?,
        timestamp: ts(row.get("timestamp")?),
        outcome: ProbeOutcome::parse(&outcome).ok_or_else(|| bad_column("outcome", &outcome))?,
        response_time_ms: row.get("response_time_ms")?,
        http_status_code: row
            .get::<_, Option<i64>>("http_status_code")?
            .map(|c| c as u16),
        error_message: row.get("error_message")?,
        checked_by: row.get("checked_by")?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<FailoverEvent> {
    let kind: String = row.get("kind")?;
    let service_kind: String = row.get("service_kind")?;
    Ok(FailoverEvent {
        id: row.get("id")?,
        failover_group: row.get("failover_group")?,
        service_kind: ServiceKind::parse(&service_kind)
            .ok_or_else(|| bad_column("service_kind", &service_kind))?,
        old_endpoint_id: row.get("old_endpoint_id")?,
        new_endpoint_id: row.get("new_endpoint_id")?,
        reason: row.get("reason")?,
        kind: TransitionKind::parse(&kind).ok_or_else(|| bad_column("kind", &kind))?,
        timestamp: ts(row.get("timestamp")?),
        automatic: row.get::<_, i64>("automatic")? != 0,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<RotationAudit> {
    Ok(RotationAudit {
        id: row.get("id")?,
        old_endpoint_id: row.get("old_endpoint_id")?,
        new_endpoint_id: row.get("new_endpoint_id")?,
        reason: row.get("reason")?,
        requested_by: row.get("requested_by")?,
        rotation_time: ts(row.get("rotation_time")?),
        verification_hash: row.get("verification_hash")?,
        success: row.get::<_, i64>("success")? != 0,
        error_message: row.get("error_message")?,
    })
}

fn map_err(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("row".to_string()),
        rusqlite::Error::SqliteFailure(ffi, msg)
            if ffi.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Duplicate(msg.unwrap_or_else(|| "constraint violation".to_string()))
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

// ─── Transaction helpers ─────────────────────────────────────────────────────

fn fetch_endpoint(conn: &Connection, id: &str) -> Result<Endpoint, StoreError> {
    conn.query_row(
        "SELECT * FROM endpoints WHERE id = ?1",
        params![id],
        endpoint_from_row,
    )
    .optional()
    .map_err(map_err)?
    .ok_or_else(|| StoreError::NotFound(format!("endpoint {id}")))
}

fn fetch_live_endpoint(conn: &Connection, id: &str) -> Result<Endpoint, StoreError> {
    let ep = fetch_endpoint(conn, id)?;
    if ep.deleted {
        return Err(StoreError::NotFound(format!("endpoint {id}")));
    }
    Ok(ep)
}

fn active_count(conn: &Connection, group: &str, kind: ServiceKind) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT COUNT(*) FROM endpoints
         WHERE failover_group = ?1 AND kind = ?2 AND is_active = 1
           AND deleted = 0 AND status != 'decommissioned'",
        params![group, kind.as_str()],
        |row| row.get(0),
    )
    .map_err(map_err)
}

fn write_flags(
    conn: &Connection,
    id: &str,
    is_active: bool,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let changed = conn
        .execute(
            "UPDATE endpoints SET is_active = ?2, last_failover_at = ?3
             WHERE id = ?1 AND deleted = 0",
            params![id, is_active as i64, now.timestamp()],
        )
        .map_err(map_err)?;
    if changed != 1 {
        return Err(StoreError::NotFound(format!("endpoint {id}")));
    }
    Ok(())
}

fn insert_event(
    conn: &Connection,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Result<FailoverEvent, StoreError> {
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
    conn.execute(
        "INSERT INTO failover_events
         (id, failover_group, service_kind, old_endpoint_id, new_endpoint_id,
          reason, kind, timestamp, automatic)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.id,
            event.failover_group,
            event.service_kind.as_str(),
            event.old_endpoint_id,
            event.new_endpoint_id,
            event.reason,
            event.kind.as_str(),
            event.timestamp.timestamp(),
            event.automatic as i64,
        ],
    )
    .map_err(map_err)?;
    Ok(event)
}

/// Demote + promote + invariant check + event append. Runs inside the
/// caller's transaction; any error aborts the whole transaction.
fn promote_in_group(
    conn: &Connection,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Result<FailoverEvent, StoreError> {
    let promote = fetch_live_endpoint(conn, &transition.promote_id)?;
    if promote.status == EndpointStatus::Decommissioned {
        return Err(StoreError::InvariantViolation(format!(
            "cannot activate decommissioned endpoint {}",
            transition.promote_id
        )));
    }

    write_flags(conn, &transition.demote_id, false, now)?;
    write_flags(conn, &transition.promote_id, true, now)?;

    let actives = active_count(conn, &transition.failover_group, transition.service_kind)?;
    if actives > 1 {
        return Err(StoreError::InvariantViolation(format!(
            "group {} would have {actives} active endpoints",
            transition.failover_group
        )));
    }

    insert_event(conn, transition, now)
}

fn write_endpoint_counters(conn: &Connection, ep: &Endpoint) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE endpoints SET
            status = ?2,
            last_health_check = ?3,
            health_check_count = ?4,
            failed_health_count = ?5
         WHERE id = ?1",
        params![
            ep.id,
            ep.status.as_str(),
            ep.last_health_check.map(|t| t.timestamp()),
            ep.health_check_count,
            ep.failed_health_count,
        ],
    )
    .map_err(map_err)?;
    Ok(())
}

// ─── Trait implementation ────────────────────────────────────────────────────

#[async_trait]
impl RegistryStore for SqliteStore {
    async fn insert_endpoint(&self, mut endpoint: Endpoint) -> Result<Endpoint, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_err)?;

        endpoint.is_active = active_count(&tx, &endpoint.failover_group, endpoint.kind)? == 0;

        let inserted = tx.execute(
            "INSERT INTO endpoints
             (id, name, kind, version, url, health_check_url, public_key, signature,
              certificate, role, failover_group, is_active, priority, status, metadata,
              registered_by, registered_at, last_health_check, health_check_count,
              failed_health_count, last_failover_at, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                endpoint.id,
                endpoint.name,
                endpoint.kind.as_str(),
                endpoint.version,
                endpoint.url,
                endpoint.health_check_url,
                endpoint.public_key,
                endpoint.signature,
                endpoint.certificate,
                endpoint.role.as_str(),
                endpoint.failover_group,
                endpoint.is_active as i64,
                endpoint.priority,
                endpoint.status.as_str(),
                serde_json::to_string(&endpoint.metadata)
                    .unwrap_or_else(|_| "null".to_string()),
                endpoint.registered_by,
                endpoint.registered_at.timestamp(),
                endpoint.last_health_check.map(|t| t.timestamp()),
                endpoint.health_check_count,
                endpoint.failed_health_count,
                endpoint.last_failover_at.map(|t| t.timestamp()),
                endpoint.deleted as i64,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) => {
                return Err(match map_err(e) {
                    StoreError::Duplicate(_) => StoreError::Duplicate(format!(
                        "({}, {}, {})",
                        endpoint.name, endpoint.kind, endpoint.url
                    )),
                    other => other,
                });
            }
        }

        tx.commit().map_err(map_err)?;
        Ok(endpoint)
    }

    async fn endpoint(&self, id: &str) -> Result<Endpoint, StoreError> {
        let conn = self.conn.lock();
        fetch_endpoint(&conn, id)
    }

    async fn live_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM endpoints
                 WHERE deleted = 0 AND status != 'decommissioned'
                 ORDER BY id",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map([], endpoint_from_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn endpoints_by_kind(
        &self,
        kind: ServiceKind,
        only_healthy: bool,
    ) -> Result<Vec<Endpoint>, StoreError> {
        let conn = self.conn.lock();
        let sql = if only_healthy {
            "SELECT * FROM endpoints
             WHERE kind = ?1 AND deleted = 0 AND status = 'healthy'
             ORDER BY priority DESC, health_check_count DESC, id ASC"
        } else {
            "SELECT * FROM endpoints
             WHERE kind = ?1 AND deleted = 0 AND status != 'decommissioned'
             ORDER BY priority DESC, health_check_count DESC, id ASC"
        };
        let mut stmt = conn.prepare(sql).map_err(map_err)?;
        let rows = stmt
            .query_map(params![kind.as_str()], endpoint_from_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn group_endpoints(&self, group: &str) -> Result<Vec<Endpoint>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM endpoints
                 WHERE failover_group = ?1 AND deleted = 0
                 ORDER BY id",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![group], endpoint_from_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn all_endpoints(
        &self,
        include_deleted: bool,
        include_decommissioned: bool,
    ) -> Result<Vec<Endpoint>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM endpoints
                 WHERE (?1 OR deleted = 0)
                   AND (?2 OR status != 'decommissioned')
                 ORDER BY id",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(
                params![include_deleted as i64, include_decommissioned as i64],
                endpoint_from_row,
            )
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn update_endpoint(
        &self,
        id: &str,
        patch: EndpointPatch,
    ) -> Result<Endpoint, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_err)?;

        let mut ep = fetch_live_endpoint(&tx, id)?;
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

        tx.execute(
            "UPDATE endpoints SET
                version = ?2, url = ?3, health_check_url = ?4,
                priority = ?5, metadata = ?6
             WHERE id = ?1",
            params![
                ep.id,
                ep.version,
                ep.url,
                ep.health_check_url,
                ep.priority,
                serde_json::to_string(&ep.metadata).unwrap_or_else(|_| "null".to_string()),
            ],
        )
        .map_err(map_err)?;

        tx.commit().map_err(map_err)?;
        Ok(ep)
    }

    async fn record_probe(
        &self,
        endpoint_id: &str,
        probe: ProbeRecord,
        failure_threshold: u32,
    ) -> Result<ProbeApplied, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_err)?;

        let mut ep = fetch_live_endpoint(&tx, endpoint_id)?;
        if ep.status == EndpointStatus::Decommissioned {
            return Err(StoreError::InvariantViolation(format!(
                "probe recorded against decommissioned endpoint {endpoint_id}"
            )));
        }
        let previous_status = ep.status;

        tx.execute(
            "INSERT INTO health_checks
             (id, endpoint_id, timestamp, outcome, response_time_ms,
              http_status_code, error_message, checked_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                endpoint_id,
                probe.timestamp.timestamp(),
                probe.outcome.as_str(),
                probe.response_time_ms,
                probe.http_status_code.map(i64::from),
                probe.error_message,
                probe.checked_by,
            ],
        )
        .map_err(map_err)?;

        apply_probe_to_endpoint(&mut ep, &probe, failure_threshold);
        write_endpoint_counters(&tx, &ep)?;

        tx.commit().map_err(map_err)?;
        Ok(ProbeApplied {
            status_changed: ep.status != previous_status,
            previous_status,
            endpoint: ep,
        })
    }

    async fn recent_checks(
        &self,
        endpoint_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthCheckRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM health_checks
                 WHERE endpoint_id = ?1
                 ORDER BY timestamp DESC, rowid DESC
                 LIMIT ?2",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![endpoint_id, limit as i64], check_from_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn apply_failover(&self, transition: Transition) -> Result<FailoverEvent, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_err)?;

        // Dropping the transaction on the error path rolls everything back.
        let event = promote_in_group(&tx, &transition, Utc::now())?;

        tx.commit().map_err(map_err)?;
        Ok(event)
    }

    async fn latest_failover_event(
        &self,
        group: &str,
    ) -> Result<Option<FailoverEvent>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM failover_events
             WHERE failover_group = ?1
             ORDER BY timestamp DESC, rowid DESC
             LIMIT 1",
            params![group],
            event_from_row,
        )
        .optional()
        .map_err(map_err)
    }

    async fn failover_events(
        &self,
        group: &str,
        limit: usize,
    ) -> Result<Vec<FailoverEvent>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM failover_events
                 WHERE failover_group = ?1
                 ORDER BY timestamp DESC, rowid DESC
                 LIMIT ?2",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![group, limit as i64], event_from_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn decommission_endpoint(
        &self,
        id: &str,
        replacement: Option<Transition>,
    ) -> Result<Endpoint, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_err)?;
        let now = Utc::now();

        fetch_live_endpoint(&tx, id)?;
        tx.execute(
            "UPDATE endpoints SET
                status = 'decommissioned', is_active = 0, last_failover_at = ?2
             WHERE id = ?1",
            params![id, now.timestamp()],
        )
        .map_err(map_err)?;

        if let Some(transition) = replacement {
            promote_in_group(&tx, &transition, now)?;
        }

        let decommissioned = fetch_endpoint(&tx, id)?;
        tx.commit().map_err(map_err)?;
        Ok(decommissioned)
    }

    async fn apply_rotation(&self, rotation: Rotation) -> Result<RotationAudit, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(map_err)?;
        let now = Utc::now();

        let old = fetch_live_endpoint(&tx, &rotation.old_id)?;
        if old.status == EndpointStatus::Decommissioned {
            return Err(StoreError::InvariantViolation(format!(
                "endpoint {} is already decommissioned",
                rotation.old_id
            )));
        }
        fetch_live_endpoint(&tx, &rotation.new_id)?;

        tx.execute(
            "UPDATE endpoints SET
                status = 'decommissioned', is_active = 0, last_failover_at = ?2
             WHERE id = ?1",
            params![rotation.old_id, now.timestamp()],
        )
        .map_err(map_err)?;

        tx.execute(
            "UPDATE endpoints SET
                failover_group = ?2, is_active = ?3, signature = ?4,
                last_failover_at = CASE WHEN ?3 THEN ?5 ELSE last_failover_at END
             WHERE id = ?1",
            params![
                rotation.new_id,
                old.failover_group,
                old.is_active as i64,
                rotation.signature,
                now.timestamp(),
            ],
        )
        .map_err(map_err)?;

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
        insert_audit(&tx, &audit)?;

        tx.commit().map_err(map_err)?;
        Ok(audit)
    }

    async fn append_rotation_audit(&self, audit: RotationAudit) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        insert_audit(&conn, &audit)
    }

    async fn rotation_audits(&self, limit: usize) -> Result<Vec<RotationAudit>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM rotation_audits
                 ORDER BY rotation_time DESC, rowid DESC
                 LIMIT ?1",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![limit as i64], audit_from_row)
            .map_err(map_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_err)?;
        Ok(rows)
    }
}

fn insert_audit(conn: &Connection, audit: &RotationAudit) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO rotation_audits
         (id, old_endpoint_id, new_endpoint_id, reason, requested_by,
          rotation_time, verification_hash, success, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            audit.id,
            audit.old_endpoint_id,
            audit.new_endpoint_id,
            audit.reason,
            audit.requested_by,
            audit.rotation_time.timestamp(),
            audit.verification_hash,
            audit.success as i64,
            audit.error_message,
        ],
    )
    .map_err(map_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_proto::EndpointRole;

    fn endpoint(id: &str, role: EndpointRole, priority: i64) -> Endpoint {
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
            role,
            failover_group: "g1".to_string(),
            is_active: false,
            priority,
            status: EndpointStatus::Registering,
            metadata: serde_json::json!({"zone": "eu-1"}),
            registered_by: "test".to_string(),
            registered_at: Utc::now(),
            last_health_check: None,
            health_check_count: 0,
            failed_health_count: 0,
            last_failover_at: None,
            deleted: false,
        }
    }

    fn probe(outcome: ProbeOutcome) -> ProbeRecord {
        ProbeRecord {
            timestamp: Utc::now(),
            outcome,
            response_time_ms: 7,
            http_status_code: Some(if outcome == ProbeOutcome::Healthy { 200 } else { 500 }),
            error_message: None,
            checked_by: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn round_trips_endpoint_row() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .insert_endpoint(endpoint("a", EndpointRole::Primary, 10))
            .await
            .expect("insert");

        let ep = store.endpoint("a").await.expect("fetch");
        assert_eq!(ep.name, "svc-a");
        assert_eq!(ep.kind, ServiceKind::Authentication);
        assert_eq!(ep.status, EndpointStatus::Registering);
        assert_eq!(ep.metadata, serde_json::json!({"zone": "eu-1"}));
        assert!(ep.is_active, "first member of a group starts active");
    }

    #[tokio::test]
    async fn duplicate_identity_maps_to_duplicate_error() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .insert_endpoint(endpoint("a", EndpointRole::Primary, 1))
            .await
            .expect("insert");

        let mut dup = endpoint("a2", EndpointRole::Primary, 1);
        dup.name = "svc-a".to_string();
        dup.url = "http://a:8081".to_string();
        let err = store.insert_endpoint(dup).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn soft_deleted_row_frees_identity_slot() {
        let store = SqliteStore::open_in_memory().expect("open");
        let mut first = endpoint("a", EndpointRole::Primary, 1);
        first.deleted = true;
        store.insert_endpoint(first).await.expect("insert deleted");

        let mut second = endpoint("a2", EndpointRole::Primary, 1);
        second.name = "svc-a".to_string();
        second.url = "http://a:8081".to_string();
        store
            .insert_endpoint(second)
            .await
            .expect("same identity as a deleted row is allowed");
    }

    #[tokio::test]
    async fn probe_persists_log_row_and_counters() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .insert_endpoint(endpoint("a", EndpointRole::Primary, 1))
            .await
            .expect("insert");

        let applied = store
            .record_probe("a", probe(ProbeOutcome::Healthy), 3)
            .await
            .expect("probe");
        assert_eq!(applied.endpoint.status, EndpointStatus::Healthy);

        store
            .record_probe("a", probe(ProbeOutcome::Unhealthy), 3)
            .await
            .expect("probe");

        let checks = store.recent_checks("a", 10).await.expect("checks");
        assert_eq!(checks.len(), 2);
        // Newest first, insertion order breaks same-second ties.
        assert_eq!(checks[0].outcome, ProbeOutcome::Unhealthy);
        assert_eq!(checks[1].outcome, ProbeOutcome::Healthy);

        let ep = store.endpoint("a").await.expect("fetch");
        assert_eq!(ep.health_check_count, 2);
        assert_eq!(ep.failed_health_count, 1);
    }

    #[tokio::test]
    async fn failover_transaction_is_atomic() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .insert_endpoint(endpoint("p", EndpointRole::Primary, 10))
            .await
            .expect("insert p");
        store
            .insert_endpoint(endpoint("b", EndpointRole::Backup, 5))
            .await
            .expect("insert b");

        // Promoting a missing candidate must leave the group untouched.
        let err = store
            .apply_failover(Transition {
                failover_group: "g1".to_string(),
                service_kind: ServiceKind::Authentication,
                demote_id: "p".to_string(),
                promote_id: "ghost".to_string(),
                kind: TransitionKind::Failover,
                reason: "test".to_string(),
                automatic: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let p = store.endpoint("p").await.expect("p");
        assert!(p.is_active);
        assert!(
            store
                .latest_failover_event("g1")
                .await
                .expect("query")
                .is_none()
        );

        // A valid transition commits all three writes.
        let event = store
            .apply_failover(Transition {
                failover_group: "g1".to_string(),
                service_kind: ServiceKind::Authentication,
                demote_id: "p".to_string(),
                promote_id: "b".to_string(),
                kind: TransitionKind::Failover,
                reason: "probe failures".to_string(),
                automatic: true,
            })
            .await
            .expect("failover");

        assert!(!store.endpoint("p").await.expect("p").is_active);
        assert!(store.endpoint("b").await.expect("b").is_active);
        let latest = store
            .latest_failover_event("g1")
            .await
            .expect("query")
            .expect("event");
        assert_eq!(latest.id, event.id);
    }

    #[tokio::test]
    async fn rotation_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.db");

        {
            let store = SqliteStore::open(&path).expect("open");
            store
                .insert_endpoint(endpoint("old", EndpointRole::Primary, 10))
                .await
                .expect("insert old");
            let mut fresh = endpoint("new", EndpointRole::Primary, 10);
            fresh.name = "svc-new".to_string();
            fresh.url = "http://new:8081".to_string();
            fresh.failover_group = "g-new".to_string();
            store.insert_endpoint(fresh).await.expect("insert new");

            store
                .apply_rotation(Rotation {
                    old_id: "old".to_string(),
                    new_id: "new".to_string(),
                    reason: "key rotation".to_string(),
                    requested_by: "ops".to_string(),
                    verification_hash: "feed".to_string(),
                    signature: "c2ln".to_string(),
                })
                .await
                .expect("rotation");
        }

        let store = SqliteStore::open(&path).expect("reopen");
        let old = store.endpoint("old").await.expect("old");
        let new = store.endpoint("new").await.expect("new");
        assert_eq!(old.status, EndpointStatus::Decommissioned);
        assert_eq!(new.failover_group, "g1");
        assert!(new.is_active);

        let audits = store.rotation_audits(5).await.expect("audits");
        assert_eq!(audits.len(), 1);
        assert!(audits[0].success);
        assert_eq!(audits[0].verification_hash, "feed");
    }

    #[tokio::test]
    async fn decommission_with_replacement_is_one_transaction() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .insert_endpoint(endpoint("p", EndpointRole::Primary, 10))
            .await
            .expect("insert p");
        store
            .insert_endpoint(endpoint("b", EndpointRole::Backup, 5))
            .await
            .expect("insert b");
        store
            .record_probe("b", probe(ProbeOutcome::Healthy), 3)
            .await
            .expect("probe");

        store
            .decommission_endpoint(
                "p",
                Some(Transition {
                    failover_group: "g1".to_string(),
                    service_kind: ServiceKind::Authentication,
                    demote_id: "p".to_string(),
                    promote_id: "b".to_string(),
                    kind: TransitionKind::Failover,
                    reason: "decommissioned by operator".to_string(),
                    automatic: false,
                }),
            )
            .await
            .expect("decommission");

        let p = store.endpoint("p").await.expect("p");
        let b = store.endpoint("b").await.expect("b");
        assert_eq!(p.status, EndpointStatus::Decommissioned);
        assert!(!p.is_active);
        assert!(b.is_active);

        let event = store
            .latest_failover_event("g1")
            .await
            .expect("query")
            .expect("event");
        assert!(!event.automatic);
    }

    #[tokio::test]
    async fn discovery_ordering_matches_contract() {
        let store = SqliteStore::open_in_memory().expect("open");
        for (id, priority) in [("c", 5), ("a", 10), ("b", 5)] {
            let mut ep = endpoint(id, EndpointRole::Primary, priority);
            ep.failover_group = format!("g-{id}");
            store.insert_endpoint(ep).await.expect("insert");
        }
        // Give b a longer probe history than c.
        for _ in 0..3 {
            store
                .record_probe("b", probe(ProbeOutcome::Healthy), 3)
                .await
                .expect("probe");
        }
        store
            .record_probe("c", probe(ProbeOutcome::Healthy), 3)
            .await
            .expect("probe");
        store
            .record_probe("a", probe(ProbeOutcome::Healthy), 3)
            .await
            .expect("probe");

        let eps = store
            .endpoints_by_kind(ServiceKind::Authentication, true)
            .await
            .expect("list");
        let ids: Vec<&str> = eps.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }
}
