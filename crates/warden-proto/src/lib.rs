//! Domain types for the warden service registry.
//!
//! Defines the endpoint record and the three append-only log record types
//! (health checks, failover events, rotation audits) shared by the store,
//! the health checker, the failover manager, and the discovery API.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Service kind, role, status ──────────────────────────────────────────────

/// The closed set of service categories the registry accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Authentication,
    Permissions,
    Localization,
    Extension,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Permissions => "permissions",
            Self::Localization => "localization",
            Self::Extension => "extension",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authentication" => Some(Self::Authentication),
            "permissions" => Some(Self::Permissions),
            "localization" => Some(Self::Localization),
            "extension" => Some(Self::Extension),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Primary,
    Backup,
}

impl EndpointRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Backup => "backup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Self::Primary),
            "backup" => Some(Self::Backup),
            _ => None,
        }
    }
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a registered endpoint.
///
/// `registering` until the first probe lands, then `healthy`/`unhealthy`
/// driven by the health checker. `decommissioned` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Registering,
    Healthy,
    Unhealthy,
    Decommissioned,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registering => "registering",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Decommissioned => "decommissioned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registering" => Some(Self::Registering),
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            "decommissioned" => Some(Self::Decommissioned),
            _ => None,
        }
    }
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─── Endpoint ────────────────────────────────────────────────────────────────

/// A registered service instance.
///
/// Rows are soft-deleted only; `deleted` endpoints and `decommissioned`
/// endpoints never appear in discovery results. `is_active` is owned by the
/// failover manager and must not be flipped anywhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub kind: ServiceKind,
    pub version: String,
    pub url: String,
    pub health_check_url: String,
    /// PEM-encoded RSA public key (2048 bits minimum).
    pub public_key: String,
    /// Fingerprint/signature over the canonical endpoint tuple (base64).
    pub signature: String,
    /// Optional PEM TLS certificate.
    pub certificate: Option<String>,
    pub role: EndpointRole,
    pub failover_group: String,
    pub is_active: bool,
    /// Higher is preferred when electing a failover candidate.
    pub priority: i64,
    pub status: EndpointStatus,
    /// Opaque JSON blob; stored and returned verbatim, never interpreted.
    pub metadata: serde_json::Value,
    pub registered_by: String,
    pub registered_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_check_count: i64,
    pub failed_health_count: i64,
    pub last_failover_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

impl Endpoint {
    /// True if the endpoint participates in health checking and discovery.
    pub fn is_live(&self) -> bool {
        !self.deleted && self.status != EndpointStatus::Decommissioned
    }
}

// ─── Health check log ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy,
}

impl ProbeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row per probe, appended regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub id: String,
    pub endpoint_id: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: ProbeOutcome,
    pub response_time_ms: i64,
    pub http_status_code: Option<u16>,
    pub error_message: Option<String>,
    pub checked_by: String,
}

// ─── Failover event log ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Failover,
    Failback,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failover => "failover",
            Self::Failback => "failback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "failover" => Some(Self::Failover),
            "failback" => Some(Self::Failback),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row per active-flag transition within a failover group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: String,
    pub failover_group: String,
    pub service_kind: ServiceKind,
    pub old_endpoint_id: String,
    pub new_endpoint_id: String,
    pub reason: String,
    pub kind: TransitionKind,
    pub timestamp: DateTime<Utc>,
    pub automatic: bool,
}

// ─── Rotation audit log ──────────────────────────────────────────────────────

/// One row per rotation attempt, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationAudit {
    pub id: String,
    pub old_endpoint_id: String,
    pub new_endpoint_id: Option<String>,
    pub reason: String,
    pub requested_by: String,
    pub rotation_time: DateTime<Utc>,
    /// SHA-256 hex over the new endpoint's canonical tuple; empty when the
    /// attempt failed before the new endpoint was resolved.
    pub verification_hash: String,
    pub success: bool,
    pub error_message: Option<String>,
}

// ─── Error envelope codes ────────────────────────────────────────────────────

/// Integer error codes for the shared JSON envelope.
///
/// Request errors are 1000–1099, system errors 2000–2099, entity errors
/// 3000–3099. `-1` denotes success.
pub mod codes {
    pub const SUCCESS: i64 = -1;

    pub const INVALID_ADMIN_TOKEN: i64 = 1001;
    pub const MISSING_FIELD: i64 = 1006;
    pub const DUPLICATE: i64 = 1007;
    pub const ROTATION_REJECTED: i64 = 1010;

    pub const STORAGE: i64 = 2001;

    pub const NOT_FOUND: i64 = 3000;
    pub const VALIDATION: i64 = 3002;
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Validate an endpoint or group name: non-empty, bounded, no whitespace.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 128 && !name.chars().any(char::is_whitespace)
}

/// Syntactic URL check: http(s) scheme with a non-empty host part.
pub fn validate_url(url: &str) -> bool {
    let rest = if let Some(r) = url.strip_prefix("https://") {
        r
    } else if let Some(r) = url.strip_prefix("http://") {
        r
    } else {
        return false;
    };
    let host = rest.split('/').next().unwrap_or("");
    !host.is_empty() && !host.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_endpoint() -> Endpoint {
        Endpoint {
            id: "ep-1".to_string(),
            name: "auth-eu-1".to_string(),
            kind: ServiceKind::Authentication,
            version: "1.2.0".to_string(),
            url: "http://auth-eu-1:8081".to_string(),
            health_check_url: "http://auth-eu-1:8081/health".to_string(),
            public_key: "-----BEGIN PUBLIC KEY-----\n...".to_string(),
            signature: "c2ln".to_string(),
            certificate: None,
            role: EndpointRole::Primary,
            failover_group: "auth-eu".to_string(),
            is_active: true,
            priority: 10,
            status: EndpointStatus::Healthy,
            metadata: serde_json::json!({"zone": "eu-1"}),
            registered_by: "admin".to_string(),
            registered_at: Utc::now(),
            last_health_check: None,
            health_check_count: 0,
            failed_health_count: 0,
            last_failover_at: None,
            deleted: false,
        }
    }

    #[test]
    fn service_kind_round_trip() {
        for kind in [
            ServiceKind::Authentication,
            ServiceKind::Permissions,
            ServiceKind::Localization,
            ServiceKind::Extension,
        ] {
            assert_eq!(ServiceKind::parse(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).expect("serialize");
            let back: ServiceKind = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back, kind);
        }
        assert_eq!(ServiceKind::parse("billing"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&EndpointStatus::Decommissioned).unwrap();
        assert_eq!(json, "\"decommissioned\"");
        assert_eq!(
            serde_json::to_string(&TransitionKind::Failback).unwrap(),
            "\"failback\""
        );
    }

    #[test]
    fn endpoint_liveness() {
        let mut ep = make_endpoint();
        assert!(ep.is_live());

        ep.status = EndpointStatus::Decommissioned;
        assert!(!ep.is_live());

        ep.status = EndpointStatus::Unhealthy;
        ep.deleted = true;
        assert!(!ep.is_live());
    }

    #[test]
    fn endpoint_serde_round_trip_preserves_metadata() {
        let ep = make_endpoint();
        let json = serde_json::to_string(&ep).expect("serialize");
        let back: Endpoint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.metadata, serde_json::json!({"zone": "eu-1"}));
        assert_eq!(back.kind, ServiceKind::Authentication);
        assert_eq!(back.role, EndpointRole::Primary);
    }

    #[test]
    fn validate_name_rejects_whitespace_and_empty() {
        assert!(validate_name("auth-eu-1"));
        assert!(validate_name("group_a"));
        assert!(!validate_name(""));
        assert!(!validate_name("has space"));
    }

    #[test]
    fn validate_url_requires_scheme_and_host() {
        assert!(validate_url("http://auth:8081"));
        assert!(validate_url("https://auth.example.com/health"));
        assert!(!validate_url("ftp://auth:8081"));
        assert!(!validate_url("http://"));
        assert!(!validate_url("auth:8081"));
    }
}
