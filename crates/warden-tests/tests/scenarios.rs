//! End-to-end scenarios across the warden crates: registration and
//! discovery, threshold-driven failover, stability-gated failback, degraded
//! groups, and rotation gating — all against the in-memory store with a
//! scripted probe transport.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use warden_api::{ApiPolicy, Discovery, RegisterRequest, RotateRequest};
use warden_api::error::DiscoveryError;
use warden_failover::{FailoverManager, FailoverPolicy};
use warden_health::{HealthChecker, HealthConfig, ProbeSink, Prober, ScriptedProber};
use warden_proto::{EndpointRole, EndpointStatus, ServiceKind, TransitionKind};
use warden_store::{MemoryStore, RegistryStore};

const ADMIN_TOKEN: &str = "0123456789abcdef0123456789abcdef";

struct Stack {
    store: Arc<MemoryStore>,
    prober: Arc<ScriptedProber>,
    checker: Arc<HealthChecker>,
    discovery: Discovery,
    cancel: CancellationToken,
}

fn stack(failback_delay: Duration, min_rotation_age: Duration) -> Stack {
    let store = Arc::new(MemoryStore::new());
    let prober = Arc::new(ScriptedProber::new());

    let failover = Arc::new(FailoverManager::new(
        Arc::clone(&store) as Arc<dyn RegistryStore>,
        FailoverPolicy {
            stability_count: 3,
            failback_delay,
        },
    ));
    let checker = Arc::new(HealthChecker::new(
        Arc::clone(&store) as Arc<dyn RegistryStore>,
        Arc::clone(&prober) as Arc<dyn Prober>,
        Arc::clone(&failover) as Arc<dyn ProbeSink>,
        HealthConfig {
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(100),
            failure_threshold: 3,
            max_concurrent_probes: 8,
            checked_by: "warden-tests".to_string(),
        },
    ));
    let discovery = Discovery::new(
        Arc::clone(&store) as Arc<dyn RegistryStore>,
        failover,
        Arc::clone(&checker),
        ApiPolicy {
            admin_token_min_length: 32,
            min_rotation_age,
        },
    );

    Stack {
        store,
        prober,
        checker,
        discovery,
        cancel: CancellationToken::new(),
    }
}

fn request(
    name: &str,
    url: &str,
    role: EndpointRole,
    group: &str,
    priority: i64,
    public_key: &str,
) -> RegisterRequest {
    RegisterRequest {
        name: name.to_string(),
        kind: ServiceKind::Authentication,
        version: "1.0.0".to_string(),
        url: url.to_string(),
        health_check_url: format!("{url}/health"),
        public_key: public_key.to_string(),
        certificate: None,
        role,
        failover_group: group.to_string(),
        priority,
        metadata: serde_json::json!({}),
        registered_by: "ops".to_string(),
        admin_token: ADMIN_TOKEN.to_string(),
    }
}

/// Register the standard primary/backup pair in group g1: P (priority 10)
/// and B (priority 5), both healthy. Returns their endpoint ids.
async fn register_pair(s: &Stack, public_key: &str) -> (String, String) {
    s.prober.set_status("http://p:8081/health", 200);
    s.prober.set_status("http://b:8081/health", 200);

    let p = s
        .discovery
        .register(request(
            "auth-p",
            "http://p:8081",
            EndpointRole::Primary,
            "g1",
            10,
            public_key,
        ))
        .await
        .expect("register primary");
    let b = s
        .discovery
        .register(request(
            "auth-b",
            "http://b:8081",
            EndpointRole::Backup,
            "g1",
            5,
            public_key,
        ))
        .await
        .expect("register backup");
    (p.endpoint_id, b.endpoint_id)
}

async fn run_rounds(s: &Stack, n: usize) {
    for _ in 0..n {
        s.checker.run_round(&s.cancel).await;
    }
}

// ─── Scenario 1: happy register & discover ───────────────────────────────────

#[tokio::test]
async fn register_and_discover_healthy_endpoint() {
    let s = stack(Duration::from_secs(300), Duration::from_secs(300));
    let (_, public_pem) = warden_signer::generate_keypair(2048).expect("keypair");

    s.prober.set_status("http://a:8081/health", 200);
    let registered = s
        .discovery
        .register(request(
            "auth-a",
            "http://a:8081",
            EndpointRole::Primary,
            "g1",
            10,
            &public_pem,
        ))
        .await
        .expect("register");
    assert_eq!(registered.status, EndpointStatus::Healthy);

    let found = s
        .discovery
        .discover(ServiceKind::Authentication, None, true)
        .await
        .expect("discover");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, registered.endpoint_id);
    assert_eq!(found[0].status, EndpointStatus::Healthy);
    assert!(found[0].is_active);
}

// ─── Scenario 2: failover after the failure threshold ────────────────────────

#[tokio::test]
async fn primary_fails_over_to_backup_at_threshold() {
    let s = stack(Duration::from_secs(300), Duration::from_secs(300));
    let (_, public_pem) = warden_signer::generate_keypair(2048).expect("keypair");
    let (p_id, b_id) = register_pair(&s, &public_pem).await;

    // P starts returning 500.
    s.prober.set_status("http://p:8081/health", 500);

    // Two rounds: threshold not crossed, P still active.
    run_rounds(&s, 2).await;
    assert!(s.store.endpoint(&p_id).await.expect("p").is_active);

    // Third consecutive failure crosses the threshold.
    run_rounds(&s, 1).await;

    let p = s.store.endpoint(&p_id).await.expect("p");
    let b = s.store.endpoint(&b_id).await.expect("b");
    assert_eq!(p.status, EndpointStatus::Unhealthy);
    assert!(!p.is_active);
    assert!(b.is_active);

    let events = s.store.failover_events("g1", 10).await.expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, TransitionKind::Failover);
    assert!(events[0].automatic);
    assert_eq!(events[0].old_endpoint_id, p_id);
    assert_eq!(events[0].new_endpoint_id, b_id);

    let found = s
        .discovery
        .discover(ServiceKind::Authentication, None, true)
        .await
        .expect("discover");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, b_id);
}

// ─── Scenario 3: failback gated by stability and cooldown ────────────────────

#[tokio::test]
async fn failback_blocked_while_cooldown_runs() {
    let s = stack(Duration::from_secs(3600), Duration::from_secs(300));
    let (_, public_pem) = warden_signer::generate_keypair(2048).expect("keypair");
    let (p_id, b_id) = register_pair(&s, &public_pem).await;

    s.prober.set_status("http://p:8081/health", 500);
    run_rounds(&s, 3).await;
    assert!(s.store.endpoint(&b_id).await.expect("b").is_active);

    // P recovers and stays healthy for four rounds — plenty of stability,
    // but the group's cooldown window has not elapsed.
    s.prober.set_status("http://p:8081/health", 200);
    run_rounds(&s, 4).await;

    assert!(!s.store.endpoint(&p_id).await.expect("p").is_active);
    assert!(s.store.endpoint(&b_id).await.expect("b").is_active);
    let events = s.store.failover_events("g1", 10).await.expect("events");
    assert_eq!(events.len(), 1, "no failback during cooldown");
}

#[tokio::test]
async fn failback_fires_once_stability_and_cooldown_hold() {
    let s = stack(Duration::from_secs(0), Duration::from_secs(300));
    let (_, public_pem) = warden_signer::generate_keypair(2048).expect("keypair");
    let (p_id, b_id) = register_pair(&s, &public_pem).await;

    s.prober.set_status("http://p:8081/health", 500);
    run_rounds(&s, 3).await;
    assert!(s.store.endpoint(&b_id).await.expect("b").is_active);

    s.prober.set_status("http://p:8081/health", 200);

    // Two healthy rounds: stability window (3) not met yet.
    run_rounds(&s, 2).await;
    assert!(!s.store.endpoint(&p_id).await.expect("p").is_active);

    // Third healthy round completes the window; cooldown is zero.
    run_rounds(&s, 1).await;

    let p = s.store.endpoint(&p_id).await.expect("p");
    let b = s.store.endpoint(&b_id).await.expect("b");
    assert!(p.is_active);
    assert_eq!(p.status, EndpointStatus::Healthy);
    assert!(!b.is_active);

    let events = s.store.failover_events("g1", 10).await.expect("events");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, TransitionKind::Failback);
    assert_eq!(events[0].new_endpoint_id, p_id);
}

// ─── Scenario 4: degraded group ──────────────────────────────────────────────

#[tokio::test]
async fn degraded_group_reports_unhealthy_active_primary() {
    let s = stack(Duration::from_secs(300), Duration::from_secs(300));
    let (_, public_pem) = warden_signer::generate_keypair(2048).expect("keypair");
    let (p_id, _) = register_pair(&s, &public_pem).await;

    // Both members fail together.
    s.prober.set_status("http://p:8081/health", 500);
    s.prober.set_status("http://b:8081/health", 500);
    run_rounds(&s, 3).await;

    // No transition happened.
    assert!(s.store.failover_events("g1", 10).await.expect("events").is_empty());

    let healthy_only = s
        .discovery
        .discover(ServiceKind::Authentication, None, true)
        .await
        .expect("discover");
    assert!(healthy_only.is_empty());

    let all_active = s
        .discovery
        .discover(ServiceKind::Authentication, None, false)
        .await
        .expect("discover");
    assert_eq!(all_active.len(), 1);
    assert_eq!(all_active[0].id, p_id);
    assert_eq!(all_active[0].status, EndpointStatus::Unhealthy);
    assert!(all_active[0].is_active);
}

// ─── Scenario 5: rotation rejected — replacement too new ─────────────────────

#[tokio::test]
async fn rotation_rejected_for_young_replacement() {
    let s = stack(Duration::from_secs(300), Duration::from_secs(300));
    let (_, old_pem) = warden_signer::generate_keypair(2048).expect("old keypair");
    let (new_private, new_pem) = warden_signer::generate_keypair(2048).expect("new keypair");
    let (p_id, _) = register_pair(&s, &old_pem).await;

    s.prober.set_status("http://n:8081/health", 200);
    let n = s
        .discovery
        .register(request(
            "auth-n",
            "http://n:8081",
            EndpointRole::Primary,
            "g-fresh",
            10,
            &new_pem,
        ))
        .await
        .expect("register n");

    let n_ep = s.store.endpoint(&n.endpoint_id).await.expect("n");
    let err = s
        .discovery
        .rotate(RotateRequest {
            current_endpoint_id: p_id.clone(),
            new_endpoint_id: n.endpoint_id.clone(),
            signature: warden_signer::sign_tuple(
                &new_private,
                &warden_signer::endpoint_tuple(&n_ep),
            ),
            reason: "rotate onto fresh node".to_string(),
            requested_by: "ops".to_string(),
            admin_token: ADMIN_TOKEN.to_string(),
            verification_code: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::TooNewToRotate { .. }));

    // Audited, and nothing changed.
    let audits = s.store.rotation_audits(10).await.expect("audits");
    assert_eq!(audits.len(), 1);
    assert!(!audits[0].success);

    let p = s.store.endpoint(&p_id).await.expect("p");
    assert_ne!(p.status, EndpointStatus::Decommissioned);
    assert!(p.is_active);
}

// ─── Scenario 6: rotation success ────────────────────────────────────────────

#[tokio::test]
async fn rotation_replaces_active_primary() {
    let s = stack(Duration::from_secs(300), Duration::from_secs(0));
    let (_, old_pem) = warden_signer::generate_keypair(2048).expect("old keypair");
    let (new_private, new_pem) = warden_signer::generate_keypair(2048).expect("new keypair");
    let (p_id, _) = register_pair(&s, &old_pem).await;

    s.prober.set_status("http://n:8081/health", 200);
    let n = s
        .discovery
        .register(request(
            "auth-n",
            "http://n:8081",
            EndpointRole::Primary,
            "g-fresh",
            10,
            &new_pem,
        ))
        .await
        .expect("register n");

    let n_ep = s.store.endpoint(&n.endpoint_id).await.expect("n");
    let resp = s
        .discovery
        .rotate(RotateRequest {
            current_endpoint_id: p_id.clone(),
            new_endpoint_id: n.endpoint_id.clone(),
            signature: warden_signer::sign_tuple(
                &new_private,
                &warden_signer::endpoint_tuple(&n_ep),
            ),
            reason: "scheduled rotation".to_string(),
            requested_by: "ops".to_string(),
            admin_token: ADMIN_TOKEN.to_string(),
            verification_code: None,
        })
        .await
        .expect("rotate");
    assert_eq!(resp.old_id, p_id);
    assert_eq!(resp.new_id, n.endpoint_id);

    let old = s.store.endpoint(&p_id).await.expect("old");
    let new = s.store.endpoint(&n.endpoint_id).await.expect("new");
    assert_eq!(old.status, EndpointStatus::Decommissioned);
    assert_eq!(new.failover_group, "g1");
    assert!(new.is_active, "active flag transfers with the rotation");

    let found = s
        .discovery
        .discover(ServiceKind::Authentication, None, false)
        .await
        .expect("discover");
    assert!(found.iter().any(|e| e.id == n.endpoint_id));
    assert!(found.iter().all(|e| e.id != p_id));

    let audits = s.store.rotation_audits(10).await.expect("audits");
    assert!(audits[0].success);
}

// ─── Concurrency: discovery reads are consistent ─────────────────────────────

#[tokio::test]
async fn concurrent_discover_calls_agree() {
    let s = stack(Duration::from_secs(300), Duration::from_secs(300));
    let (_, public_pem) = warden_signer::generate_keypair(2048).expect("keypair");
    register_pair(&s, &public_pem).await;

    let (left, right) = tokio::join!(
        s.discovery.discover(ServiceKind::Authentication, None, true),
        s.discovery.discover(ServiceKind::Authentication, None, true),
    );
    let left = left.expect("left discover");
    let right = right.expect("right discover");

    let left_ids: Vec<&str> = left.iter().map(|e| e.id.as_str()).collect();
    let right_ids: Vec<&str> = right.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(left_ids, right_ids);
}
