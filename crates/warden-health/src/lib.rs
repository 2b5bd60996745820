//! Background health checking for registered endpoints.
//!
//! A supervisor loop probes every live endpoint's health URL on a fixed
//! interval, fanning out the probes in parallel with a bounded concurrency
//! and joining the round before the next tick starts — rounds never overlap.
//! Each outcome is appended to the health log and folded into the endpoint's
//! counters in one store transaction, then handed to the probe sink (the
//! failover manager) for transition evaluation.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_proto::{Endpoint, ProbeOutcome};
use warden_store::{ProbeApplied, ProbeRecord, RegistryStore, StoreError};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Tick period of the check loop.
    pub interval: Duration,
    /// Hard per-probe timeout, independent of the tick interval.
    pub probe_timeout: Duration,
    /// Consecutive unhealthy probes before `status=unhealthy`.
    pub failure_threshold: u32,
    /// Upper bound on concurrently in-flight probes per round.
    pub max_concurrent_probes: usize,
    /// Recorded as `checked_by` on every health-check row.
    pub checked_by: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
            failure_threshold: 3,
            max_concurrent_probes: 16,
            checked_by: "wardend".to_string(),
        }
    }
}

// ─── Probe transport ─────────────────────────────────────────────────────────

/// Raw result of one HTTP GET against a health URL.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub http_status: Option<u16>,
    pub response_time_ms: i64,
    pub error: Option<String>,
}

impl ProbeResult {
    /// Healthy iff the request completed without a transport error and the
    /// status is 2xx or 3xx.
    pub fn outcome(&self) -> ProbeOutcome {
        match (self.error.as_ref(), self.http_status) {
            (None, Some(code)) if (200..400).contains(&code) => ProbeOutcome::Healthy,
            _ => ProbeOutcome::Unhealthy,
        }
    }
}

/// Transport abstraction so tests can script latency and failures.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeResult;
}

/// Production prober: a dedicated reqwest client with its own bounded
/// connection pool, so probe bursts cannot starve the main HTTP client.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeResult {
        let start = std::time::Instant::now();
        let response = self.client.get(url).timeout(timeout).send().await;
        let response_time_ms = start.elapsed().as_millis() as i64;

        match response {
            Ok(resp) => ProbeResult {
                http_status: Some(resp.status().as_u16()),
                response_time_ms,
                error: None,
            },
            Err(e) => ProbeResult {
                http_status: None,
                response_time_ms,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Scripted prober for tests: sticky per-URL results plus one-shot queued
/// overrides. Unknown URLs fail with a transport error.
#[derive(Default)]
pub struct ScriptedProber {
    inner: parking_lot::Mutex<ScriptedInner>,
}

#[derive(Default)]
struct ScriptedInner {
    sticky: std::collections::HashMap<String, ProbeResult>,
    queued: std::collections::HashMap<String, std::collections::VecDeque<ProbeResult>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the result returned for every subsequent probe of `url`.
    pub fn set_response(&self, url: &str, result: ProbeResult) {
        self.inner.lock().sticky.insert(url.to_string(), result);
    }

    /// Queue a one-shot result that takes precedence over the sticky one.
    pub fn queue_response(&self, url: &str, result: ProbeResult) {
        self.inner
            .lock()
            .queued
            .entry(url.to_string())
            .or_default()
            .push_back(result);
    }

    /// Shorthand: sticky HTTP status with zero latency.
    pub fn set_status(&self, url: &str, status: u16) {
        self.set_response(
            url,
            ProbeResult {
                http_status: Some(status),
                response_time_ms: 1,
                error: None,
            },
        );
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, url: &str, _timeout: Duration) -> ProbeResult {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.queued.get_mut(url) {
            if let Some(result) = queue.pop_front() {
                return result;
            }
        }
        inner.sticky.get(url).cloned().unwrap_or(ProbeResult {
            http_status: None,
            response_time_ms: 0,
            error: Some("connection refused".to_string()),
        })
    }
}

// ─── Probe sink ──────────────────────────────────────────────────────────────

/// Receives every applied probe, in round order. The failover manager
/// implements this to maintain stability counters and evaluate transitions;
/// evaluation for one failover group completes before the next endpoint's
/// hand-off is delivered.
#[async_trait]
pub trait ProbeSink: Send + Sync {
    async fn on_probe(&self, applied: &ProbeApplied);
}

/// No-op sink for contexts with no failover manager wired in.
pub struct NullSink;

#[async_trait]
impl ProbeSink for NullSink {
    async fn on_probe(&self, _applied: &ProbeApplied) {}
}

// ─── Health checker ──────────────────────────────────────────────────────────

pub struct HealthChecker {
    store: Arc<dyn RegistryStore>,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn ProbeSink>,
    config: HealthConfig,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        prober: Arc<dyn Prober>,
        sink: Arc<dyn ProbeSink>,
        config: HealthConfig,
    ) -> Self {
        Self {
            store,
            prober,
            sink,
            config,
        }
    }

    /// Run the check loop until the token is cancelled. On shutdown the
    /// current round stops dispatching and drains in-flight probes with a
    /// bounded wait before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            probe_timeout_secs = self.config.probe_timeout.as_secs(),
            failure_threshold = self.config.failure_threshold,
            "health checker started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("health checker shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_round(&cancel).await;
                    if cancel.is_cancelled() {
                        info!("health checker drained final round");
                        return;
                    }
                }
            }
        }
    }

    /// Execute one full round: probe every live endpoint in parallel, then
    /// apply results serially in completion order so that per-group
    /// evaluation stays ordered.
    pub async fn run_round(&self, cancel: &CancellationToken) {
        let endpoints = match self.store.live_endpoints().await {
            Ok(eps) => eps,
            Err(e) => {
                warn!(error = %e, "failed to load endpoints for health round");
                return;
            }
        };
        if endpoints.is_empty() {
            debug!("no live endpoints to probe");
            return;
        }

        let timeout = self.config.probe_timeout;
        let prober = Arc::clone(&self.prober);
        let probes = stream::iter(endpoints)
            .map(|endpoint| {
                let prober = Arc::clone(&prober);
                async move {
                    let result = prober.probe(&endpoint.health_check_url, timeout).await;
                    (endpoint, result)
                }
            })
            .buffer_unordered(self.config.max_concurrent_probes);
        tokio::pin!(probes);

        let mut results = Vec::new();
        let mut draining = false;
        loop {
            if draining {
                // Shutdown requested: wait out in-flight probes, bounded by
                // the probe timeout, without dispatching new waits forever.
                match tokio::time::timeout(timeout, probes.next()).await {
                    Ok(Some(item)) => results.push(item),
                    Ok(None) => break,
                    Err(_) => {
                        warn!("gave up draining in-flight probes");
                        break;
                    }
                }
            } else {
                tokio::select! {
                    item = probes.next() => match item {
                        Some(item) => results.push(item),
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        draining = true;
                    }
                }
            }
        }

        for (endpoint, result) in results {
            self.apply_result(&endpoint, result).await;
        }
    }

    /// Probe a single endpoint immediately, outside the normal schedule.
    /// Used by register and update to expedite reaching `healthy`.
    pub async fn probe_now(&self, endpoint_id: &str) -> Result<ProbeApplied, StoreError> {
        let endpoint = self.store.endpoint(endpoint_id).await?;
        if !endpoint.is_live() {
            return Err(StoreError::InvariantViolation(format!(
                "endpoint {endpoint_id} is not live"
            )));
        }
        let result = self
            .prober
            .probe(&endpoint.health_check_url, self.config.probe_timeout)
            .await;
        self.apply_result(&endpoint, result)
            .await
            .ok_or_else(|| StoreError::Unavailable("probe result was not recorded".to_string()))
    }

    async fn apply_result(&self, endpoint: &Endpoint, result: ProbeResult) -> Option<ProbeApplied> {
        let outcome = result.outcome();
        let record = ProbeRecord {
            timestamp: Utc::now(),
            outcome,
            response_time_ms: result.response_time_ms,
            http_status_code: result.http_status,
            error_message: result.error,
            checked_by: self.config.checked_by.clone(),
        };

        match self
            .store
            .record_probe(&endpoint.id, record, self.config.failure_threshold)
            .await
        {
            Ok(applied) => {
                if applied.status_changed {
                    info!(
                        endpoint = %endpoint.id,
                        from = %applied.previous_status,
                        to = %applied.endpoint.status,
                        "endpoint status changed"
                    );
                }
                self.sink.on_probe(&applied).await;
                Some(applied)
            }
            Err(e) => {
                warn!(endpoint = %endpoint.id, error = %e, "failed to record probe");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_proto::{EndpointRole, EndpointStatus, ServiceKind};
    use warden_store::MemoryStore;

    fn endpoint(id: &str) -> Endpoint {
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
            failover_group: format!("g-{id}"),
            is_active: false,
            priority: 10,
            status: EndpointStatus::Registering,
            metadata: serde_json::Value::Null,
            registered_by: "test".to_string(),
            registered_at: Utc::now(),
            last_health_check: None,
            health_check_count: 0,
            failed_health_count: 0,
            last_failover_at: None,
            deleted: false,
        }
    }

    fn checker(store: Arc<MemoryStore>, prober: Arc<ScriptedProber>) -> HealthChecker {
        HealthChecker::new(
            store,
            prober,
            Arc::new(NullSink),
            HealthConfig {
                interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(100),
                ..HealthConfig::default()
            },
        )
    }

    #[test]
    fn classification_boundaries() {
        let ok = |code: u16| ProbeResult {
            http_status: Some(code),
            response_time_ms: 1,
            error: None,
        };
        assert_eq!(ok(200).outcome(), ProbeOutcome::Healthy);
        assert_eq!(ok(204).outcome(), ProbeOutcome::Healthy);
        assert_eq!(ok(399).outcome(), ProbeOutcome::Healthy);
        assert_eq!(ok(400).outcome(), ProbeOutcome::Unhealthy);
        assert_eq!(ok(500).outcome(), ProbeOutcome::Unhealthy);
        assert_eq!(ok(199).outcome(), ProbeOutcome::Unhealthy);

        let transport_error = ProbeResult {
            http_status: Some(200),
            response_time_ms: 1,
            error: Some("connection reset".to_string()),
        };
        assert_eq!(transport_error.outcome(), ProbeOutcome::Unhealthy);
    }

    #[tokio::test]
    async fn round_probes_all_live_endpoints() {
        let store = Arc::new(MemoryStore::new());
        let prober = Arc::new(ScriptedProber::new());

        for id in ["a", "b"] {
            store
                .insert_endpoint(endpoint(id))
                .await
                .expect("insert");
        }
        prober.set_status("http://a:8081/health", 200);
        prober.set_status("http://b:8081/health", 503);

        let checker = checker(Arc::clone(&store), prober);
        checker.run_round(&CancellationToken::new()).await;

        let a = store.endpoint("a").await.expect("a");
        let b = store.endpoint("b").await.expect("b");
        assert_eq!(a.status, EndpointStatus::Healthy);
        assert_eq!(a.health_check_count, 1);
        assert_eq!(b.failed_health_count, 1);
        // One failure is below the threshold, so b is still registering.
        assert_eq!(b.status, EndpointStatus::Registering);
    }

    #[tokio::test]
    async fn decommissioned_endpoints_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let prober = Arc::new(ScriptedProber::new());

        store.insert_endpoint(endpoint("a")).await.expect("insert");
        store
            .decommission_endpoint("a", None)
            .await
            .expect("decommission");
        prober.set_status("http://a:8081/health", 200);

        let checker = checker(Arc::clone(&store), prober);
        checker.run_round(&CancellationToken::new()).await;

        let a = store.endpoint("a").await.expect("a");
        assert_eq!(a.health_check_count, 0);
        assert!(store.recent_checks("a", 10).await.expect("checks").is_empty());
    }

    #[tokio::test]
    async fn threshold_crossing_over_rounds() {
        let store = Arc::new(MemoryStore::new());
        let prober = Arc::new(ScriptedProber::new());

        store.insert_endpoint(endpoint("a")).await.expect("insert");
        prober.set_status("http://a:8081/health", 500);

        let checker = checker(Arc::clone(&store), prober);
        let cancel = CancellationToken::new();
        for _ in 0..2 {
            checker.run_round(&cancel).await;
        }
        assert_eq!(
            store.endpoint("a").await.expect("a").status,
            EndpointStatus::Registering
        );

        checker.run_round(&cancel).await;
        assert_eq!(
            store.endpoint("a").await.expect("a").status,
            EndpointStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn probe_now_records_immediately() {
        let store = Arc::new(MemoryStore::new());
        let prober = Arc::new(ScriptedProber::new());

        store.insert_endpoint(endpoint("a")).await.expect("insert");
        prober.set_status("http://a:8081/health", 200);

        let checker = checker(Arc::clone(&store), prober);
        let applied = checker.probe_now("a").await.expect("probe");
        assert!(applied.status_changed);
        assert_eq!(applied.endpoint.status, EndpointStatus::Healthy);
    }

    #[tokio::test]
    async fn run_exits_on_cancellation() {
        let store = Arc::new(MemoryStore::new());
        let prober = Arc::new(ScriptedProber::new());
        let checker = Arc::new(checker(store, prober));

        let cancel = CancellationToken::new();
        let handle = {
            let checker = Arc::clone(&checker);
            let cancel = cancel.clone();
            tokio::spawn(async move { checker.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("health loop should exit promptly after cancel")
            .expect("health loop task should not panic");
    }
}
