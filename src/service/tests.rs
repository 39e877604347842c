//! Tests for the service lifecycle and metrics

use super::*;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};

fn decision_provider() -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::decision("gpt", "HOLD", 0.4))
}

async fn running(provider: Arc<ScriptedProvider>) -> Service {
    let service = Service::new("gpt-1", CapabilityType::Decision, provider);
    assert!(service.initialize().await);
    service
}

fn request() -> Payload {
    crate::events::into_payload(json!({ "symbol": "005930", "price": 70000 }))
}

#[tokio::test]
async fn test_initialize_moves_to_running() {
    let service = Service::new("gpt-1", CapabilityType::Decision, decision_provider());
    assert_eq!(service.status(), ServiceStatus::Initializing);
    assert!(!service.is_selectable());

    assert!(service.initialize().await);
    assert_eq!(service.status(), ServiceStatus::Running);
    assert!(service.is_selectable());
}

#[tokio::test]
async fn test_failed_initialize_is_terminal() {
    let provider = Arc::new(ScriptedProvider::decision("gpt", "HOLD", 0.4).failing_init());
    let service = Service::new("gpt-1", CapabilityType::Decision, provider.clone());

    assert!(!service.initialize().await);
    assert_eq!(service.status(), ServiceStatus::Error);

    // Neither requests nor probes reach the provider any more
    let response = service.process_request(&request()).await;
    assert!(!response.success);
    assert!(!service.health_check().await);
    assert_eq!(provider.calls(), 0);
    assert_eq!(provider.probes(), 0);
    assert_eq!(service.status(), ServiceStatus::Error);
}

#[tokio::test]
async fn test_process_request_success() {
    let service = running(decision_provider()).await;

    let response = service.process_request(&request()).await;
    assert!(response.success);
    assert_eq!(response.service_id.as_deref(), Some("gpt-1"));
    assert_eq!(response.payload.get("signal"), Some(&json!("HOLD")));
    assert_eq!(response.payload.get("confidence"), Some(&json!(0.4)));
    assert!(response.error.is_none());

    let metrics = service.metrics();
    assert_eq!(metrics.requests_total, 1);
    assert_eq!(metrics.requests_success, 1);
    assert_eq!(metrics.requests_failed, 0);
}

#[tokio::test]
async fn test_expected_failure_keeps_service_running() {
    let provider = decision_provider();
    let service = running(provider.clone()).await;
    provider.set_failing(true);

    let response = service.process_request(&request()).await;
    assert!(!response.success);
    assert!(response.error.as_deref().unwrap_or_default().contains("scripted failure"));
    assert!(response.payload.contains_key("error"));
    assert_eq!(service.status(), ServiceStatus::Running);

    let metrics = service.metrics();
    assert_eq!(metrics.requests_total, 1);
    assert_eq!(metrics.requests_failed, 1);
    assert_eq!(metrics.success_rate(), 0.0);
    assert_eq!(metrics.error_rate(), 1.0);
}

#[tokio::test]
async fn test_fault_moves_to_error() {
    let provider = decision_provider();
    let service = running(provider.clone()).await;
    provider.set_faulty(true);

    let response = service.process_request(&request()).await;
    assert!(!response.success);
    assert_eq!(service.status(), ServiceStatus::Error);
    assert!(!service.is_selectable());

    // Recovery of the provider does not revive the instance
    provider.set_faulty(false);
    assert!(!service.health_check().await);
    assert_eq!(provider.probes(), 0);
    assert_eq!(service.status(), ServiceStatus::Error);
}

#[tokio::test]
async fn test_provider_panic_is_contained() {
    let mut provider = MockAnalysisProvider::new();
    provider.expect_initialize().returning(|| Ok(()));
    provider
        .expect_process()
        .returning(|_| panic!("provider bug"));
    provider.expect_resource_usage().returning(|| None);

    let service = Service::new("panicky", CapabilityType::Sentiment, Arc::new(provider));
    assert!(service.initialize().await);

    let response = service.process_request(&Payload::new()).await;
    assert!(!response.success);
    assert!(response.error.as_deref().unwrap_or_default().contains("panicked"));
    assert_eq!(service.status(), ServiceStatus::Error);
    assert_eq!(service.metrics().requests_failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_keep_exact_metrics() {
    const N: u64 = 64;
    let latency = Duration::from_millis(5);
    let provider = Arc::new(ScriptedProvider::decision("gpt", "HOLD", 0.4).with_latency(latency));
    let service = running(provider.clone()).await;

    let request = request();
    let started = Instant::now();
    let responses =
        futures_util::future::join_all((0..N).map(|_| service.process_request(&request))).await;
    let wall = started.elapsed();

    assert!(responses.iter().all(|response| response.success));
    assert_eq!(provider.calls(), N);

    let metrics = service.metrics();
    assert_eq!(metrics.requests_total, N);
    assert_eq!(metrics.requests_success + metrics.requests_failed, N);
    assert_eq!(metrics.requests_success, N);

    // Every sample lies in [latency, wall], so their mean does too
    let mean: f64 = responses.iter().map(|r| r.elapsed.as_secs_f64()).sum::<f64>() / N as f64;
    assert!(metrics.avg_response_time >= latency.as_secs_f64());
    assert!(metrics.avg_response_time <= wall.as_secs_f64());
    assert!((metrics.avg_response_time - mean).abs() < 1e-9);
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let provider = Arc::new(
        ScriptedProvider::decision("slow", "BUY", 0.9).with_latency(Duration::from_millis(500)),
    );
    let service = Service::new("slow-1", CapabilityType::Decision, provider)
        .with_call_timeout(Duration::from_millis(20));
    assert!(service.initialize().await);

    let response = service.process_request(&request()).await;
    assert!(!response.success);
    assert!(response.error.as_deref().unwrap_or_default().contains("Timed out"));
    // A timeout is an expected failure
    assert_eq!(service.status(), ServiceStatus::Running);
}

#[tokio::test]
async fn test_health_check_degrades_and_recovers() {
    let provider = decision_provider();
    let service = running(provider.clone()).await;

    assert!(service.health_check().await);
    assert!(service.metrics().last_health_check.is_some());

    provider.set_healthy(false);
    assert!(!service.health_check().await);
    assert_eq!(service.status(), ServiceStatus::Degraded);
    assert!(!service.is_selectable());

    provider.set_healthy(true);
    assert!(service.health_check().await);
    assert_eq!(service.status(), ServiceStatus::Running);
    assert_eq!(provider.probes(), 3);
}

#[tokio::test]
async fn test_health_check_skips_uninitialized() {
    let provider = decision_provider();
    let service = Service::new("gpt-1", CapabilityType::Decision, provider.clone());

    assert!(!service.health_check().await);
    assert_eq!(provider.probes(), 0);
    assert_eq!(service.status(), ServiceStatus::Initializing);
}

#[tokio::test]
async fn test_shutdown_is_terminal() {
    let provider = decision_provider();
    let service = running(provider.clone()).await;

    service.shutdown().await;
    assert_eq!(service.status(), ServiceStatus::Stopped);

    assert!(!service.health_check().await);
    assert!(!service.initialize().await);
    assert_eq!(service.status(), ServiceStatus::Stopped);
}

/// Provider relying on the default health check
struct ProbeCounting {
    seen: AtomicU64,
    fail: bool,
}

#[async_trait]
impl AnalysisProvider for ProbeCounting {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn process(&self, request: &Payload) -> Result<Payload> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(OrchestratorError::Provider("probe rejected".to_string()));
        }
        Ok(request.clone())
    }

    fn probe_request(&self) -> Payload {
        crate::events::into_payload(json!({ "symbol": "TEST" }))
    }
}

#[tokio::test]
async fn test_default_health_check_runs_probe_request() {
    let healthy = Arc::new(ProbeCounting { seen: AtomicU64::new(0), fail: false });
    let service = Service::new("tech-1", CapabilityType::TechnicalAnalysis, healthy.clone());
    assert!(service.initialize().await);
    assert!(service.health_check().await);
    assert_eq!(healthy.seen.load(Ordering::SeqCst), 1);

    let broken = Arc::new(ProbeCounting { seen: AtomicU64::new(0), fail: true });
    let service = Service::new("tech-2", CapabilityType::TechnicalAnalysis, broken.clone());
    assert!(service.initialize().await);
    assert!(!service.health_check().await);
    assert_eq!(service.status(), ServiceStatus::Degraded);
    // Probes are not counted as requests
    assert_eq!(service.metrics().requests_total, 0);
}

#[test]
fn test_running_mean_of_response_time() {
    let mut metrics = ServiceMetrics::default();
    metrics.record(true, Duration::from_secs(1));
    metrics.record(false, Duration::from_secs(3));
    metrics.record(true, Duration::from_secs(2));

    assert_eq!(metrics.requests_total, 3);
    assert_eq!(metrics.requests_success, 2);
    assert_eq!(metrics.requests_failed, 1);
    assert!((metrics.avg_response_time - 2.0).abs() < 1e-9);
    assert!((metrics.success_rate() - 2.0 / 3.0).abs() < 1e-9);
}

#[test]
fn test_empty_metrics_rates() {
    let metrics = ServiceMetrics::default();
    assert_eq!(metrics.success_rate(), 0.0);
}

#[test]
fn test_status_transitions() {
    use ServiceStatus::*;
    assert!(Initializing.can_transition_to(Running));
    assert!(Running.can_transition_to(Degraded));
    assert!(Degraded.can_transition_to(Running));
    assert!(Running.can_transition_to(Stopped));
    assert!(Error.can_transition_to(Stopped));

    assert!(!Error.can_transition_to(Running));
    assert!(!Stopped.can_transition_to(Running));
    assert!(!Initializing.can_transition_to(Degraded));
    assert!(Stopped.is_terminal());
    assert!(!Degraded.is_terminal());
}

#[test]
fn test_response_payloads() {
    let ok = ServiceResponse::success(
        "gpt-1",
        crate::events::into_payload(json!({ "signal": "BUY" })),
        Duration::from_millis(250),
    )
    .into_payload();
    assert_eq!(ok.get("signal"), Some(&json!("BUY")));
    assert_eq!(ok.get("success"), Some(&json!(true)));
    assert_eq!(ok.get("service_id"), Some(&json!("gpt-1")));
    assert_eq!(ok.get("response_time"), Some(&json!(0.25)));
    assert!(!ok.contains_key("error"));

    let unavailable = ServiceResponse::unavailable(CapabilityType::Decision);
    assert!(!unavailable.success);
    assert!(unavailable.service_id.is_none());
    let payload = unavailable.into_payload();
    assert_eq!(payload.get("success"), Some(&json!(false)));
    assert_eq!(payload.get("error"), Some(&json!("No available decision service")));
}

#[test]
fn test_capability_names() {
    assert_eq!("decision".parse::<CapabilityType>().unwrap(), CapabilityType::Decision);
    assert_eq!(
        "sentiment_analysis".parse::<CapabilityType>().unwrap(),
        CapabilityType::Sentiment
    );
    assert!("astrology".parse::<CapabilityType>().is_err());

    assert_eq!(
        serde_json::to_string(&CapabilityType::Sentiment).unwrap(),
        "\"sentiment_analysis\""
    );
    assert_eq!(
        serde_json::to_string(&CapabilityType::TechnicalAnalysis).unwrap(),
        "\"technical_analysis\""
    );
}
