//! Analysis services
//!
//! A [`Service`] wraps one external analysis provider (an LLM decision
//! engine, a sentiment model, a technical-analysis calculator) and gives it a
//! lifecycle, request metrics and a bounded call time. Providers only need to
//! implement [`AnalysisProvider`].
//!
//! # Lifecycle
//! ```text
//! Initializing --init ok--> Running <--probe ok-- Degraded
//!      |                      |  \----probe failed---^
//!      |                      |        |
//!      +--init failed--> Error <--fault+
//!
//! shutdown(): any state --> Stopped
//! ```
//! `Error` and `Stopped` are terminal: an instance in either is never
//! selected again.

mod mock;

#[cfg(test)]
mod tests;

pub use mock::ScriptedProvider;

use crate::error::{OrchestratorError, Result};
use crate::events::Payload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default bound for a single provider call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Category of work a service performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    /// Produce a trading decision
    Decision,
    #[serde(rename = "sentiment_analysis")]
    Sentiment,
    TechnicalAnalysis,
    NewsAnalysis,
    MarketData,
}

impl CapabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::Decision => "decision",
            CapabilityType::Sentiment => "sentiment_analysis",
            CapabilityType::TechnicalAnalysis => "technical_analysis",
            CapabilityType::NewsAnalysis => "news_analysis",
            CapabilityType::MarketData => "market_data",
        }
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "decision" | "gpt_decision" => Ok(CapabilityType::Decision),
            "sentiment" | "sentiment_analysis" => Ok(CapabilityType::Sentiment),
            "technical" | "technical_analysis" => Ok(CapabilityType::TechnicalAnalysis),
            "news" | "news_analysis" => Ok(CapabilityType::NewsAnalysis),
            "market_data" => Ok(CapabilityType::MarketData),
            other => Err(OrchestratorError::Config(format!("unknown capability: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Initializing,
    Running,
    Degraded,
    Stopped,
    Error,
}

impl ServiceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Error)
    }

    /// Allowed edges of the lifecycle state machine
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match (self, next) {
            (Stopped, _) => false,
            (Error, Stopped) => true,
            (Error, _) => false,
            (_, Stopped) | (_, Error) => true,
            (Initializing, Running) => true,
            (Running | Degraded, Running | Degraded) => true,
            _ => false,
        }
    }
}

/// Process resource gauges a provider may report about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// Request metrics owned by one service instance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceMetrics {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    /// Running mean of request latency, in seconds
    pub avg_response_time: f64,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub uptime_seconds: f64,
}

impl ServiceMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.requests_total == 0 {
            return 0.0;
        }
        self.requests_success as f64 / self.requests_total as f64
    }

    pub fn error_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }

    /// Count one request and fold its latency into the running mean
    pub fn record(&mut self, success: bool, elapsed: Duration) {
        self.requests_total += 1;
        if success {
            self.requests_success += 1;
        } else {
            self.requests_failed += 1;
        }

        let n = self.requests_total as f64;
        self.avg_response_time = (self.avg_response_time * (n - 1.0) + elapsed.as_secs_f64()) / n;
    }
}

/// Contract every external analysis provider is wrapped behind.
///
/// Expected failures (bad input, upstream rate limits, empty results) are
/// returned as [`OrchestratorError::Provider`]. Anything that means the
/// provider can no longer be trusted is an [`OrchestratorError::ServiceFault`];
/// a panic is treated the same way.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Provider-specific setup, e.g. opening an API client
    async fn initialize(&self) -> Result<()>;

    /// The unit of work
    async fn process(&self, request: &Payload) -> Result<Payload>;

    /// Cheap liveness probe; by default runs `process` on [`Self::probe_request`]
    async fn health_check(&self) -> Result<()> {
        self.process(&self.probe_request()).await.map(|_| ())
    }

    /// Synthetic request used by the default health check
    fn probe_request(&self) -> Payload {
        Payload::new()
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn resource_usage(&self) -> Option<ResourceUsage> {
        None
    }
}

/// Result of one `process_request` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceResponse {
    /// Instance that answered; `None` for synthetic responses
    pub service_id: Option<String>,
    pub success: bool,
    pub payload: Payload,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl ServiceResponse {
    pub fn success(service_id: &str, payload: Payload, elapsed: Duration) -> Self {
        Self {
            service_id: Some(service_id.to_string()),
            success: true,
            payload,
            error: None,
            elapsed,
        }
    }

    pub fn failure(service_id: Option<&str>, error: String, elapsed: Duration) -> Self {
        let mut payload = Payload::new();
        payload.insert("error".to_string(), Value::String(error.clone()));
        Self {
            service_id: service_id.map(str::to_string),
            success: false,
            payload,
            error: Some(error),
            elapsed,
        }
    }

    /// Synthetic failure for a capability with no running instance
    pub fn unavailable(capability: CapabilityType) -> Self {
        Self::failure(
            None,
            OrchestratorError::ServiceUnavailable(capability).to_string(),
            Duration::ZERO,
        )
    }

    /// Flatten into an event payload: provider fields plus `success`,
    /// `response_time`, `service_id` and `error` when present.
    pub fn into_payload(self) -> Payload {
        let mut payload = self.payload;
        payload.insert("success".to_string(), Value::Bool(self.success));
        payload.insert("response_time".to_string(), Value::from(self.elapsed.as_secs_f64()));
        if let Some(id) = self.service_id {
            payload.insert("service_id".to_string(), Value::String(id));
        }
        if let Some(error) = self.error {
            payload.insert("error".to_string(), Value::String(error));
        }
        payload
    }
}

/// A lifecycle-managed wrapper around one analysis provider
pub struct Service {
    id: String,
    capability: CapabilityType,
    provider: Arc<dyn AnalysisProvider>,
    status: RwLock<ServiceStatus>,
    metrics: Mutex<ServiceMetrics>,
    started_at: Instant,
    call_timeout: Duration,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("capability", &self.capability)
            .field("status", &self.status())
            .finish()
    }
}

impl Service {
    pub fn new(id: &str, capability: CapabilityType, provider: Arc<dyn AnalysisProvider>) -> Self {
        Self {
            id: id.to_string(),
            capability,
            provider,
            status: RwLock::new(ServiceStatus::Initializing),
            metrics: Mutex::new(ServiceMetrics::default()),
            started_at: Instant::now(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound every provider call by `timeout`
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capability(&self) -> CapabilityType {
        self.capability
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read()
    }

    /// Only running instances receive traffic
    pub fn is_selectable(&self) -> bool {
        self.status() == ServiceStatus::Running
    }

    /// Snapshot of the metrics with uptime brought up to date
    pub fn metrics(&self) -> ServiceMetrics {
        let mut metrics = self.metrics.lock().clone();
        metrics.uptime_seconds = self.started_at.elapsed().as_secs_f64();
        metrics
    }

    fn transition(&self, next: ServiceStatus) -> bool {
        let mut status = self.status.write();
        let current = *status;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            tracing::debug!("Service {} ignores {:?} -> {:?}", self.id, current, next);
            return false;
        }
        *status = next;
        drop(status);

        match next {
            ServiceStatus::Running => tracing::info!("Service {} is running", self.id),
            ServiceStatus::Degraded => tracing::warn!("Service {} degraded", self.id),
            ServiceStatus::Error => tracing::error!("Service {} moved to error state", self.id),
            ServiceStatus::Stopped => tracing::info!("Service {} stopped", self.id),
            ServiceStatus::Initializing => {}
        }
        true
    }

    /// Run a provider call in its own task, bounded by the call timeout.
    /// A panic inside the provider surfaces as a service fault.
    async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn AnalysisProvider>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::spawn(op(self.provider.clone()));
        let abort = task.abort_handle();

        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(OrchestratorError::ServiceFault {
                service_id: self.id.clone(),
                message: if join_error.is_panic() {
                    "provider panicked".to_string()
                } else {
                    join_error.to_string()
                },
            }),
            Err(_) => {
                abort.abort();
                Err(OrchestratorError::Timeout(self.call_timeout))
            }
        }
    }

    fn record(&self, success: bool, elapsed: Duration) {
        let usage = self.provider.resource_usage();
        let mut metrics = self.metrics.lock();
        metrics.record(success, elapsed);
        if let Some(usage) = usage {
            metrics.memory_usage_mb = usage.memory_mb;
            metrics.cpu_usage_percent = usage.cpu_percent;
        }
        metrics.uptime_seconds = self.started_at.elapsed().as_secs_f64();
    }

    /// Provider setup. Returns false, leaving the instance in `Error`, on failure.
    pub async fn initialize(&self) -> bool {
        match self.call(|provider| async move { provider.initialize().await }).await {
            Ok(()) => self.transition(ServiceStatus::Running),
            Err(e) => {
                tracing::error!("Service {} failed to initialize: {}", self.id, e);
                self.transition(ServiceStatus::Error);
                false
            }
        }
    }

    /// Process one request. Never panics; failures come back as `success=false`.
    pub async fn process_request(&self, request: &Payload) -> ServiceResponse {
        let started = Instant::now();
        let status = self.status();

        let result = match status {
            ServiceStatus::Running | ServiceStatus::Degraded => {
                let request = request.clone();
                self.call(move |provider| async move { provider.process(&request).await })
                    .await
            }
            other => Err(OrchestratorError::Provider(format!(
                "service {} is {:?}",
                self.id, other
            ))),
        };
        let elapsed = started.elapsed();

        let response = match result {
            Ok(payload) => ServiceResponse::success(&self.id, payload, elapsed),
            Err(e) => {
                if e.is_fatal() {
                    tracing::error!("Service {} fault: {}", self.id, e);
                    self.transition(ServiceStatus::Error);
                } else {
                    tracing::warn!("Service {} request failed: {}", self.id, e);
                }
                ServiceResponse::failure(Some(&self.id), e.to_string(), elapsed)
            }
        };

        self.record(response.success, elapsed);
        response
    }

    /// Probe the provider. Running/Degraded instances move between those two
    /// states on the result; any other state reports unhealthy without a probe.
    pub async fn health_check(&self) -> bool {
        let healthy = match self.status() {
            ServiceStatus::Running | ServiceStatus::Degraded => {
                match self.call(|provider| async move { provider.health_check().await }).await {
                    Ok(()) => {
                        self.transition(ServiceStatus::Running);
                        true
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::error!("Service {} health probe fault: {}", self.id, e);
                        self.transition(ServiceStatus::Error);
                        false
                    }
                    Err(e) => {
                        tracing::warn!("Service {} health probe failed: {}", self.id, e);
                        self.transition(ServiceStatus::Degraded);
                        false
                    }
                }
            }
            other => {
                tracing::debug!("Service {} not probed while {:?}", self.id, other);
                false
            }
        };

        let mut metrics = self.metrics.lock();
        metrics.last_health_check = Some(Utc::now());
        metrics.uptime_seconds = self.started_at.elapsed().as_secs_f64();
        healthy
    }

    /// Release provider resources; the instance ends up `Stopped`
    pub async fn shutdown(&self) {
        if self.status() == ServiceStatus::Stopped {
            return;
        }
        if let Err(e) = self.call(|provider| async move { provider.shutdown().await }).await {
            tracing::warn!("Service {} shutdown error: {}", self.id, e);
        }
        self.transition(ServiceStatus::Stopped);
    }
}
