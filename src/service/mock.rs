//! Scripted analysis provider
//!
//! Answers every request with a canned payload. Used for:
//! - Dry runs of the orchestrator without any external model
//! - Tests that need to flip health or inject faults at runtime

use super::{AnalysisProvider, ResourceUsage};
use crate::error::{OrchestratorError, Result};
use crate::events::Payload;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub struct ScriptedProvider {
    name: String,
    response: RwLock<Payload>,
    init_fails: bool,
    healthy: AtomicBool,
    failing: AtomicBool,
    faulty: AtomicBool,
    latency: Duration,
    calls: AtomicU64,
    probes: AtomicU64,
}

impl ScriptedProvider {
    pub fn new(name: &str, response: Payload) -> Self {
        Self {
            name: name.to_string(),
            response: RwLock::new(response),
            init_fails: false,
            healthy: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            faulty: AtomicBool::new(false),
            latency: Duration::ZERO,
            calls: AtomicU64::new(0),
            probes: AtomicU64::new(0),
        }
    }

    /// Provider that always answers with a fixed trading decision
    pub fn decision(name: &str, signal: &str, confidence: f64) -> Self {
        Self::new(name, payload(json!({ "signal": signal, "confidence": confidence })))
    }

    pub fn sentiment(name: &str, score: f64) -> Self {
        Self::new(name, payload(json!({ "sentiment_score": score, "confidence": 0.5 })))
    }

    pub fn technical(name: &str, trend: &str) -> Self {
        Self::new(name, payload(json!({ "trend": trend, "rsi": 50.0 })))
    }

    /// Fail `initialize`
    pub fn failing_init(mut self) -> Self {
        self.init_fails = true;
        self
    }

    /// Delay every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make `process` return an expected provider error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make `process` report an unrecoverable fault
    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::SeqCst);
    }

    pub fn set_response(&self, response: Payload) {
        *self.response.write() = response;
    }

    /// Requests processed so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Health probes received so far
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }
}

fn payload(value: serde_json::Value) -> Payload {
    crate::events::into_payload(value)
}

#[async_trait]
impl AnalysisProvider for ScriptedProvider {
    async fn initialize(&self) -> Result<()> {
        if self.init_fails {
            return Err(OrchestratorError::Provider(format!(
                "{}: scripted init failure",
                self.name
            )));
        }
        Ok(())
    }

    async fn process(&self, _request: &Payload) -> Result<Payload> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.faulty.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ServiceFault {
                service_id: self.name.clone(),
                message: "scripted fault".to_string(),
            });
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Provider(format!(
                "{}: scripted failure",
                self.name
            )));
        }
        Ok(self.response.read().clone())
    }

    async fn health_check(&self) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrchestratorError::Provider(format!("{}: unhealthy", self.name)))
        }
    }

    fn resource_usage(&self) -> Option<ResourceUsage> {
        Some(ResourceUsage {
            memory_mb: 0.0,
            cpu_percent: 0.0,
        })
    }
}
