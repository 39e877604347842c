//! Service manager
//!
//! Owns the fixed registry of [`Service`] instances, routes capability
//! requests through the [`LoadBalancer`], and runs the periodic health check
//! that takes failing instances out of rotation and announces it on the bus.

mod balancer;


pub use balancer::LoadBalancer;

use crate::config::ServiceManagerConfig;
use crate::events::{into_payload, Event, EventBus, EventPriority, EventType, Payload};
use crate::service::{CapabilityType, Service, ServiceMetrics, ServiceResponse, ServiceStatus};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Source name on events published by the manager
pub const MANAGER_SOURCE: &str = "ai_service_manager";

/// Per-service entry of [`SystemMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub capability: CapabilityType,
    pub status: ServiceStatus,
    pub success_rate: f64,
    #[serde(flatten)]
    pub metrics: ServiceMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_services: usize,
    pub running_services: usize,
    pub total_requests: u64,
    pub overall_success_rate: f64,
    /// Mean of the per-service averages, over services that have served requests
    pub avg_response_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub services: BTreeMap<String, ServiceSnapshot>,
    pub summary: MetricsSummary,
}

pub struct ServiceManager {
    bus: Arc<EventBus>,
    config: ServiceManagerConfig,
    services: Vec<Arc<Service>>,
    balancer: LoadBalancer,
    cancel: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceManager {
    /// Build a manager over a fixed set of services.
    ///
    /// The manager stops with the bus: its cancellation token is a child of
    /// the bus token.
    pub fn new(bus: Arc<EventBus>, config: ServiceManagerConfig, services: Vec<Arc<Service>>) -> Self {
        let cancel = bus.cancellation_token().child_token();
        Self {
            bus,
            config,
            services,
            balancer: LoadBalancer::new(),
            cancel,
            health_task: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    /// Initialize every service concurrently. True if at least one came up.
    pub async fn initialize(&self) -> bool {
        let results = join_all(self.services.iter().map(|service| service.initialize())).await;
        let ready = results.iter().filter(|ok| **ok).count();

        if ready == 0 {
            tracing::error!("No service initialized ({} registered)", self.services.len());
        } else {
            tracing::info!("Initialized {}/{} services", ready, self.services.len());
        }
        ready > 0
    }

    /// Next running instance of `capability`, round-robin
    pub fn get_service(&self, capability: CapabilityType) -> Option<Arc<Service>> {
        let candidates: Vec<Arc<Service>> = self
            .services
            .iter()
            .filter(|service| service.capability() == capability && service.is_selectable())
            .cloned()
            .collect();

        if candidates.is_empty() {
            return None;
        }
        self.balancer.select(&candidates).ok()
    }

    /// Route a request to a running instance of `capability`.
    ///
    /// Without one, returns a synthetic failure naming the capability.
    pub async fn dispatch(&self, capability: CapabilityType, request: &Payload) -> ServiceResponse {
        match self.get_service(capability) {
            Some(service) => {
                tracing::debug!("Dispatching {} request to {}", capability, service.id());
                service.process_request(request).await
            }
            None => {
                tracing::warn!("No available {} service", capability);
                ServiceResponse::unavailable(capability)
            }
        }
    }

    /// One health-check pass over every instance, whatever its status.
    ///
    /// Returns the ids of unhealthy instances; when there are any, a High
    /// priority `SystemStatus` event naming them is published.
    pub async fn run_health_checks(&self) -> Vec<String> {
        let results = join_all(self.services.iter().map(|service| service.health_check())).await;

        let unhealthy: Vec<String> = self
            .services
            .iter()
            .zip(results)
            .filter(|(_, healthy)| !healthy)
            .map(|(service, _)| service.id().to_string())
            .collect();

        if !unhealthy.is_empty() {
            tracing::warn!("Unhealthy services: {:?}", unhealthy);

            let alert = Event::new(
                EventType::SystemStatus,
                MANAGER_SOURCE,
                into_payload(json!({
                    "status": "degraded",
                    "unhealthy_services": unhealthy,
                })),
            )
            .with_priority(EventPriority::High);

            if !self.bus.publish(alert).await {
                tracing::error!("Failed to publish degraded status");
            }
        }

        unhealthy
    }

    /// Run health checks every `interval` until cancelled
    pub async fn health_check_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A pass already under way finishes before the loop notices cancellation
            self.run_health_checks().await;
        }

        tracing::debug!("Health check loop stopped");
    }

    /// Start the health-check loop on its own task, at the configured interval
    pub fn spawn_health_check_loop(self: &Arc<Self>) {
        let manager = self.clone();
        let interval = self.config.health_check_interval();
        let handle = tokio::spawn(async move { manager.health_check_loop(interval).await });

        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!("Health checks every {:?}", interval);
    }

    /// Per-service metrics plus a system-wide summary
    pub fn system_metrics(&self) -> SystemMetrics {
        let mut services = BTreeMap::new();
        let mut summary = MetricsSummary {
            total_services: self.services.len(),
            ..MetricsSummary::default()
        };
        let mut total_success = 0u64;
        let mut response_times = Vec::new();

        for service in &self.services {
            let metrics = service.metrics();
            let status = service.status();

            if status == ServiceStatus::Running {
                summary.running_services += 1;
            }
            summary.total_requests += metrics.requests_total;
            total_success += metrics.requests_success;
            if metrics.avg_response_time > 0.0 {
                response_times.push(metrics.avg_response_time);
            }

            services.insert(
                service.id().to_string(),
                ServiceSnapshot {
                    capability: service.capability(),
                    status,
                    success_rate: metrics.success_rate(),
                    metrics,
                },
            );
        }

        if summary.total_requests > 0 {
            summary.overall_success_rate = total_success as f64 / summary.total_requests as f64;
        }
        if !response_times.is_empty() {
            summary.avg_response_time = response_times.iter().sum::<f64>() / response_times.len() as f64;
        }

        SystemMetrics { services, summary }
    }

    /// Stop the health-check loop, then shut every service down concurrently
    pub async fn shutdown(&self) {
        tracing::info!("Service manager shutting down");
        self.cancel.cancel();

        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.config.shutdown_grace(), task).await.is_err() {
                tracing::warn!("Health check still running after grace period, aborting");
                abort.abort();
            }
        }

        join_all(self.services.iter().map(|service| service.shutdown())).await;
        tracing::info!("Service manager stopped");
    }
}
