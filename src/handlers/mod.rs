//! Event handlers wiring the bus to the analysis services


use crate::error::{OrchestratorError, Result};
use crate::events::{Event, EventHandler, EventType};
use crate::manager::ServiceManager;
use crate::service::CapabilityType;
use async_trait::async_trait;
use std::sync::Arc;

/// Turns request events into service calls and publishes the correlated
/// response event.
///
/// A provider failure fails the handler, so the bus retries the request. When
/// no instance of the capability is running, a failure response goes back to
/// the requester instead and the request counts as handled.
pub struct ServiceRequestHandler {
    name: String,
    manager: Arc<ServiceManager>,
    request_type: EventType,
    capability: CapabilityType,
    response_type: EventType,
}

impl ServiceRequestHandler {
    pub fn new(
        manager: Arc<ServiceManager>,
        request_type: EventType,
        capability: CapabilityType,
        response_type: EventType,
    ) -> Self {
        Self {
            name: format!("{}_handler", capability),
            manager,
            request_type,
            capability,
            response_type,
        }
    }

    /// `AiDecisionRequest` -> decision service -> `AiDecisionResponse`
    pub fn decision(manager: Arc<ServiceManager>) -> Self {
        Self::new(
            manager,
            EventType::AiDecisionRequest,
            CapabilityType::Decision,
            EventType::AiDecisionResponse,
        )
    }
}

#[async_trait]
impl EventHandler for ServiceRequestHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self) -> Vec<EventType> {
        vec![self.request_type]
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let response = self.manager.dispatch(self.capability, &event.payload).await;

        if !response.success {
            if let Some(service_id) = &response.service_id {
                return Err(OrchestratorError::Handler(format!(
                    "{} failed on event {}: {}",
                    service_id,
                    event.id,
                    response.error.as_deref().unwrap_or("unknown error")
                )));
            }
        }

        let reply = event
            .reply(self.response_type, &self.name, response.into_payload())
            .with_priority(event.priority);
        let reply_id = reply.id.clone();

        if !self.manager.bus().publish(reply).await {
            return Err(OrchestratorError::Handler(format!(
                "response {} to event {} not queued",
                reply_id, event.id
            )));
        }

        tracing::debug!("Answered {} {} with {}", self.request_type, event.id, reply_id);
        Ok(())
    }
}

/// Surfaces risk alerts in the log
pub struct RiskAlertHandler;

#[async_trait]
impl EventHandler for RiskAlertHandler {
    fn name(&self) -> &str {
        "risk_alert_handler"
    }

    fn handles(&self) -> Vec<EventType> {
        vec![EventType::RiskAlert]
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        tracing::error!(
            "RISK ALERT from {} ({:?}): {}",
            event.source_service,
            event.priority,
            serde_json::Value::Object(event.payload.clone())
        );
        Ok(())
    }
}

/// Logs degradation notices published by the service manager
pub struct SystemStatusHandler;

#[async_trait]
impl EventHandler for SystemStatusHandler {
    fn name(&self) -> &str {
        "system_status_handler"
    }

    fn handles(&self) -> Vec<EventType> {
        vec![EventType::SystemStatus]
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let status = event
            .payload
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        let unhealthy: Vec<&str> = event
            .payload
            .get("unhealthy_services")
            .and_then(|v| v.as_array())
            .map(|ids| ids.iter().filter_map(|id| id.as_str()).collect())
            .unwrap_or_default();

        if unhealthy.is_empty() {
            tracing::info!("System status from {}: {}", event.source_service, status);
        } else {
            tracing::warn!("System {}: unhealthy services {:?}", status, unhealthy);
        }
        Ok(())
    }
}
