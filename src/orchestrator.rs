//! Composition root: one bus, one service manager, the standard handlers

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::events::EventBus;
use crate::handlers::{RiskAlertHandler, ServiceRequestHandler, SystemStatusHandler};
use crate::manager::ServiceManager;
use crate::service::{CapabilityType, ScriptedProvider, Service};
use std::sync::Arc;

pub struct Orchestrator {
    config: Config,
    bus: Arc<EventBus>,
    manager: Arc<ServiceManager>,
}

impl Orchestrator {
    /// Connect the queue transport and wire handlers around `services`.
    ///
    /// Fails when the configuration is invalid or the transport is unreachable.
    pub async fn new(config: Config, services: Vec<Arc<Service>>) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::connect(config.bus.clone()).await?;
        let manager = Arc::new(ServiceManager::new(bus.clone(), config.services.clone(), services));

        bus.register_handler(Arc::new(ServiceRequestHandler::decision(manager.clone())));
        bus.register_handler(Arc::new(RiskAlertHandler));
        bus.register_handler(Arc::new(SystemStatusHandler));

        Ok(Self { config, bus, manager })
    }

    /// Canned providers for every capability, for dry runs
    pub fn scripted_services(config: &Config) -> Vec<Arc<Service>> {
        let timeout = config.services.call_timeout();
        let scripted = [
            ("gpt-decision-1", CapabilityType::Decision, ScriptedProvider::decision("gpt-decision-1", "HOLD", 0.4)),
            ("gpt-decision-2", CapabilityType::Decision, ScriptedProvider::decision("gpt-decision-2", "HOLD", 0.4)),
            ("sentiment-1", CapabilityType::Sentiment, ScriptedProvider::sentiment("sentiment-1", 0.0)),
            ("technical-1", CapabilityType::TechnicalAnalysis, ScriptedProvider::technical("technical-1", "sideways")),
        ];

        scripted
            .into_iter()
            .map(|(id, capability, provider)| {
                Arc::new(Service::new(id, capability, Arc::new(provider)).with_call_timeout(timeout))
            })
            .collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<ServiceManager> {
        &self.manager
    }

    /// Initialize services, then start workers and health checks.
    ///
    /// Fails when no service at all came up.
    pub async fn start(&self) -> Result<()> {
        if !self.manager.initialize().await {
            return Err(OrchestratorError::Internal(
                "no analysis service initialized".to_string(),
            ));
        }

        self.bus.start_workers(self.config.bus.worker_count);
        self.manager.spawn_health_check_loop();
        tracing::info!("Orchestrator started");
        Ok(())
    }

    /// Drain the bus first so in-flight dispatches still find running
    /// services, then stop the services, then close the queue store.
    pub async fn shutdown(&self) -> Result<()> {
        self.bus.stop().await;
        self.manager.shutdown().await;
        self.bus.close().await
    }
}
