//! Trade Orchestrator
//!
//! Event bus and analysis-service orchestration core for a trading decision
//! loop: producers publish prioritized events, worker tasks dispatch them to
//! handlers with retry and dead-lettering, and a service manager routes
//! analysis requests to healthy provider instances.

pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod manager;
pub mod orchestrator;
pub mod service;


pub use config::Config;
pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
