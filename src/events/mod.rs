//! Event-Driven Messaging Module
//!
//! Every request that crosses a service boundary travels as an [`Event`]:
//! producers build one and hand it to the [`EventBus`], which writes it into
//! named lanes of a [`QueueStore`] and later dispatches it to the registered
//! [`EventHandler`]s.
//!
//! # Architecture
//! ```text
//! Producer -> EventBus::publish -> events:<type> ------------+
//!                               -> priority_events:<prio> ---+-> workers -> [Handlers]
//!                                                                  |
//!                                       retry (linear backoff) <---+---> dead_letter_queue
//! ```
//!
//! # Delivery
//! Delivery is at-least-once. High and Critical events are written to both
//! their type lane and a priority lane; the bus claims the first copy popped
//! and skips the other, but retries re-deliver the same `event_id`, so
//! handlers with external side effects must tolerate repeats.

mod bus;
mod queue;


pub use bus::{DispatchOutcome, EventBus, EventBusMetrics};
pub use queue::{
    connect, lane_for_priority, lane_for_type, InMemoryQueueStore, QueueStore,
    DEAD_LETTER_LANE,
};

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Opaque key/value payload; its schema belongs to each producer/consumer pair
pub type Payload = serde_json::Map<String, Value>;

/// Default lifetime of an event before it is discarded unprocessed
pub const DEFAULT_EVENT_TTL_SECS: i64 = 3600;

/// Turn any JSON value into a payload. Non-object values are wrapped under `value`.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Event priority levels for ordering
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum EventPriority {
    /// Housekeeping, metrics
    Low = 1,
    /// Regular decision traffic
    #[default]
    Normal = 2,
    /// Degradation notices, order updates
    High = 3,
    /// Risk alerts that must not wait
    Critical = 4,
}

impl EventPriority {
    /// Priority lanes drained by the priority loop, most urgent first
    pub const URGENT: [EventPriority; 2] = [EventPriority::Critical, EventPriority::High];

    /// Wire value of the priority
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Whether the event is also written to a priority lane
    pub fn is_urgent(self) -> bool {
        self >= EventPriority::High
    }
}

impl From<EventPriority> for u8 {
    fn from(priority: EventPriority) -> Self {
        priority.value()
    }
}

impl TryFrom<u8> for EventPriority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Critical),
            other => Err(format!("unknown priority value {}", other)),
        }
    }
}

/// Event types exchanged by the trading core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Quote / order book refresh from the brokerage feed
    MarketDataUpdate,
    /// Signal produced by a strategy
    TradingSignal,
    OrderPlaced,
    OrderExecuted,
    /// Risk limit breach
    RiskAlert,
    /// Health of the orchestration layer
    SystemStatus,
    /// Ask the decision service for a trading decision
    AiDecisionRequest,
    /// Decision correlated back to its request
    AiDecisionResponse,
    NewsSentimentUpdate,
    TechnicalAnalysisComplete,
}

impl EventType {
    /// Every event type, in lane polling order
    pub const ALL: [EventType; 10] = [
        EventType::MarketDataUpdate,
        EventType::TradingSignal,
        EventType::OrderPlaced,
        EventType::OrderExecuted,
        EventType::RiskAlert,
        EventType::SystemStatus,
        EventType::AiDecisionRequest,
        EventType::AiDecisionResponse,
        EventType::NewsSentimentUpdate,
        EventType::TechnicalAnalysisComplete,
    ];

    /// Wire name of the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MarketDataUpdate => "market_data_update",
            EventType::TradingSignal => "trading_signal",
            EventType::OrderPlaced => "order_placed",
            EventType::OrderExecuted => "order_executed",
            EventType::RiskAlert => "risk_alert",
            EventType::SystemStatus => "system_status",
            EventType::AiDecisionRequest => "ai_decision_request",
            EventType::AiDecisionResponse => "ai_decision_response",
            EventType::NewsSentimentUpdate => "news_sentiment_update",
            EventType::TechnicalAnalysisComplete => "technical_analysis_complete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message envelope. Field names match the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    #[serde(rename = "event_id")]
    pub id: String,
    pub event_type: EventType,
    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Logical producer
    pub source_service: String,
    /// Logical consumer, informational only
    pub target_service: Option<String>,
    pub priority: EventPriority,
    pub payload: Payload,
    /// Links a response back to the request that caused it
    pub correlation_id: Option<String>,
    /// Re-deliveries so far, maintained by the bus
    pub retry_count: u32,
    /// After this instant the event is discarded unprocessed
    pub expires_at: DateTime<Utc>,
}

impl Event {
    /// Create a new event with auto-generated ID, timestamp and a one hour expiry
    pub fn new(event_type: EventType, source: &str, payload: Payload) -> Self {
        let timestamp = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            timestamp,
            source_service: source.to_string(),
            target_service: None,
            priority: EventPriority::Normal,
            payload,
            correlation_id: None,
            retry_count: 0,
            expires_at: timestamp + Duration::seconds(DEFAULT_EVENT_TTL_SECS),
        }
    }

    /// Set event priority
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the intended consumer
    pub fn with_target(mut self, target: &str) -> Self {
        self.target_service = Some(target.to_string());
        self
    }

    /// Set correlation ID for tracing
    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_string());
        self
    }

    /// Set an absolute expiry
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Set expiry relative to the creation timestamp
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = self.timestamp + ttl;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Create a response to this event.
    ///
    /// The response carries this event's correlation ID, or this event's own
    /// ID when it had none, and is addressed back to this event's source.
    pub fn reply(&self, event_type: EventType, source: &str, payload: Payload) -> Self {
        let mut response = Event::new(event_type, source, payload);
        response.correlation_id = self.correlation_id.clone().or_else(|| Some(self.id.clone()));
        response.target_service = Some(self.source_service.clone());
        response
    }

    /// Serialize to the flat JSON envelope stored in lanes
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a lane entry back into an event
    pub fn from_wire(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(OrchestratorError::from)
    }
}

/// Event handler trait - implement this to handle events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name for logging
    fn name(&self) -> &str;

    /// Event types this handler is interested in
    fn handles(&self) -> Vec<EventType>;

    /// Handle an event. `Ok` counts as success for the at-least-one rule.
    async fn handle(&self, event: &Event) -> Result<()>;
}
