//! Event bus: publishes into lanes, runs the worker pool, owns retry policy

use super::queue::{self, lane_for_priority, lane_for_type, QueueStore, DEAD_LETTER_LANE};
use super::{Event, EventHandler, EventPriority, EventType};
use crate::config::BusConfig;
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Back-off after a queue store error inside a worker loop
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What happened to one popped lane entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// At least one handler succeeded
    Processed,
    /// Every handler failed; re-published with a higher retry count
    Retried,
    /// Retry budget exhausted
    DeadLettered,
    /// Past `expires_at`, dropped
    Expired,
    /// No handler registered for the type, dropped
    Unhandled,
    /// Second copy of a dual-written urgent event, skipped
    Duplicate,
    /// Entry could not be parsed, moved to the dead-letter lane
    Malformed,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    expired: AtomicU64,
    unhandled: AtomicU64,
    duplicates: AtomicU64,
}

/// Point-in-time view of the bus counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventBusMetrics {
    pub events_published: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_retried: u64,
    pub events_expired: u64,
    pub events_unhandled: u64,
    pub duplicates_skipped: u64,
    pub handlers_count: usize,
    pub workers_running: usize,
}

/// Event bus distributing lane entries to handlers
pub struct EventBus {
    store: Arc<dyn QueueStore>,
    config: BusConfig,
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    counters: Counters,
    /// `(event_id, retry_count)` of urgent events whose first copy was taken
    claims: Mutex<HashMap<(String, u32), DateTime<Utc>>>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    rotation: AtomicUsize,
    priority_lanes: Vec<String>,
    type_lanes: Vec<String>,
}

impl EventBus {
    /// Create a bus over an already opened queue store
    pub fn new(store: Arc<dyn QueueStore>, config: BusConfig) -> Self {
        Self {
            store,
            config,
            handlers: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            claims: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            rotation: AtomicUsize::new(0),
            priority_lanes: EventPriority::URGENT.iter().map(|p| lane_for_priority(*p)).collect(),
            type_lanes: EventType::ALL.iter().map(|t| lane_for_type(*t)).collect(),
        }
    }

    /// Open the configured queue transport and build a bus on it.
    ///
    /// An unreachable transport is fatal here rather than at first publish.
    pub async fn connect(config: BusConfig) -> Result<Arc<Self>> {
        let store = queue::connect(&config.queue_url, config.max_queue_size).await?;
        Ok(Arc::new(Self::new(store, config)))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Token cancelled by [`EventBus::shutdown`]; derive child tokens from it
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Register a handler for every event type it declares
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let types = handler.handles();
        {
            let mut handlers = self.handlers.write();
            for event_type in &types {
                handlers.entry(*event_type).or_default().push(handler.clone());
            }
        }
        tracing::info!("Registered handler {} -> {:?}", handler.name(), types);
    }

    /// Register a handler for one event type only
    pub fn register_handler_for(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        tracing::info!("Registered handler {} -> [{}]", handler.name(), event_type);
        self.handlers.write().entry(event_type).or_default().push(handler);
    }

    fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        self.handlers.read().get(&event_type).cloned().unwrap_or_default()
    }

    /// Publish an event into its type lane, and into its priority lane when urgent.
    ///
    /// Returns false, without writing anything, for an already expired event
    /// or when the type lane rejects the push.
    pub async fn publish(&self, event: Event) -> bool {
        if event.is_expired() {
            tracing::debug!("Ignoring expired event {}", event.id);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let raw = match event.to_wire() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("Failed to serialize event {}: {}", event.id, e);
                return false;
            }
        };

        if let Err(e) = self.store.push(&lane_for_type(event.event_type), raw.clone()).await {
            tracing::error!("Failed to publish event {}: {}", event.id, e);
            return false;
        }

        if event.priority.is_urgent() {
            // The type-lane copy is already queued, so the event is still delivered.
            if let Err(e) = self.store.push(&lane_for_priority(event.priority), raw).await {
                tracing::warn!("Priority copy of event {} not queued: {}", event.id, e);
            }
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Published {} event {}", event.event_type, event.id);
        true
    }

    /// Spawn the priority loop plus `workers` general loops
    pub fn start_workers(self: &Arc<Self>, workers: usize) {
        let mut handles = self.workers.lock();

        let bus = self.clone();
        handles.push(tokio::spawn(async move { bus.priority_loop().await }));

        for id in 0..workers {
            let bus = self.clone();
            handles.push(tokio::spawn(async move { bus.general_loop(id).await }));
        }

        tracing::info!("Event bus started {} workers (1 priority + {} general)", workers + 1, workers);
    }

    async fn priority_loop(self: Arc<Self>) {
        let lanes = self.priority_lanes.clone();
        let poll = self.config.priority_poll();

        loop {
            let popped = tokio::select! {
                _ = self.cancel.cancelled() => break,
                popped = self.store.pop_first(&lanes, poll) => popped,
            };

            match popped {
                Ok(Some((lane, raw))) => {
                    self.dispatch_raw(&lane, raw).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Priority worker error: {}", e);
                    if self.pause(STORE_ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Priority worker stopped");
    }

    async fn general_loop(self: Arc<Self>, id: usize) {
        let poll = self.config.idle_poll();
        let mut offset = id;

        loop {
            let lanes = self.general_lanes(offset);
            offset = offset.wrapping_add(1);

            let popped = tokio::select! {
                _ = self.cancel.cancelled() => break,
                popped = self.store.pop_first(&lanes, poll) => popped,
            };

            match popped {
                Ok(Some((lane, raw))) => {
                    self.dispatch_raw(&lane, raw).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Worker {} error: {}", id, e);
                    if self.pause(STORE_ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Worker {} stopped", id);
    }

    /// Sleep unless cancelled first. Returns true when cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Priority lanes first, then every type lane starting at `offset`
    fn general_lanes(&self, offset: usize) -> Vec<String> {
        let count = self.type_lanes.len();
        let start = offset % count;
        self.priority_lanes
            .iter()
            .chain(self.type_lanes[start..].iter())
            .chain(self.type_lanes[..start].iter())
            .cloned()
            .collect()
    }

    /// Pop and dispatch a single entry the way a general worker would.
    ///
    /// Returns `None` when every lane is empty.
    pub async fn process_next(&self) -> Option<DispatchOutcome> {
        let offset = self.rotation.fetch_add(1, Ordering::Relaxed);
        let lanes = self.general_lanes(offset);

        match self.store.pop_first(&lanes, Duration::ZERO).await {
            Ok(Some((lane, raw))) => Some(self.dispatch_raw(&lane, raw).await),
            Ok(None) => None,
            Err(e) => {
                tracing::error!("Queue store error: {}", e);
                None
            }
        }
    }

    async fn dispatch_raw(&self, lane: &str, raw: String) -> DispatchOutcome {
        match Event::from_wire(&raw) {
            Ok(event) => self.dispatch(event).await,
            Err(e) => {
                tracing::error!("Malformed entry in {}: {}", lane, e);
                if let Err(e) = self.store.push(DEAD_LETTER_LANE, raw).await {
                    tracing::error!("Failed to dead-letter malformed entry: {}", e);
                }
                DispatchOutcome::Malformed
            }
        }
    }

    /// Run one event through expiry, de-duplication, handlers and retry policy
    pub async fn dispatch(&self, event: Event) -> DispatchOutcome {
        if event.is_expired() {
            tracing::warn!("Discarding event: {}", OrchestratorError::Expired(event.id.clone()));
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Expired;
        }

        if event.priority.is_urgent() && self.config.dedupe_priority_copies && !self.claim(&event) {
            tracing::debug!("Skipping second copy of event {}", event.id);
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Duplicate;
        }

        let handlers = self.handlers_for(event.event_type);
        if handlers.is_empty() {
            tracing::warn!("{}, dropping event {}", OrchestratorError::NoHandler(event.event_type), event.id);
            self.counters.unhandled.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Unhandled;
        }

        let total = handlers.len();
        let succeeded = self.run_handlers(&event, handlers).await;

        if succeeded > 0 {
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Processed event {} ({}/{} handlers)", event.id, succeeded, total);
            DispatchOutcome::Processed
        } else {
            self.handle_failure(event).await
        }
    }

    /// First sighting of `(id, retry_count)` wins; the second consumes the claim.
    fn claim(&self, event: &Event) -> bool {
        let now = Utc::now();
        let mut claims = self.claims.lock();
        claims.retain(|_, expires_at| *expires_at >= now);

        let key = (event.id.clone(), event.retry_count);
        if claims.remove(&key).is_some() {
            false
        } else {
            claims.insert(key, event.expires_at);
            true
        }
    }

    /// Run every handler in its own task; returns how many succeeded.
    ///
    /// The tasks belong to this dispatch: dropping it aborts them.
    async fn run_handlers(&self, event: &Event, handlers: Vec<Arc<dyn EventHandler>>) -> usize {
        let event = Arc::new(event.clone());
        let timeout = self.config.handler_timeout();

        let mut tasks = JoinSet::new();
        let mut names: HashMap<task::Id, String> = HashMap::new();
        for handler in handlers {
            let name = handler.name().to_string();
            let event = event.clone();
            let abort = tasks.spawn(async move {
                match tokio::time::timeout(timeout, handler.handle(&event)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::warn!("Handler {} failed for event {}: {}", handler.name(), event.id, e);
                        false
                    }
                    Err(_) => {
                        let err = OrchestratorError::HandlerTimeout {
                            handler: handler.name().to_string(),
                            timeout,
                        };
                        tracing::warn!("{} on event {}", err, event.id);
                        false
                    }
                }
            });
            names.insert(abort.id(), name);
        }

        let mut succeeded = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => {
                    let name = names.get(&e.id()).map(String::as_str).unwrap_or("unknown");
                    tracing::error!("Handler {} crashed on event {}: {}", name, event.id, e);
                }
            }
        }
        succeeded
    }

    async fn handle_failure(&self, mut event: Event) -> DispatchOutcome {
        if event.retry_count >= self.config.max_retries {
            tracing::error!("Event {} failed after {} retries", event.id, event.retry_count);
            return self.dead_letter(event).await;
        }

        event.retry_count += 1;
        let delay = self.config.retry_delay() * event.retry_count;
        if self.pause(delay).await {
            tracing::debug!("Shutdown during backoff, re-queueing event {} now", event.id);
        }

        if event.is_expired() {
            tracing::warn!("Not retrying: {}", OrchestratorError::Expired(event.id.clone()));
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Expired;
        }

        let attempt = event.retry_count;
        if !self.publish(event.clone()).await {
            tracing::error!("Retry of event {} could not be re-queued", event.id);
            return self.dead_letter(event).await;
        }

        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Retrying event {} ({}/{})", event.id, attempt, self.config.max_retries);
        DispatchOutcome::Retried
    }

    /// Park a failed event in the dead-letter lane (when enabled) and count it
    async fn dead_letter(&self, event: Event) -> DispatchOutcome {
        if self.config.enable_dead_letter {
            match event.to_wire() {
                Ok(raw) => {
                    if let Err(e) = self.store.push(DEAD_LETTER_LANE, raw).await {
                        tracing::error!("Failed to dead-letter event {}: {}", event.id, e);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize event {}: {}", event.id, e),
            }
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        DispatchOutcome::DeadLettered
    }

    /// Snapshot of the counters
    pub fn metrics(&self) -> EventBusMetrics {
        EventBusMetrics {
            events_published: self.counters.published.load(Ordering::Relaxed),
            events_processed: self.counters.processed.load(Ordering::Relaxed),
            events_failed: self.counters.failed.load(Ordering::Relaxed),
            events_retried: self.counters.retried.load(Ordering::Relaxed),
            events_expired: self.counters.expired.load(Ordering::Relaxed),
            events_unhandled: self.counters.unhandled.load(Ordering::Relaxed),
            duplicates_skipped: self.counters.duplicates.load(Ordering::Relaxed),
            handlers_count: self.handlers.read().values().map(Vec::len).sum(),
            workers_running: self.workers.lock().iter().filter(|h| !h.is_finished()).count(),
        }
    }

    /// Depth of every lane the bus knows about
    pub async fn queue_sizes(&self) -> Result<BTreeMap<String, usize>> {
        let mut sizes = BTreeMap::new();
        let lanes = self
            .priority_lanes
            .iter()
            .chain(self.type_lanes.iter())
            .map(String::as_str)
            .chain(std::iter::once(DEAD_LETTER_LANE));

        for lane in lanes {
            sizes.insert(lane.to_string(), self.store.len(lane).await?);
        }
        Ok(sizes)
    }

    /// Events currently parked in the dead-letter lane
    pub async fn dead_letters(&self) -> Result<Vec<Event>> {
        let raw = self.store.items(DEAD_LETTER_LANE).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match Event::from_wire(entry) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::debug!("Unparseable dead letter: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Stop every loop and wait for in-flight dispatches within the grace
    /// period. The queue store stays open so those dispatches can still
    /// publish responses and retries.
    pub async fn stop(&self) {
        tracing::info!("Event bus stopping");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(self.config.shutdown_grace(), join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("Workers still busy after grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    /// Release the queue store; later publishes fail
    pub async fn close(&self) -> Result<()> {
        self.store.close().await?;
        tracing::info!("Event bus stopped");
        Ok(())
    }

    /// [`EventBus::stop`] followed by [`EventBus::close`]
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await;
        self.close().await
    }
}
