//! Queue store: named FIFO lanes holding serialized events
//!
//! Lane names follow the broker layout `events:<type>`,
//! `priority_events:<priority>` and `dead_letter_queue`, so a broker-backed
//! store can interoperate with the in-memory one.

use super::{EventPriority, EventType};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Lane holding events that exhausted their retry budget
pub const DEAD_LETTER_LANE: &str = "dead_letter_queue";

/// Lane for all events of one type
pub fn lane_for_type(event_type: EventType) -> String {
    format!("events:{}", event_type.as_str())
}

/// Lane for urgent copies of one priority class
pub fn lane_for_priority(priority: EventPriority) -> String {
    format!("priority_events:{}", priority.value())
}

/// Storage behind the event bus.
///
/// `pop_first` must be atomic: when several workers poll the same lane,
/// exactly one of them receives a given item.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Check the store is reachable
    async fn ping(&self) -> Result<()>;

    /// Append an item to the back of a lane
    async fn push(&self, lane: &str, item: String) -> Result<()>;

    /// Pop from the front of the first non-empty lane, in the order given.
    ///
    /// Waits up to `timeout` for an item to arrive; `Duration::ZERO` polls once.
    async fn pop_first(&self, lanes: &[String], timeout: Duration) -> Result<Option<(String, String)>>;

    /// Number of items waiting in a lane
    async fn len(&self, lane: &str) -> Result<usize>;

    /// Copy of a lane's contents, front first
    async fn items(&self, lane: &str) -> Result<Vec<String>>;

    /// Release the connection. Later calls fail with a transport error.
    async fn close(&self) -> Result<()>;
}

/// Open the queue store named by a transport URL
pub async fn connect(url: &str, lane_capacity: usize) -> Result<Arc<dyn QueueStore>> {
    let store: Arc<dyn QueueStore> = match url.trim() {
        "memory" | "memory://" => Arc::new(InMemoryQueueStore::new(lane_capacity)),
        other => {
            return Err(OrchestratorError::Transport(format!(
                "unsupported queue transport: {}",
                other
            )))
        }
    };

    store.ping().await?;
    tracing::info!("Queue store connected: {}", url);
    Ok(store)
}

/// Mutex-guarded deques with a wake-up signal for blocked poppers
pub struct InMemoryQueueStore {
    lanes: Mutex<HashMap<String, VecDeque<String>>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl InMemoryQueueStore {
    /// Create a store whose lanes each hold at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OrchestratorError::Transport("queue store closed".to_string()));
        }
        Ok(())
    }

    fn try_pop_first(&self, lanes: &[String]) -> Option<(String, String)> {
        let mut guard = self.lanes.lock();
        for lane in lanes {
            if let Some(item) = guard.get_mut(lane).and_then(VecDeque::pop_front) {
                return Some((lane.clone(), item));
            }
        }
        None
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn push(&self, lane: &str, item: String) -> Result<()> {
        self.ensure_open()?;
        {
            let mut guard = self.lanes.lock();
            let queue = guard.entry(lane.to_string()).or_default();
            if queue.len() >= self.capacity {
                return Err(OrchestratorError::QueueFull {
                    lane: lane.to_string(),
                    capacity: self.capacity,
                });
            }
            queue.push_back(item);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop_first(&self, lanes: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            self.ensure_open()?;

            // Register interest before looking, so a push between the check
            // and the wait still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.try_pop_first(lanes) {
                return Ok(Some(hit));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self, lane: &str) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.lanes.lock().get(lane).map_or(0, VecDeque::len))
    }

    async fn items(&self, lane: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self
            .lanes
            .lock()
            .get(lane)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        Ok(())
    }
}
