//! Event Bus - fire-and-forget broadcast
//!
//! `publish` is synchronous: it records the event, pushes it on a broadcast
//! channel and hands each listener its own task. A slow or panicking listener
//! never blocks or fails the publisher.

use super::types::{EventCategory, SandboxEvent};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

// ============================================================================
// EventListener Trait
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receives published events
#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    /// Listener name (for debugging)
    fn name(&self) -> &str;

    /// Categories of interest (None means all)
    fn categories(&self) -> Option<Vec<EventCategory>> {
        None
    }

    async fn on_event(&self, event: &SandboxEvent);
}

// ============================================================================
// EventFilter
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub categories: Option<Vec<EventCategory>>,

    /// Event type prefixes
    pub event_types: Option<Vec<String>>,

    pub agent_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(mut self, categories: Vec<EventCategory>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_event_types(mut self, types: Vec<String>) -> Self {
        self.event_types = Some(types);
        self
    }

    pub fn with_agents(mut self, agent_ids: Vec<String>) -> Self {
        self.agent_ids = Some(agent_ids);
        self
    }

    pub fn matches(&self, event: &SandboxEvent) -> bool {
        if let Some(ref cats) = self.categories {
            if !cats.contains(&event.category) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| event.event_type.starts_with(t)) {
                return false;
            }
        }

        if let Some(ref agents) = self.agent_ids {
            match &event.agent_id {
                Some(id) if agents.contains(id) => {}
                _ => return false,
            }
        }

        true
    }
}

// ============================================================================
// EventBus
// ============================================================================

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity
    pub channel_capacity: usize,

    /// Number of events kept in history
    pub history_size: usize,

    /// Trace every published event
    pub debug_mode: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_size: 100,
            debug_mode: false,
        }
    }
}

struct RegisteredListener {
    listener: Arc<dyn EventListener>,
    filter: Option<EventFilter>,
}

impl RegisteredListener {
    fn accepts(&self, event: &SandboxEvent) -> bool {
        match &self.filter {
            Some(filter) => filter.matches(event),
            None => match self.listener.categories() {
                Some(cats) => cats.contains(&event.category),
                None => true,
            },
        }
    }
}

/// Event bus
///
/// One instance per runtime; zero subscribers is a normal state.
///
/// ```ignore
/// let bus = EventBus::new();
/// let id = bus.subscribe(Arc::new(MyListener));
/// bus.publish(SandboxEvent::new("test.event", EventCategory::System));
/// bus.unsubscribe(id);
/// ```
pub struct EventBus {
    config: EventBusConfig,

    sender: broadcast::Sender<SandboxEvent>,

    listeners: RwLock<HashMap<ListenerId, RegisteredListener>>,

    listener_counter: AtomicU64,

    history: Mutex<VecDeque<SandboxEvent>>,

    event_count: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));

        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            config,
            sender,
            listeners: RwLock::new(HashMap::new()),
            listener_counter: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.subscribe_with_filter(listener, None)
    }

    pub fn subscribe_with_filter(
        &self,
        listener: Arc<dyn EventListener>,
        filter: Option<EventFilter>,
    ) -> ListenerId {
        let id = ListenerId(self.listener_counter.fetch_add(1, Ordering::SeqCst));

        debug!(
            listener_name = listener.name(),
            listener_id = %id,
            "Registering event listener"
        );

        self.listeners
            .write()
            .insert(id, RegisteredListener { listener, filter });

        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let removed = self.listeners.write().remove(&id).is_some();
        if removed {
            debug!(listener_id = %id, "Unregistered event listener");
        }
        removed
    }

    /// Publish an event. Never blocks, never fails.
    pub fn publish(&self, event: SandboxEvent) {
        let event_count = self.event_count.fetch_add(1, Ordering::SeqCst);

        if self.config.debug_mode {
            trace!(
                event_id = %event.id,
                event_type = %event.event_type,
                category = ?event.category,
                "Publishing event #{}", event_count + 1
            );
        }

        if self.config.history_size > 0 {
            let mut history = self.history.lock();
            if history.len() >= self.config.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // No receivers is not an error
        let _ = self.sender.send(event.clone());

        let targets: Vec<Arc<dyn EventListener>> = self
            .listeners
            .read()
            .values()
            .filter(|registered| registered.accepts(&event))
            .map(|registered| Arc::clone(&registered.listener))
            .collect();

        if targets.is_empty() {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                trace!(
                    event_type = %event.event_type,
                    "No async runtime, skipping listener delivery"
                );
                return;
            }
        };

        let event = Arc::new(event);
        for listener in targets {
            let event = Arc::clone(&event);
            handle.spawn(async move {
                trace!(
                    listener_name = listener.name(),
                    event_type = %event.event_type,
                    "Delivering event to listener"
                );
                listener.on_event(&event).await;
            });
        }
    }

    /// Stream-style receiver; slow receivers lose the oldest events
    pub fn receiver(&self) -> broadcast::Receiver<SandboxEvent> {
        self.sender.subscribe()
    }

    /// Most recent events first
    pub fn history(&self, limit: Option<usize>) -> Vec<SandboxEvent> {
        let history = self.history.lock();
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
