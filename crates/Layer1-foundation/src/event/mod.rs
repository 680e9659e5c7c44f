//! Event System - publish/subscribe for lifecycle events
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventBus                              │
//! │  publish(event)  ── history ── broadcast channel             │
//! │         │                                                    │
//! │         ▼  (one spawned task per listener)                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │ StatusRelay  │  │  Log tail    │  │  Listener N  │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The bus is owned by the runtime context and passed to the components that
//! publish; there is no process-global instance.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusConfig, EventFilter, EventListener, ListenerId};

pub use types::{
    // Event constructors
    agent,
    container,
    system,
    task,
    // Core types
    EventCategory,
    EventId,
    EventSeverity,
    SandboxEvent,
};
