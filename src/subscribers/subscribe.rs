//! # Event subscriber trait.
//!
//! Provides [`Subscribe`] an extension point for plugging custom event handlers into the runtime.
//!
//! Each subscriber gets:
//! - **Dedicated worker task** (runs independently)
//! - **Per-subscriber bounded queue** (capacity via [`Subscribe::queue_capacity`])
//! - **Panic isolation** (panics are caught and reported as `EventKind::SubscriberPanicked`)
//!
//! ## Rules
//! - A slow subscriber only affects its own queue.
//! - Queue overflow drops the event **for this subscriber only** and publishes
//!   `EventKind::SubscriberOverflow`.
//! - Events are processed sequentially (FIFO) per subscriber.
//! - [`Subscribe::accepts`] filters by kind before the queue.
//!
//! ## Example
//! ```rust
//! use async_trait::async_trait;
//! use patchvisor::{Event, EventKind, Subscribe};
//!
//! struct PatchAudit;
//!
//! #[async_trait]
//! impl Subscribe for PatchAudit {
//!     async fn on_event(&self, ev: &Event) {
//!         if matches!(ev.kind, EventKind::PatchApplied | EventKind::PatchCleared) {
//!             // write an audit record...
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str { "patch-audit" }
//!
//!     fn accepts(&self, kind: EventKind) -> bool {
//!         !matches!(kind, EventKind::ScriptLog | EventKind::ScriptMessage)
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};

/// Contract for event subscribers.
///
/// `on_event` runs on the subscriber's own worker task, never on a backend
/// thread, even for script log lines.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    async fn on_event(&self, event: &Event);

    /// Name used in overflow and panic events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Capacity of this subscriber's queue.
    fn queue_capacity(&self) -> usize {
        1024
    }

    /// Filter applied before queueing. Events of other kinds never reach
    /// the queue, so a chatty script can't overflow a subscriber that ignores logs.
    fn accepts(&self, _kind: EventKind) -> bool {
        true
    }
}
