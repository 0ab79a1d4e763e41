//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to runtime events emitted by the supervisor, registry,
//! sessions, scripts, patches, watchers and subscriber workers.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `Registry`, `Session`, `Script` log/message handlers, `Patch`,
//!   `TargetWatcher`, `Supervisor`, `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: `Supervisor::subscriber_listener()` which fans out to the
//!   `SubscriberSet` (and so to `LogWriter`).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
