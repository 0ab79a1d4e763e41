//! # Event subscribers for the patchvisor runtime.
//!
//! This module provides the [`Subscribe`] trait, the [`SubscriberSet`] fan-out and
//! the built-in [`LogWriter`] which is the crate's log sink.
//!
//! ## Architecture
//! ```text
//! Registry / Session / Script / Patch / Watcher ── publish(Event) ──► Bus
//!                                                                     │
//!                                             Supervisor::subscriber_listener
//!                                                                     ▼
//!                                                               SubscriberSet
//!                                                    ┌────────────┼────────────┐
//!                                                    ▼            ▼            ▼
//!                                                LogWriter     Metrics      Custom
//! ```

#[cfg(feature = "logging")]
mod log;
mod set;
mod subscribe;

#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
