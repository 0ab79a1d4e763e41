use std::sync::Arc;

use super::{config::Config, registry::Registry, supervisor::Supervisor};
use crate::{
    backend::Attacher,
    events::Bus,
    patches::PatchCompiler,
    subscribers::{Subscribe, SubscriberSet},
};

/// Builder for constructing a [`Supervisor`].
pub struct SupervisorBuilder {
    cfg: Config,
    attacher: Arc<dyn Attacher>,
    compiler: Arc<dyn PatchCompiler>,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl SupervisorBuilder {
    /// Creates a new builder; the backend and compiler are required.
    pub fn new(
        cfg: Config,
        attacher: Arc<dyn Attacher>,
        compiler: Arc<dyn PatchCompiler>,
    ) -> Self {
        Self {
            cfg,
            attacher,
            compiler,
            subscribers: Vec::new(),
        }
    }

    /// Sets event subscribers.
    ///
    /// Subscribers receive runtime events (attach attempts, script logs, patch
    /// lifecycle, shutdown) through dedicated workers with bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Builds the supervisor: event bus, subscriber workers, registry and its
    /// detach listener.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Arc<Supervisor> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));
        let registry = Registry::new(self.attacher, self.compiler, bus.clone(), &self.cfg);

        Arc::new(Supervisor::new_internal(self.cfg, bus, subs, registry))
    }
}
