//! Worker class registration.

use std::sync::Arc;

use crate::worker::Worker;

/// A registered worker class: a name, an optional cluster, and the
/// factory that produces instances.
///
/// The cluster restricts placement: `pick_broker` only considers brokers
/// of the class's cluster. Classes without one use the broker's default.
#[derive(Clone)]
pub struct WorkerClass {
    name: String,
    cluster: Option<String>,
    factory: Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>,
}

impl WorkerClass {
    /// Registers a class under `name` with an instance factory.
    #[must_use]
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Worker> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            cluster: None,
            factory: Arc::new(factory),
        }
    }

    /// Restricts the class to a named cluster.
    #[must_use]
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// The class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared cluster, if any.
    #[must_use]
    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub(crate) fn instantiate(&self) -> Arc<dyn Worker> {
        (self.factory)()
    }
}

impl std::fmt::Debug for WorkerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClass")
            .field("name", &self.name)
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl Worker for Nop {}

    #[test]
    fn class_carries_name_and_cluster() {
        let class = WorkerClass::new("Greeter", || Arc::new(Nop));
        assert_eq!(class.name(), "Greeter");
        assert_eq!(class.cluster(), None);

        let class = class.with_cluster("pvp");
        assert_eq!(class.cluster(), Some("pvp"));
    }

    #[test]
    fn factory_produces_instances() {
        let class = WorkerClass::new("Greeter", || Arc::new(Nop));
        let _instance = class.instantiate();
    }
}
