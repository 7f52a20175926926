//! External resource workers: long lived workers that may own a queue of their
//! own, which `format` tears down with the pipeline queues.

use std::sync::Arc;

use parking_lot::RwLock;

pub trait ExternalResourceWorker: Send + Sync {
    fn name(&self) -> &str;

    /// Queue this worker consumes from, if any.
    fn queue_name(&self) -> Option<&str> {
        None
    }
}

/// Registered external resource workers, in registration order.
#[derive(Clone, Default)]
pub struct ExternalWorkerRegistry {
    workers: Arc<RwLock<Vec<Arc<dyn ExternalResourceWorker>>>>,
}

impl ExternalWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. A worker with the same name replaces the old one.
    pub fn register(&self, worker: Arc<dyn ExternalResourceWorker>) {
        let mut workers = self.workers.write();
        workers.retain(|w| w.name() != worker.name());
        tracing::info!(worker = worker.name(), queue = ?worker.queue_name(), "External resource worker registered");
        workers.push(worker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExternalResourceWorker>> {
        self.workers.read().iter().find(|w| w.name() == name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.workers.read().iter().map(|w| w.name().to_string()).collect()
    }

    /// Names of the queues owned by registered workers.
    pub fn queue_names(&self) -> Vec<String> {
        self.workers
            .read()
            .iter()
            .filter_map(|w| w.queue_name().map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Worker {
        name: &'static str,
        queue: Option<&'static str>,
    }

    impl ExternalResourceWorker for Worker {
        fn name(&self) -> &str {
            self.name
        }

        fn queue_name(&self) -> Option<&str> {
            self.queue
        }
    }

    #[test]
    fn test_queue_names_skip_queueless_workers() {
        let registry = ExternalWorkerRegistry::new();
        registry.register(Arc::new(Worker {
            name: "ocr",
            queue: Some("ocrQueue"),
        }));
        registry.register(Arc::new(Worker {
            name: "poller",
            queue: None,
        }));

        assert_eq!(registry.list(), vec!["ocr", "poller"]);
        assert_eq!(registry.queue_names(), vec!["ocrQueue"]);
        assert!(registry.get("poller").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let registry = ExternalWorkerRegistry::new();
        registry.register(Arc::new(Worker {
            name: "ocr",
            queue: Some("old"),
        }));
        registry.register(Arc::new(Worker {
            name: "ocr",
            queue: Some("new"),
        }));

        assert_eq!(registry.queue_names(), vec!["new"]);
    }
}
