use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::{JobId, QueueError, StateStore};

/// Executor capability for one job type.
///
/// Handlers receive the job id, the producer payload, and a progress
/// reporter, and return the structured result recorded on the job. A
/// returned error flows through the worker's retry/failure path.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        job_id: JobId,
        payload: serde_json::Value,
        progress: ProgressReporter,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Relays handler progress to the state store. Safe to call any number of
/// times, including zero; every call is best-effort and never changes the
/// job status.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Option<(Arc<dyn StateStore>, JobId)>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn StateStore>, job_id: JobId) -> Self {
        Self {
            inner: Some((store, job_id)),
        }
    }

    /// Reporter that drops every report. For handler unit tests.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub async fn report(&self, percent: i32, message: Option<&str>) {
        let Some((store, job_id)) = &self.inner else {
            return;
        };
        let percent = percent.clamp(0, 100);
        if let Err(e) = store.update_progress(*job_id, Some(percent), message).await {
            tracing::warn!(job_id, error = %e, "progress update failed");
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.inner.as_ref().map(|(_, id)| *id))
            .finish()
    }
}

/// Optional external service locator consulted before the registry's own
/// factories. Lets an embedding application share handler instances it
/// already manages.
pub trait HandlerProvider: Send + Sync {
    fn has(&self, job_type: &str) -> bool;
    fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>>;
}

type HandlerFactory = Box<dyn Fn() -> Arc<dyn JobHandler> + Send + Sync>;

/// Mapping from job-type string to an executor factory.
pub struct HandlerRegistry {
    factories: RwLock<HashMap<String, HandlerFactory>>,
    provider: Option<Arc<dyn HandlerProvider>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            provider: None,
        }
    }

    pub fn with_provider(provider: Arc<dyn HandlerProvider>) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            provider: Some(provider),
        }
    }

    /// Register a factory for a job type. Rejects an empty type key and
    /// duplicate registration at registration time, not at dispatch time.
    pub fn register<F>(&self, job_type: &str, factory: F) -> Result<(), QueueError>
    where
        F: Fn() -> Arc<dyn JobHandler> + Send + Sync + 'static,
    {
        if job_type.is_empty() {
            return Err(QueueError::Registration(
                "job type must not be empty".to_string(),
            ));
        }
        let mut factories = self
            .factories
            .write()
            .expect("handler registry lock poisoned");
        if factories.contains_key(job_type) {
            return Err(QueueError::Registration(format!(
                "handler already registered for job type: {job_type}"
            )));
        }
        factories.insert(job_type.to_string(), Box::new(factory));
        Ok(())
    }

    /// Register a single shared instance for a job type.
    pub fn register_instance(
        &self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        self.register(job_type, move || handler.clone())
    }

    /// Resolve an executor for the job type: the external provider first,
    /// then the registered factory.
    pub fn resolve(&self, job_type: &str) -> Result<Arc<dyn JobHandler>, QueueError> {
        if let Some(provider) = &self.provider {
            if provider.has(job_type) {
                if let Some(handler) = provider.get(job_type) {
                    return Ok(handler);
                }
            }
        }
        let factories = self
            .factories
            .read()
            .expect("handler registry lock poisoned");
        match factories.get(job_type) {
            Some(factory) => Ok(factory()),
            None => Err(QueueError::HandlerNotRegistered(job_type.to_string())),
        }
    }

    pub fn contains(&self, job_type: &str) -> bool {
        if let Some(provider) = &self.provider {
            if provider.has(job_type) {
                return true;
            }
        }
        self.factories
            .read()
            .expect("handler registry lock poisoned")
            .contains_key(job_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn handle(
            &self,
            _job_id: JobId,
            _payload: serde_json::Value,
            _progress: ProgressReporter,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn register_and_resolve() {
        let registry = HandlerRegistry::new();
        registry
            .register("noop", || Arc::new(NoopHandler))
            .unwrap();
        assert!(registry.contains("noop"));
        assert!(registry.resolve("noop").is_ok());
    }

    #[test]
    fn unknown_type_is_recoverable_error() {
        let registry = HandlerRegistry::new();
        match registry.resolve("missing") {
            Err(QueueError::HandlerNotRegistered(t)) => assert_eq!(t, "missing"),
            Err(other) => panic!("unexpected: {other:?}"),
            Ok(_) => panic!("unexpected: Ok"),
        }
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = HandlerRegistry::new();
        registry
            .register("noop", || Arc::new(NoopHandler))
            .unwrap();
        assert!(matches!(
            registry.register("noop", || Arc::new(NoopHandler)),
            Err(QueueError::Registration(_))
        ));
    }

    #[test]
    fn empty_type_rejected() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.register("", || Arc::new(NoopHandler)),
            Err(QueueError::Registration(_))
        ));
    }

    struct FixedProvider(Arc<dyn JobHandler>);

    impl HandlerProvider for FixedProvider {
        fn has(&self, job_type: &str) -> bool {
            job_type == "provided"
        }
        fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
            (job_type == "provided").then(|| self.0.clone())
        }
    }

    #[test]
    fn provider_consulted_before_factories() {
        let registry =
            HandlerRegistry::with_provider(Arc::new(FixedProvider(Arc::new(NoopHandler))));
        assert!(registry.contains("provided"));
        assert!(registry.resolve("provided").is_ok());
        assert!(matches!(
            registry.resolve("unprovided"),
            Err(QueueError::HandlerNotRegistered(_))
        ));
    }
}
