use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::correlation::RequestContext;
use crate::error::JobError;
use crate::job::TaskId;

/// What a handler knows about the execution it is part of.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub task_id: TaskId,
    /// 1-based delivery count.
    pub attempt: u32,
    pub correlation: Arc<RequestContext>,
}

/// Executes one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job type this handler is registered under.
    fn job_type(&self) -> &str;

    /// Run the job. The returned value is stored as the task's result.
    async fn handle(&self, job: &JobContext, payload: Value) -> Result<Value, JobError>;
}

/// Handlers keyed by job type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same job type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(handler.job_type().to_string(), handler);
        self
    }

    pub fn with(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    #[async_trait]
    impl JobHandler for Echo {
        fn job_type(&self) -> &str {
            self.0
        }

        async fn handle(&self, _job: &JobContext, payload: Value) -> Result<Value, JobError> {
            Ok(payload)
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Echo("export")))
            .with(Arc::new(Echo("cleanup")));

        assert!(registry.get("export").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.job_types(), vec!["cleanup", "export"]);
    }
}
