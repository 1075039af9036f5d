use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lantern::correlation::RequestId;
use lantern::error::JobError;
use lantern::job::TaskId;
use lantern::runtime::{JobContext, JobHandler};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// What a scripted call does.
#[derive(Clone, Debug)]
pub enum MockOutcome {
    Succeed(Value),
    Transient(String),
    Validation(String),
    Panic(String),
}

#[derive(Clone, Debug)]
pub struct Invocation {
    pub task_id: TaskId,
    pub attempt: u32,
    pub request_id: RequestId,
    pub payload: Value,
}

/// Job handler that records every call and answers from a script.
///
/// Once the script runs out every call gets the fallback outcome, which
/// defaults to success.
#[derive(Clone)]
pub struct MockJobHandler {
    job_type: String,
    invocations: Arc<Mutex<Vec<Invocation>>>,
    script: Arc<Mutex<VecDeque<MockOutcome>>>,
    fallback: Arc<Mutex<MockOutcome>>,
    delay: Duration,
}

impl MockJobHandler {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            invocations: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(MockOutcome::Succeed(json!({"ok": true})))),
            delay: Duration::ZERO,
        }
    }

    pub fn with_script(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        self.script.lock().extend(outcomes);
        self
    }

    pub fn with_fallback(self, outcome: MockOutcome) -> Self {
        *self.fallback.lock() = outcome;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.invocations.lock().len();
        assert_eq!(actual, expected, "Expected {expected} handler calls, got {actual}");
    }
}

#[async_trait]
impl JobHandler for MockJobHandler {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn handle(&self, job: &JobContext, payload: Value) -> Result<Value, JobError> {
        self.invocations.lock().push(Invocation {
            task_id: job.task_id,
            attempt: job.attempt,
            request_id: job.correlation.request_id(),
            payload,
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone());
        match outcome {
            MockOutcome::Succeed(value) => Ok(value),
            MockOutcome::Transient(msg) => Err(JobError::Transient(msg)),
            MockOutcome::Validation(msg) => Err(JobError::Validation(msg)),
            MockOutcome::Panic(msg) => panic!("{msg}"),
        }
    }
}
