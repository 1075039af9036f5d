use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::correlation::RequestId;
use crate::error::DispatchError;
use crate::propagation::TraceCarrier;

/// Typed job payload.
///
/// Implementors are serialized into the envelope's JSON payload and routed
/// to the handler registered under [`Job::JOB_TYPE`].
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    const JOB_TYPE: &'static str;
}

/// Identifier handed to the client at enqueue time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client-supplied id. Anything that is not a UUID is rejected.
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| DispatchError::InvalidTaskId(raw.chars().take(64).collect()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally visible job state. Only ever moves forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Started,
    Success,
    Failure,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Started => "STARTED",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }

    /// Whether a record in `self` may move to `next`.
    ///
    /// `Started -> Started` is allowed so retries can bump the attempt count.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, JobState::Started) => true,
            (JobState::Pending, JobState::Failure) => true,
            (JobState::Started, JobState::Started) => true,
            (JobState::Started, JobState::Success | JobState::Failure) => true,
            _ => false,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "STARTED" => Ok(JobState::Started),
            "SUCCESS" => Ok(JobState::Success),
            "FAILURE" => Ok(JobState::Failure),
            other => Err(anyhow::anyhow!("unknown job state {other:?}")),
        }
    }
}

/// Error stored on a failed job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: String,
    pub message: String,
}

/// Status-store row for one task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub task_id: TaskId,
    pub job_type: String,
    pub state: JobState,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub attempts: u32,
    pub request_id: Option<RequestId>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn pending(task_id: TaskId, job_type: impl Into<String>, request_id: Option<RequestId>) -> Self {
        Self {
            task_id,
            job_type: job_type.into(),
            state: JobState::Pending,
            result: None,
            error: None,
            attempts: 0,
            request_id,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn ready(&self) -> bool {
        self.state.is_terminal()
    }

    /// `None` until the job reaches a terminal state.
    pub fn successful(&self) -> Option<bool> {
        match self.state {
            JobState::Success => Some(true),
            JobState::Failure => Some(false),
            _ => None,
        }
    }

    /// Result on success, error on failure, progress otherwise.
    pub fn info(&self) -> Value {
        match self.state {
            JobState::Success => self.result.clone().unwrap_or(Value::Null),
            JobState::Failure => match &self.error {
                Some(failure) => json!({ "error": failure.message, "kind": failure.kind }),
                None => Value::Null,
            },
            JobState::Started => json!({ "attempts": self.attempts }),
            JobState::Pending => Value::Null,
        }
    }
}

/// What travels through the broker.
///
/// Only the trace carrier and the originating request id cross the process
/// boundary; everything else about the request stays behind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub task_id: TaskId,
    pub job_type: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<TraceCarrier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(task_id: TaskId, job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_id,
            job_type: job_type.into(),
            payload,
            carrier: None,
            request_id: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_origin(mut self, request_id: Option<RequestId>, carrier: Option<TraceCarrier>) -> Self {
        self.request_id = request_id;
        self.carrier = carrier.filter(|c| !c.is_empty());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_parse() {
        let id = TaskId::new();
        assert_eq!(TaskId::parse(&id.to_string()).unwrap(), id);
        assert!(matches!(
            TaskId::parse("not-a-uuid"),
            Err(DispatchError::InvalidTaskId(_))
        ));
        assert!(TaskId::parse("").is_err());
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&JobState::Started).unwrap(), "\"STARTED\"");
        assert_eq!("FAILURE".parse::<JobState>().unwrap(), JobState::Failure);
    }

    #[test]
    fn test_transitions_only_move_forward() {
        use JobState::*;
        assert!(Pending.can_transition_to(Started));
        assert!(Started.can_transition_to(Started));
        assert!(Started.can_transition_to(Success));
        assert!(Started.can_transition_to(Failure));

        assert!(!Started.can_transition_to(Pending));
        assert!(!Success.can_transition_to(Started));
        assert!(!Success.can_transition_to(Failure));
        assert!(!Failure.can_transition_to(Success));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_pending_record_is_not_ready() {
        let record = JobRecord::pending(TaskId::new(), "export", None);
        assert!(!record.ready());
        assert_eq!(record.successful(), None);
        assert_eq!(record.info(), Value::Null);
    }

    #[test]
    fn test_envelope_drops_empty_carrier() {
        let envelope = JobEnvelope::new(TaskId::new(), "export", json!({}))
            .with_origin(Some(RequestId::new()), Some(TraceCarrier::default()));
        assert!(envelope.carrier.is_none());
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("carrier").is_none());
        assert!(json.get("request_id").is_some());
    }
}
