//! Job dispatch boundary used by request handlers.
//!
//! [`JobDispatcher::enqueue`] records the task as PENDING, embeds the
//! caller's correlation (request id, trace carrier) in the envelope and
//! hands it to the broker. It never waits for the job to run.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::correlation;
use crate::error::DispatchError;
use crate::job::{Job, JobEnvelope, JobFailure, JobRecord, JobState, TaskId};
use crate::metrics::JobLifecycleEvent;
use crate::queue::JobBroker;
use crate::status::StatusStore;
use crate::telemetry::Telemetry;

/// Client-facing view of a job.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobStatus {
    pub task_id: TaskId,
    pub state: JobState,
    pub ready: bool,
    pub successful: Option<bool>,
    pub info: Value,
}

impl From<JobRecord> for JobStatus {
    fn from(record: JobRecord) -> Self {
        Self {
            task_id: record.task_id,
            state: record.state,
            ready: record.ready(),
            successful: record.successful(),
            info: record.info(),
        }
    }
}

#[derive(Clone)]
pub struct JobDispatcher {
    broker: Arc<dyn JobBroker>,
    status: Arc<dyn StatusStore>,
    telemetry: Telemetry,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

impl JobDispatcher {
    pub fn new(broker: Arc<dyn JobBroker>, status: Arc<dyn StatusStore>, telemetry: Telemetry) -> Self {
        Self {
            broker,
            status,
            telemetry,
        }
    }

    pub fn broker(&self) -> &Arc<dyn JobBroker> {
        &self.broker
    }

    /// Enqueue a typed job.
    pub async fn submit<J: Job>(&self, job: &J) -> Result<TaskId, DispatchError> {
        let payload =
            serde_json::to_value(job).map_err(|e| DispatchError::InvalidJob(e.to_string()))?;
        self.enqueue(J::JOB_TYPE, payload).await
    }

    /// Enqueue a job and return its task id without waiting for it to run.
    pub async fn enqueue(&self, job_type: &str, payload: Value) -> Result<TaskId, DispatchError> {
        if job_type.trim().is_empty() {
            return Err(DispatchError::InvalidJob("job type must not be empty".into()));
        }

        let task_id = TaskId::new();
        let ctx = correlation::current();
        let request_id = ctx.as_ref().map(|c| c.request_id());
        let carrier = ctx.as_ref().and_then(|c| c.carrier().cloned());

        self.status
            .insert_pending(JobRecord::pending(task_id, job_type, request_id))
            .await
            .map_err(DispatchError::Backend)?;

        let envelope = JobEnvelope::new(task_id, job_type, payload).with_origin(request_id, carrier);
        if let Err(err) = self.broker.enqueue(envelope).await {
            // The record must not stay PENDING forever for a job nobody will run.
            let failure = JobFailure {
                kind: "transient".into(),
                message: "broker rejected the job".into(),
            };
            if let Err(store_err) = self.status.mark_failed(task_id, failure).await {
                self.telemetry.report_degraded("status_store", &store_err);
            }
            return Err(DispatchError::Backend(err));
        }

        self.telemetry
            .record_job_event(job_type, JobLifecycleEvent::Enqueued);
        tracing::info!(task_id = %task_id, job_type = %job_type, "Task enqueued");
        Ok(task_id)
    }

    /// Look up a task. Pure read.
    pub async fn get_status(&self, raw_task_id: &str) -> Result<JobStatus, DispatchError> {
        let task_id = TaskId::parse(raw_task_id)?;
        self.status
            .get(task_id)
            .await
            .map_err(DispatchError::Backend)?
            .map(JobStatus::from)
            .ok_or_else(|| DispatchError::NotFound(task_id.to_string()))
    }
}
