//! CSV export of to-do rows, run as a background job.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::JobError;
use crate::job::{Job, TaskId};
use crate::runtime::{JobContext, JobHandler};
use crate::todo::{Todo, TodoFilter, TodoRepository};

/// Body of `POST /export`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportRequest {
    #[serde(default)]
    pub filters: TodoFilter,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportJob {
    #[serde(default)]
    pub filters: TodoFilter,
    /// Rows with a larger id were added after the job was enqueued and are
    /// left out. `None` exports whatever exists when the job runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to_id: Option<i64>,
}

impl ExportJob {
    /// Export of the rows present now, as reported by `latest_id`.
    pub fn as_of(filters: TodoFilter, latest_id: Option<i64>) -> Self {
        Self {
            filters,
            up_to_id: Some(latest_id.unwrap_or(0)),
        }
    }

    pub fn selects(&self, todo: &Todo) -> bool {
        self.up_to_id.map_or(true, |max| todo.id <= max) && self.filters.matches(todo)
    }
}

impl Job for ExportJob {
    const JOB_TYPE: &'static str = "export";
}

/// File the export for `task_id` is written to.
pub fn export_path(export_dir: &Path, task_id: TaskId) -> PathBuf {
    export_dir.join(format!("todos_export_{task_id}.csv"))
}

pub struct ExportHandler {
    repo: Arc<dyn TodoRepository>,
    export_dir: PathBuf,
    delay: Duration,
}

impl std::fmt::Debug for ExportHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportHandler")
            .field("export_dir", &self.export_dir)
            .field("delay", &self.delay)
            .finish()
    }
}

impl ExportHandler {
    pub fn new(repo: Arc<dyn TodoRepository>, export_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            export_dir: export_dir.into(),
            delay: Duration::ZERO,
        }
    }

    /// Artificial pause before the rows are read. Simulates a slow export.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl JobHandler for ExportHandler {
    fn job_type(&self) -> &str {
        ExportJob::JOB_TYPE
    }

    async fn handle(&self, job: &JobContext, payload: Value) -> Result<Value, JobError> {
        let export: ExportJob = serde_json::from_value(payload)
            .map_err(|e| JobError::Validation(format!("invalid export payload: {e}")))?;

        tracing::info!(filters = ?export.filters, up_to_id = ?export.up_to_id, "Starting todo export");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let rows: Vec<Todo> = self
            .repo
            .list()
            .await
            .map_err(|e| JobError::Transient(format!("reading todos failed: {e:#}")))?
            .into_iter()
            .filter(|todo| export.selects(todo))
            .collect();

        tokio::fs::create_dir_all(&self.export_dir)
            .await
            .map_err(|e| JobError::Transient(format!("creating export dir failed: {e}")))?;

        let path = export_path(&self.export_dir, job.task_id);
        tokio::fs::write(&path, render_csv(&rows))
            .await
            .map_err(|e| JobError::Transient(format!("writing export failed: {e}")))?;

        tracing::info!(count = rows.len(), csv_path = %path.display(), "Todo export written");
        Ok(json!({
            "csv_path": path.display().to_string(),
            "count": rows.len(),
        }))
    }
}

fn render_csv(rows: &[Todo]) -> String {
    let mut out = String::from("id,title,done\r\n");
    for todo in rows {
        out.push_str(&todo.id.to_string());
        out.push(',');
        out.push_str(&escape_field(&todo.text));
        out.push(',');
        out.push_str(if todo.done { "true" } else { "false" });
        out.push_str("\r\n");
    }
    out
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{RequestContext, RequestId};
    use crate::todo::InMemoryTodoRepository;

    fn job_context() -> JobContext {
        JobContext {
            task_id: TaskId::new(),
            attempt: 1,
            correlation: Arc::new(RequestContext::new(RequestId::new())),
        }
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn test_export_writes_every_row_with_empty_filters() {
        let dir = tempfile::tempdir().unwrap();
        let repo = InMemoryTodoRepository::new();
        repo.add("milk").await.unwrap();
        repo.add("eggs, large").await.unwrap();

        let handler = ExportHandler::new(Arc::new(repo), dir.path());
        let job = job_context();
        let result = handler.handle(&job, json!({})).await.unwrap();

        assert_eq!(result["count"], 2);
        let contents = std::fs::read_to_string(export_path(dir.path(), job.task_id)).unwrap();
        assert!(contents.starts_with("id,title,done\r\n"));
        assert!(contents.contains("\"eggs, large\""));
    }

    #[tokio::test]
    async fn test_export_applies_filters() {
        let dir = tempfile::tempdir().unwrap();
        let repo = InMemoryTodoRepository::new();
        repo.add("buy milk").await.unwrap();
        repo.add("walk dog").await.unwrap();

        let handler = ExportHandler::new(Arc::new(repo), dir.path());
        let result = handler
            .handle(&job_context(), json!({"filters": {"contains": "MILK"}}))
            .await
            .unwrap();
        assert_eq!(result["count"], 1);
    }

    #[tokio::test]
    async fn test_rows_added_after_enqueue_are_left_out() {
        let dir = tempfile::tempdir().unwrap();
        let repo = InMemoryTodoRepository::new();
        repo.add("milk").await.unwrap();
        let job = ExportJob::as_of(TodoFilter::default(), repo.latest_id().await.unwrap());
        repo.add("eggs").await.unwrap();

        let handler = ExportHandler::new(Arc::new(repo), dir.path());
        let result = handler
            .handle(&job_context(), serde_json::to_value(&job).unwrap())
            .await
            .unwrap();
        assert_eq!(result["count"], 1);

        let empty = ExportJob::as_of(TodoFilter::default(), None);
        assert_eq!(empty.up_to_id, Some(0));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ExportHandler::new(Arc::new(InMemoryTodoRepository::new()), dir.path());

        let err = handler
            .handle(&job_context(), json!({"filters": {"owner": "x"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }
}
