//! HTTP surface: to-do pages, the export API, health probes and `/metrics`.
//!
//! ```text
//! /                    GET   list todos (newest first)
//! /add                 POST  form field `task`
//! /delete/{index}      POST  delete by position
//! /export              POST  enqueue a CSV export, 202 {task_id}
//! /tasks/{task_id}     GET   job status
//! /download/{task_id}  GET   finished export
//! /healthz             GET   liveness
//! /healthz/background  GET   broker connectivity
//! /metrics             GET   Prometheus exposition
//! ```

pub mod handlers;
pub mod middleware;

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;

use crate::dispatch::JobDispatcher;
use crate::telemetry::Telemetry;
use crate::todo::TodoRepository;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub telemetry: Telemetry,
    pub todos: Arc<dyn TodoRepository>,
    pub dispatcher: JobDispatcher,
    /// Directory the export worker writes into.
    pub export_dir: PathBuf,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("telemetry", &self.telemetry)
            .field("dispatcher", &self.dispatcher)
            .field("export_dir", &self.export_dir)
            .finish()
    }
}

/// Build the application router.
///
/// The panic catcher sits inside the correlation middleware so a panicking
/// handler still answers with its request id and gets counted.
pub fn router(state: AppState) -> Router {
    let telemetry = state.telemetry.clone();

    Router::new()
        .route("/", get(handlers::list_todos))
        .route("/add", post(handlers::add_todo))
        .route("/delete/{index}", post(handlers::delete_todo))
        .route("/export", post(handlers::start_export))
        .route("/tasks/{task_id}", get(handlers::task_status))
        .route("/download/{task_id}", get(handlers::download_export))
        .route("/healthz", get(handlers::healthz))
        .route("/healthz/background", get(handlers::healthz_background))
        .route("/metrics", get(handlers::metrics))
        .fallback(handlers::not_found)
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .layer(axum::middleware::from_fn_with_state(telemetry, middleware::correlate))
        .with_state(state)
}
