/// Builder for constructing worker pools.
pub mod builder;
/// Per-lease job execution state machine.
pub mod executor;
/// Job handler trait and registry.
pub mod handler;
/// Worker pool supervision and graceful shutdown.
pub mod supervisor;
/// Worker configuration.
pub mod worker;

pub use builder::WorkerPoolBuilder;
pub use executor::{ExecutionOutcome, JobExecutor};
pub use handler::{HandlerRegistry, JobContext, JobHandler};
pub use supervisor::{ShutdownToken, WorkerPool, WorkerPoolConfig};
pub use worker::WorkerConfig;
