/// PostgreSQL broker and status store on the `lantern_jobs` table.
pub mod postgres;
/// PostgreSQL to-do repository.
pub mod todos;

pub use postgres::{connect, ensure_schema, PostgresJobStore};
pub use todos::PostgresTodoRepository;
