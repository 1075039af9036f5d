//! Test helpers for lantern: captured logs, scripted job handlers, a flaky
//! broker and an in-memory application fixture.

pub mod job;
pub mod logs;
pub mod mock;
pub mod queue;

pub use job::{seed_todos, TestApp, TestAppBuilder};
pub use logs::CapturedLogs;
pub use mock::{Invocation, MockJobHandler, MockOutcome};
pub use queue::FlakyBroker;
