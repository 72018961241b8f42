//! Scheduling of test-case executions.

pub mod queue;

pub use self::queue::{BoundedRunner, Settled};
