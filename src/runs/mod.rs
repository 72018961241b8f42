//! Step-run and pipeline-run records produced by test execution.

pub mod pipeline;
pub mod step;

pub use self::pipeline::{CaseRun, PipelineRun};
pub use self::step::{Invocation, StepRun};
