//! Result submission collaborator.
//!
//! Finished case runs and job-completion signals leave the process through a
//! [`ResultSink`]. [`HttpResultSink`] talks to the platform's REST API;
//! [`MemorySink`] keeps everything in memory for tests and dry runs.

mod http;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SinkError;
use crate::runs::CaseRun;

pub use self::http::HttpResultSink;
pub use self::memory::MemorySink;

/// A test case as stored by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outputs: Option<Value>,
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Submit the run of one case belonging to an orchestrator job.
    async fn submit_case(&self, test_job_id: &str, run: CaseRun) -> Result<(), SinkError>;

    /// Signal that every case of a job has settled.
    async fn finish_job(&self, test_job_id: &str) -> Result<(), SinkError>;

    /// Submit a locally executed batch as a new result; returns its id.
    async fn create_result(&self, pipeline_id: &str, runs: Vec<CaseRun>) -> Result<String, SinkError>;

    async fn list_test_cases(&self, pipeline: &str) -> Result<Vec<TestCase>, SinkError>;
}
