use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::{ResultSink, TestCase};
use crate::error::SinkError;
use crate::runs::CaseRun;

/// In-memory [`ResultSink`] that records everything it receives.
#[derive(Debug, Default)]
pub struct MemorySink {
    test_cases: HashMap<String, Vec<TestCase>>,
    submitted: Mutex<Vec<(String, CaseRun)>>,
    finished: Mutex<Vec<String>>,
    created: Mutex<Vec<(String, Vec<CaseRun>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `cases` from [`ResultSink::list_test_cases`] for `pipeline`.
    pub fn with_test_cases(mut self, pipeline: impl Into<String>, cases: Vec<TestCase>) -> Self {
        self.test_cases.insert(pipeline.into(), cases);
        self
    }

    /// `(test_job_id, run)` pairs in the order they arrived.
    pub fn submitted(&self) -> Vec<(String, CaseRun)> {
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Job ids that reported completion.
    pub fn finished(&self) -> Vec<String> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(pipeline_id, runs)` batches passed to `create_result`.
    pub fn created(&self) -> Vec<(String, Vec<CaseRun>)> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn submit_case(&self, test_job_id: &str, run: CaseRun) -> Result<(), SinkError> {
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((test_job_id.to_string(), run));
        Ok(())
    }

    async fn finish_job(&self, test_job_id: &str) -> Result<(), SinkError> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(test_job_id.to_string());
        Ok(())
    }

    async fn create_result(&self, pipeline_id: &str, runs: Vec<CaseRun>) -> Result<String, SinkError> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pipeline_id.to_string(), runs));
        Ok(Uuid::new_v4().to_string())
    }

    async fn list_test_cases(&self, pipeline: &str) -> Result<Vec<TestCase>, SinkError> {
        Ok(self.test_cases.get(pipeline).cloned().unwrap_or_default())
    }
}
