//! Ordered collection of step runs for one logical execution.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::runs::step::{Invocation, StepRun};

/// An append-only sequence of [`StepRun`]s with a stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pipeline_id: Option<String>,
    #[serde(default)]
    context: Map<String, Value>,
    step_runs: Vec<StepRun>,
}

impl PipelineRun {
    pub fn new(pipeline_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            context: Map::new(),
            step_runs: Vec::new(),
        }
    }

    /// Merge ambient metadata with call-site metadata; call-site keys win.
    pub fn with_context(mut self, ambient: Map<String, Value>, call_site: Map<String, Value>) -> Self {
        self.context.extend(ambient);
        self.context.extend(call_site);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pipeline_id(&self) -> Option<&str> {
        self.pipeline_id.as_deref()
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    pub fn step_runs(&self) -> &[StepRun] {
        &self.step_runs
    }

    pub fn add_step_run(&mut self, step: StepRun) {
        self.step_runs.push(step);
    }

    /// Measure `fut` and append the resulting step.
    pub async fn measure<F>(&mut self, invocation: Invocation, fut: F) -> &StepRun
    where
        F: Future<Output = anyhow::Result<Value>>,
    {
        let step = invocation.measure(fut).await;
        self.step_runs.push(step);
        &self.step_runs[self.step_runs.len() - 1]
    }

    pub fn has_errors(&self) -> bool {
        self.step_runs.iter().any(StepRun::is_error)
    }

    /// Pair this run with the test case it executed.
    pub fn into_case_run(self, case_id: impl Into<String>) -> CaseRun {
        CaseRun {
            case_id: case_id.into(),
            pipeline_run_id: self.id,
            context: self.context,
            step_runs: self.step_runs,
        }
    }
}

/// A pipeline run bound to one test case, as submitted for aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseRun {
    pub case_id: String,
    pub pipeline_run_id: Uuid,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub step_runs: Vec<StepRun>,
}

impl CaseRun {
    pub fn has_errors(&self) -> bool {
        self.step_runs.iter().any(StepRun::is_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_steps_append_in_invocation_order() {
        let mut run = PipelineRun::new(Some("p1".into()));
        run.measure(Invocation::new("fn", "first"), async { Ok(json!(1)) })
            .await;
        run.measure(Invocation::new("fn", "second"), async { Err(anyhow!("nope")) })
            .await;

        let names: Vec<_> = run
            .step_runs()
            .iter()
            .map(|s| s.invocation_name.as_str())
            .collect();
        assert_eq!(names, ["first", "second"]);
        assert!(run.has_errors());
    }

    #[test]
    fn test_call_site_context_wins_over_ambient() {
        let run = PipelineRun::new(None).with_context(
            map(json!({ "env": "ci", "user": "ambient" })),
            map(json!({ "user": "caller" })),
        );
        assert_eq!(run.context()["env"], "ci");
        assert_eq!(run.context()["user"], "caller");
    }

    #[test]
    fn test_id_is_stable_into_case_run() {
        let run = PipelineRun::new(None);
        let id = run.id();
        let case = run.into_case_run("case-1");
        assert_eq!(case.pipeline_run_id, id);
        assert_eq!(case.case_id, "case-1");
        assert!(!case.has_errors());
    }
}
