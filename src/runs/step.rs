//! Timed record of a single invocation.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One measured invocation inside a pipeline run.
///
/// `end_time - start_time == elapsed_time_ms` holds exactly: the end
/// timestamp is derived from the start plus the measured elapsed time.
/// `error` is set only when the invocation failed, in which case `outputs`
/// keeps the default the invocation was created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    pub provider_name: String,
    pub invocation_name: String,
    pub elapsed_time_ms: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub inputs: Value,
    pub model_params: Value,
    pub outputs: Value,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRun {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Description of an invocation about to be measured.
#[derive(Debug, Clone)]
pub struct Invocation {
    provider_name: String,
    invocation_name: String,
    inputs: Value,
    model_params: Value,
    context: Map<String, Value>,
    default_outputs: Value,
}

impl Invocation {
    pub fn new(provider_name: impl Into<String>, invocation_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            invocation_name: invocation_name.into(),
            inputs: Value::Object(Map::new()),
            model_params: Value::Object(Map::new()),
            context: Map::new(),
            default_outputs: Value::Object(Map::new()),
        }
    }

    pub fn inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn model_params(mut self, model_params: Value) -> Self {
        self.model_params = model_params;
        self
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Outputs recorded when the invocation fails. Defaults to `{}`.
    pub fn default_outputs(mut self, outputs: Value) -> Self {
        self.default_outputs = outputs;
        self
    }

    /// Await `fut`, timing it. Errors and panics are captured into the step.
    pub async fn measure<F>(self, fut: F) -> StepRun
    where
        F: Future<Output = anyhow::Result<Value>>,
    {
        let start_time = Utc::now();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(fut).catch_unwind().await;
        let elapsed_time_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let (outputs, error) = match outcome {
            Ok(Ok(outputs)) => (outputs, None),
            Ok(Err(e)) => (self.default_outputs, Some(format!("{e:#}"))),
            Err(panic) => (
                self.default_outputs,
                Some(format!("panicked: {}", panic_message(panic.as_ref()))),
            ),
        };

        StepRun {
            provider_name: self.provider_name,
            invocation_name: self.invocation_name,
            elapsed_time_ms,
            start_time,
            end_time: start_time + Duration::milliseconds(elapsed_time_ms),
            inputs: self.inputs,
            model_params: self.model_params,
            outputs,
            context: self.context,
            error,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
