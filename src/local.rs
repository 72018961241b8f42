//! Local pipeline runs.
//!
//! Runs an interaction against every test case stored for a pipeline without
//! an orchestrator in the loop, then submits the whole batch as one result.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::dispatch::PROVIDER_NAME;
use crate::registry::Interaction;
use crate::results::{ResultSink, TestCase};
use crate::runs::{CaseRun, Invocation, PipelineRun};
use crate::scheduler::BoundedRunner;
use crate::validation::{describe, JsonSchemaValidator, SchemaValidator};

/// Run `interaction` over the test cases of `pipeline` and return the id of
/// the created result.
///
/// Failed cases are still submitted, with the error on their step run.
pub async fn run_local(
    sink: Arc<dyn ResultSink>,
    interaction: Interaction,
    pipeline: &str,
    parallelism: Option<usize>,
) -> anyhow::Result<String> {
    let cases = sink
        .list_test_cases(pipeline)
        .await
        .with_context(|| format!("failed to list test cases for pipeline {pipeline}"))?;
    info!(pipeline, cases = cases.len(), interaction = %interaction.name(), "starting local run");

    let validator: Arc<dyn SchemaValidator> = Arc::new(JsonSchemaValidator);
    let mut runner = BoundedRunner::new(parallelism);
    for case in cases {
        let interaction = interaction.clone();
        let validator = Arc::clone(&validator);
        let pipeline = pipeline.to_string();
        runner.run(async move { Ok(run_case(interaction, validator.as_ref(), pipeline, case).await) });
    }

    let mut runs = Vec::with_capacity(runner.len());
    for settled in runner.settle().await {
        match settled {
            Ok(run) => runs.push(run),
            Err(e) => warn!(error = %format!("{e:#}"), "local case did not complete"),
        }
    }

    let failed = runs.iter().filter(|run| run.has_errors()).count();
    let total = runs.len();
    let result_id = sink
        .create_result(pipeline, runs)
        .await
        .context("failed to submit local run")?;

    info!(pipeline, total, failed, %result_id, "local run submitted");
    Ok(result_id)
}

async fn run_case(
    interaction: Interaction,
    validator: &dyn SchemaValidator,
    pipeline: String,
    case: TestCase,
) -> CaseRun {
    let TestCase { id, inputs, .. } = case;

    let mut context = Map::new();
    context.insert("testCaseId".to_string(), json!(id));
    let mut run = PipelineRun::new(Some(pipeline)).with_context(Map::new(), context);
    let invocation = Invocation::new(PROVIDER_NAME, interaction.name()).inputs(inputs.clone());

    match interaction
        .input_schema()
        .and_then(|schema| validator.validate(schema, &inputs).err())
    {
        Some(errors) => {
            let message = describe(&errors);
            run.measure(invocation, async move {
                Err::<Value, _>(anyhow!("input validation failed: {message}"))
            })
            .await;
        }
        None => {
            run.measure(invocation, interaction.call(inputs)).await;
        }
    }

    run.into_case_run(id)
}
