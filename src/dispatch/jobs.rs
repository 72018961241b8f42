//! Background bodies of `run-test-interaction` and `run-test-suite` jobs.
//!
//! A job always ends by posting its completion signal, whatever happened to
//! individual cases.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use super::PROVIDER_NAME;
use crate::link_proto::rpc::{RunTestInteraction, RunTestSuite, TestCaseInput};
use crate::registry::params::with_overrides;
use crate::registry::{Interaction, Registry};
use crate::results::ResultSink;
use crate::runs::{Invocation, PipelineRun};
use crate::scheduler::BoundedRunner;
use crate::validation::{describe, SchemaValidator};

pub(super) async fn run_interaction_job(
    registry: Arc<Registry>,
    sink: Arc<dyn ResultSink>,
    validator: Arc<dyn SchemaValidator>,
    request: RunTestInteraction,
) {
    let RunTestInteraction {
        pipeline_id,
        test_job_id,
        interaction_name,
        parallelism,
        data,
        overrides,
    } = request;

    let Some(interaction) = registry.interaction(&interaction_name) else {
        warn!(test_job_id = %test_job_id, interaction = %interaction_name, "interaction not registered, finishing job without running cases");
        finish(sink.as_ref(), &test_job_id).await;
        return;
    };

    let overrides = Arc::new(overrides);
    let job_id: Arc<str> = Arc::from(test_job_id.as_str());
    let total = data.len();
    let mut runner = BoundedRunner::new(parallelism);

    for case in data {
        let thunk = run_case(
            interaction.clone(),
            Arc::clone(&validator),
            Arc::clone(&sink),
            Arc::clone(&job_id),
            pipeline_id.clone(),
            case,
        );
        runner.run(with_overrides(Arc::clone(&overrides), thunk));
    }

    let mut failed_cases = 0usize;
    let mut errors = Vec::new();
    for settled in runner.settle().await {
        match settled {
            Ok(true) => failed_cases += 1,
            Ok(false) => {}
            Err(e) => errors.push(e),
        }
    }

    for e in &errors {
        warn!(test_job_id = %test_job_id, error = %format!("{e:#}"), "case did not complete");
    }
    info!(
        test_job_id = %test_job_id,
        total,
        failed_cases,
        incomplete = errors.len(),
        "test interaction job settled"
    );

    finish(sink.as_ref(), &test_job_id).await;
}

/// Execute one case and submit it. `Ok(true)` means the case ran but failed.
async fn run_case(
    interaction: Interaction,
    validator: Arc<dyn SchemaValidator>,
    sink: Arc<dyn ResultSink>,
    test_job_id: Arc<str>,
    pipeline_id: String,
    case: TestCaseInput,
) -> anyhow::Result<bool> {
    let TestCaseInput { id, inputs } = case;

    let mut run = PipelineRun::new(Some(pipeline_id)).with_context(
        Map::new(),
        context_map(json!({ "testJobId": &*test_job_id, "testCaseId": &id })),
    );
    let invocation = Invocation::new(PROVIDER_NAME, interaction.name()).inputs(inputs.clone());

    let rejected = interaction
        .input_schema()
        .and_then(|schema| validator.validate(schema, &inputs).err());

    match rejected {
        Some(errors) => {
            let message = describe(&errors);
            run.measure(invocation, async move {
                Err(anyhow!("input validation failed: {message}"))
            })
            .await;
        }
        None => {
            run.measure(invocation, interaction.call(inputs)).await;
        }
    }

    let failed = run.has_errors();
    debug!(test_job_id = %test_job_id, case = %id, failed, "case executed");

    sink.submit_case(&test_job_id, run.into_case_run(id.clone()))
        .await
        .with_context(|| format!("failed to submit case {id}"))?;
    Ok(failed)
}

pub(super) async fn run_test_suite_job(
    registry: Arc<Registry>,
    sink: Arc<dyn ResultSink>,
    request: RunTestSuite,
) {
    match registry.test_suite(&request.test_suite_name) {
        None => {
            warn!(test_job_id = %request.test_job_id, test_suite = %request.test_suite_name, "test suite not registered");
        }
        Some(suite) => {
            debug!(test_job_id = %request.test_job_id, parallelism = ?request.parallelism, "invoking test suite");
            match AssertUnwindSafe(suite.call()).catch_unwind().await {
                Ok(Ok(())) => {
                    info!(test_job_id = %request.test_job_id, test_suite = %request.test_suite_name, "test suite finished");
                }
                Ok(Err(e)) => {
                    warn!(test_job_id = %request.test_job_id, error = %format!("{e:#}"), "test suite failed");
                }
                Err(_) => {
                    warn!(test_job_id = %request.test_job_id, "test suite panicked");
                }
            }
        }
    }

    finish(sink.as_ref(), &request.test_job_id).await;
}

async fn finish(sink: &dyn ResultSink, test_job_id: &str) {
    match sink.finish_job(test_job_id).await {
        Ok(()) => debug!(test_job_id, "job completion posted"),
        Err(e) => error!(test_job_id, error = %e, "failed to post job completion"),
    }
}

fn context_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_proto::rpc::TestCaseInput;
    use crate::registry::params::Parameter;
    use crate::registry::TestSuite;
    use crate::results::MemorySink;
    use crate::validation::JsonSchemaValidator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cases(n: usize) -> Vec<TestCaseInput> {
        (0..n)
            .map(|i| TestCaseInput {
                id: format!("case-{i}"),
                inputs: json!({ "n": i }),
            })
            .collect()
    }

    fn request(interaction: &str, data: Vec<TestCaseInput>, overrides: Value) -> RunTestInteraction {
        RunTestInteraction {
            pipeline_id: "p1".into(),
            test_job_id: "job".into(),
            interaction_name: interaction.into(),
            parallelism: Some(2),
            data,
            overrides: context_map(overrides),
        }
    }

    #[tokio::test]
    async fn test_overrides_reach_interaction_functions() {
        let registry = Arc::new(Registry::new());
        let temperature = Parameter::numeric("temperature", 0.7);
        registry.register_interaction(
            Interaction::new("temp", move |_| {
                let temperature = temperature.clone();
                async move { Ok(json!(temperature.as_f64())) }
            }),
        );
        let sink = Arc::new(MemorySink::new());

        run_interaction_job(
            registry,
            sink.clone(),
            Arc::new(JsonSchemaValidator),
            request("temp", cases(3), json!({ "temperature": 0.2 })),
        )
        .await;

        let submitted = sink.submitted();
        assert_eq!(submitted.len(), 3);
        assert!(submitted
            .iter()
            .all(|(_, run)| run.step_runs[0].outputs == json!(0.2)));
    }

    #[tokio::test]
    async fn test_schema_rejection_skips_invocation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(Registry::new());
        {
            let calls = Arc::clone(&calls);
            registry.register_interaction(
                Interaction::new("strict", move |input| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(input) }
                })
                .with_input_schema(json!({ "type": "object", "required": ["name"] })),
            );
        }
        let sink = Arc::new(MemorySink::new());

        run_interaction_job(
            registry,
            sink.clone(),
            Arc::new(JsonSchemaValidator),
            request("strict", cases(2), json!({})),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let submitted = sink.submitted();
        assert_eq!(submitted.len(), 2);
        assert!(submitted[0].1.step_runs[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("input validation failed"));
        assert_eq!(sink.finished(), vec!["job".to_string()]);
    }

    #[tokio::test]
    async fn test_case_context_carries_job_and_case_ids() {
        let registry = Arc::new(Registry::new());
        registry.register_interaction(Interaction::new("echo", |input| async move { Ok(input) }));
        let sink = Arc::new(MemorySink::new());

        run_interaction_job(
            registry,
            sink.clone(),
            Arc::new(JsonSchemaValidator),
            request("echo", cases(1), json!({})),
        )
        .await;

        let (job, run) = &sink.submitted()[0];
        assert_eq!(job, "job");
        assert_eq!(run.context["testCaseId"], "case-0");
        assert_eq!(run.step_runs[0].provider_name, PROVIDER_NAME);
    }

    #[tokio::test]
    async fn test_suite_job_runs_once_and_finishes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(Registry::new());
        {
            let calls = Arc::clone(&calls);
            registry.register_test_suite(TestSuite::new("nightly", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("suite failed")) }
            }));
        }
        let sink = Arc::new(MemorySink::new());

        run_test_suite_job(
            registry,
            sink.clone(),
            RunTestSuite {
                pipeline_id: "p1".into(),
                test_job_id: "suite-job".into(),
                test_suite_name: "nightly".into(),
                parallelism: Some(4),
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.finished(), vec!["suite-job".to_string()]);
    }

    #[tokio::test]
    async fn test_panic_while_building_case_future_fails_only_that_case() {
        let registry = Arc::new(Registry::new());
        registry.register_interaction(Interaction::new("picky", |input: Value| {
            let n = input["n"].as_i64().expect("n is required");
            async move { Ok(json!(n)) }
        }));
        let sink = Arc::new(MemorySink::new());
        let data = vec![
            TestCaseInput { id: "ok".into(), inputs: json!({ "n": 1 }) },
            TestCaseInput { id: "bad".into(), inputs: json!({}) },
        ];

        run_interaction_job(registry, sink.clone(), Arc::new(JsonSchemaValidator), request("picky", data, json!({})))
            .await;

        let submitted = sink.submitted();
        assert_eq!(submitted.len(), 2);
        let step = |case: &str| {
            submitted
                .iter()
                .find(|(_, run)| run.case_id == case)
                .map(|(_, run)| run.step_runs[0].clone())
                .unwrap()
        };
        assert_eq!(step("ok").outputs, json!(1));
        assert!(step("ok").error.is_none());
        assert!(step("bad").error.as_deref().unwrap().starts_with("panicked"));
        assert_eq!(sink.finished(), vec!["job".to_string()]);
    }

    #[tokio::test]
    async fn test_suite_panicking_before_its_future_still_finishes() {
        let registry = Arc::new(Registry::new());
        registry.register_test_suite(TestSuite::new("broken", || -> futures::future::Ready<anyhow::Result<()>> {
            panic!("suite setup failed")
        }));
        let sink = Arc::new(MemorySink::new());

        let job = tokio::spawn(run_test_suite_job(
            registry,
            sink.clone(),
            RunTestSuite {
                pipeline_id: "p1".into(),
                test_job_id: "broken-job".into(),
                test_suite_name: "broken".into(),
                parallelism: None,
            },
        ));

        assert!(job.await.is_ok());
        assert_eq!(sink.finished(), vec!["broken-job".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_suite_still_finishes() {
        let sink = Arc::new(MemorySink::new());
        run_test_suite_job(
            Arc::new(Registry::new()),
            sink.clone(),
            RunTestSuite {
                pipeline_id: "p1".into(),
                test_job_id: "ghost".into(),
                test_suite_name: "ghost".into(),
                parallelism: None,
            },
        )
        .await;
        assert_eq!(sink.finished(), vec!["ghost".to_string()]);
    }
}
