//! Dispatch of inbound control messages.
//!
//! The [`Dispatcher`] is transport-agnostic: it turns one inbound message
//! into at most one immediate reply, and for execution requests hands back a
//! [`PendingJob`] that does nothing until the transport starts it. The
//! WebSocket session starts it once the confirmation is written to the
//! socket; the webhook starts it once the response is built.

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::link_proto::rpc::{
    Confirmation, InboundMessage, OutboundMessage, RunInteractionInputValidation,
    ValidationOutcome, ValidationResults,
};
use crate::registry::Registry;
use crate::results::ResultSink;
use crate::validation::{describe, JsonSchemaValidator, SchemaValidator};

/// Provider name recorded on step runs of registered interactions.
pub const PROVIDER_NAME: &str = "function";

/// Immediate outcome of dispatching one message.
#[derive(Debug, Default)]
pub struct Dispatched {
    /// Reply to send back on the channel the message arrived on.
    pub reply: Option<OutboundMessage>,
    /// Background job requested by the message, not yet running.
    pub job: Option<PendingJob>,
}

/// A job body that runs only after [`PendingJob::start`].
#[must_use = "a pending job does nothing until started"]
pub struct PendingJob {
    tracker: TaskTracker,
    body: BoxFuture<'static, ()>,
}

impl PendingJob {
    /// Spawn the job on the dispatcher's tracker.
    pub fn start(self) -> JoinHandle<()> {
        self.tracker.spawn(self.body)
    }
}

impl std::fmt::Debug for PendingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingJob").finish_non_exhaustive()
    }
}

/// Interprets control messages against a registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    sink: Arc<dyn ResultSink>,
    validator: Arc<dyn SchemaValidator>,
    jobs: TaskTracker,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            registry,
            sink,
            validator: Arc::new(JsonSchemaValidator),
            jobs: TaskTracker::new(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Number of background jobs still running.
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    pub fn dispatch(&self, message: InboundMessage) -> Dispatched {
        match message {
            InboundMessage::EnvironmentDetails(_) => {
                debug!("environment details requested");
                Dispatched {
                    reply: Some(OutboundMessage::EnvironmentDetails(self.registry.snapshot())),
                    job: None,
                }
            }
            InboundMessage::RunInteractionInputValidation(request) => Dispatched {
                reply: Some(OutboundMessage::RunInteractionInputValidationResults(
                    self.validate_inputs(request),
                )),
                job: None,
            },
            InboundMessage::RunTestInteraction(request) => {
                info!(
                    test_job_id = %request.test_job_id,
                    interaction = %request.interaction_name,
                    cases = request.data.len(),
                    parallelism = ?request.parallelism,
                    "test interaction job received"
                );
                let job = self.pending(jobs::run_interaction_job(
                    Arc::clone(&self.registry),
                    Arc::clone(&self.sink),
                    Arc::clone(&self.validator),
                    request,
                ));
                Dispatched {
                    reply: Some(confirmed()),
                    job: Some(job),
                }
            }
            InboundMessage::RunTestSuite(request) => {
                info!(
                    test_job_id = %request.test_job_id,
                    test_suite = %request.test_suite_name,
                    "test suite job received"
                );
                let job = self.pending(jobs::run_test_suite_job(
                    Arc::clone(&self.registry),
                    Arc::clone(&self.sink),
                    request,
                ));
                Dispatched {
                    reply: Some(confirmed()),
                    job: Some(job),
                }
            }
        }
    }

    /// Stop tracking new work and wait up to `grace` for running jobs.
    ///
    /// Returns `true` if every job finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.jobs.close();
        let running = self.jobs.len();
        if running == 0 {
            return true;
        }
        info!(running, grace_secs = grace.as_secs(), "waiting for in-flight jobs");
        match tokio::time::timeout(grace, self.jobs.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(remaining = self.jobs.len(), "grace period elapsed with jobs still running");
                false
            }
        }
    }

    fn pending<F>(&self, body: F) -> PendingJob
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        PendingJob {
            tracker: self.jobs.clone(),
            body: body.boxed(),
        }
    }

    fn validate_inputs(&self, request: RunInteractionInputValidation) -> ValidationResults {
        let RunInteractionInputValidation {
            id,
            interaction_name,
            data,
        } = request;

        let outcomes = match self.registry.interaction(&interaction_name) {
            None => {
                warn!(interaction = %interaction_name, "validation requested for unknown interaction");
                let message = format!("interaction '{interaction_name}' not found");
                data.into_iter()
                    .map(|case| ValidationOutcome::failure(case.id, message.clone()))
                    .collect()
            }
            Some(interaction) => match interaction.input_schema() {
                None => data
                    .into_iter()
                    .map(|case| ValidationOutcome::success(case.id))
                    .collect(),
                Some(schema) => data
                    .into_iter()
                    .map(|case| match self.validator.validate(schema, &case.inputs) {
                        Ok(()) => ValidationOutcome::success(case.id),
                        Err(errors) => ValidationOutcome::failure(case.id, describe(&errors)),
                    })
                    .collect(),
            },
        };

        ValidationResults {
            id,
            interaction_name,
            data: outcomes,
        }
    }
}

fn confirmed() -> OutboundMessage {
    OutboundMessage::Confirmation(Confirmation { ok: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_proto::rpc::{
        EnvironmentDetailsRequest, RunTestInteraction, TestCaseInput, ValidationStatus,
    };
    use crate::registry::Interaction;
    use crate::results::MemorySink;
    use serde_json::json;

    fn dispatcher() -> (Dispatcher, Arc<MemorySink>) {
        let registry = Arc::new(Registry::new());
        registry.register_interaction(
            Interaction::new("greet", |input| async move { Ok(input) }).with_input_schema(json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            })),
        );
        let sink = Arc::new(MemorySink::new());
        (Dispatcher::new(registry, sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_environment_details_reply_has_snapshot() {
        let (dispatcher, _) = dispatcher();
        let out = dispatcher.dispatch(InboundMessage::EnvironmentDetails(
            EnvironmentDetailsRequest { id: Some("r".into()) },
        ));
        match out.reply {
            Some(OutboundMessage::EnvironmentDetails(details)) => {
                assert_eq!(details.interactions[0].name, "greet");
                assert!(details.interactions[0].has_validation);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(out.job.is_none());
    }

    #[tokio::test]
    async fn test_validation_of_unknown_interaction_fails_every_case() {
        let (dispatcher, _) = dispatcher();
        let out = dispatcher.dispatch(InboundMessage::RunInteractionInputValidation(
            RunInteractionInputValidation {
                id: "v1".into(),
                interaction_name: "missing".into(),
                data: vec![
                    TestCaseInput { id: "a".into(), inputs: json!({ "name": "Bob" }) },
                    TestCaseInput { id: "b".into(), inputs: json!({}) },
                ],
            },
        ));
        let Some(OutboundMessage::RunInteractionInputValidationResults(results)) = out.reply else {
            panic!("expected validation results");
        };
        assert!(results
            .data
            .iter()
            .all(|o| o.status == ValidationStatus::Failure
                && o.error.as_deref().unwrap().contains("not found")));
    }

    #[tokio::test]
    async fn test_run_interaction_confirms_before_job_finishes() {
        let (dispatcher, sink) = dispatcher();
        let out = dispatcher.dispatch(InboundMessage::RunTestInteraction(RunTestInteraction {
            pipeline_id: "p".into(),
            test_job_id: "job-1".into(),
            interaction_name: "greet".into(),
            parallelism: Some(2),
            data: vec![TestCaseInput { id: "a".into(), inputs: json!({ "name": "Bob" }) }],
            overrides: Default::default(),
        }));

        assert_eq!(out.reply, Some(confirmed()));
        out.job.expect("job returned").start().await.unwrap();
        assert_eq!(sink.finished(), vec!["job-1".to_string()]);
        assert_eq!(sink.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_job_does_no_work_until_started() {
        let (dispatcher, sink) = dispatcher();
        let out = dispatcher.dispatch(InboundMessage::RunTestInteraction(RunTestInteraction {
            pipeline_id: "p".into(),
            test_job_id: "job-unknown".into(),
            interaction_name: "missing".into(),
            parallelism: None,
            data: Vec::new(),
            overrides: Default::default(),
        }));
        let job = out.job.expect("job returned");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.finished().is_empty());
        assert_eq!(dispatcher.in_flight(), 0);

        job.start().await.unwrap();
        assert_eq!(sink.finished(), vec!["job-unknown".to_string()]);
    }

    #[tokio::test]
    async fn test_drain_waits_for_jobs() {
        let (dispatcher, sink) = dispatcher();
        let out = dispatcher.dispatch(InboundMessage::RunTestInteraction(RunTestInteraction {
            pipeline_id: "p".into(),
            test_job_id: "job-2".into(),
            interaction_name: "greet".into(),
            parallelism: None,
            data: vec![TestCaseInput { id: "a".into(), inputs: json!({ "name": "Ann" }) }],
            overrides: Default::default(),
        }));
        let _running = out.job.expect("job returned").start();

        assert!(dispatcher.drain(Duration::from_secs(5)).await);
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(sink.finished(), vec!["job-2".to_string()]);
    }
}
