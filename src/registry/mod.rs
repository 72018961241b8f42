//! Registry of interactions and test suites this process can execute.
//!
//! Registration is last-write-wins and never fails. Every registration is
//! broadcast to subscribed sessions so a connected orchestrator learns about
//! it immediately; sessions that connect later read [`Registry::snapshot`].

pub mod params;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::link_proto::rpc::{
    EnvironmentDetails, InteractionInfo, OutboundMessage, RegisterInteraction, RegisterTestSuite,
    TestSuiteInfo,
};
use self::params::Parameter;

/// Registrations buffered per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 64;

pub type InteractionFn = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub type TestSuiteFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Interaction
// ---------------------------------------------------------------------------

/// A user function invoked once per test case.
#[derive(Clone)]
pub struct Interaction {
    name: String,
    function: InteractionFn,
    input_schema: Option<Value>,
    parameters: Vec<Parameter>,
}

impl Interaction {
    pub fn new<F, Fut>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            function: Arc::new(move |input| function(input).boxed()),
            input_schema: None,
            parameters: Vec::new(),
        }
    }

    /// Declare a JSON Schema the inputs must satisfy.
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_schema(&self) -> Option<&Value> {
        self.input_schema.as_ref()
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// The function itself runs on first poll, so a panic while building its
    /// future surfaces wherever the returned future is awaited.
    pub fn call(&self, input: Value) -> BoxFuture<'static, anyhow::Result<Value>> {
        let function = Arc::clone(&self.function);
        async move { function(input).await }.boxed()
    }

    pub fn info(&self) -> InteractionInfo {
        InteractionInfo {
            name: self.name.clone(),
            has_validation: self.input_schema.is_some(),
            parameters: self.parameters.iter().map(Parameter::info).collect(),
        }
    }
}

impl fmt::Debug for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interaction")
            .field("name", &self.name)
            .field("has_validation", &self.input_schema.is_some())
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TestSuite
// ---------------------------------------------------------------------------

/// A user function invoked once per job, with no per-case input.
#[derive(Clone)]
pub struct TestSuite {
    name: String,
    function: TestSuiteFn,
}

impl TestSuite {
    pub fn new<F, Fut>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            function: Arc::new(move || function().boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deferred like [`Interaction::call`].
    pub fn call(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        let function = Arc::clone(&self.function);
        async move { function().await }.boxed()
    }

    pub fn info(&self) -> TestSuiteInfo {
        TestSuiteInfo {
            name: self.name.clone(),
        }
    }
}

impl fmt::Debug for TestSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestSuite")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Notification sent to sessions when something is registered.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Interaction(InteractionInfo),
    TestSuite(TestSuiteInfo),
}

impl RegistryEvent {
    pub fn into_message(self) -> OutboundMessage {
        match self {
            RegistryEvent::Interaction(interaction) => {
                OutboundMessage::RegisterInteraction(RegisterInteraction { interaction })
            }
            RegistryEvent::TestSuite(test_suite) => {
                OutboundMessage::RegisterTestSuite(RegisterTestSuite { test_suite })
            }
        }
    }
}

/// Shared, read-mostly map of executable units.
pub struct Registry {
    interactions: RwLock<HashMap<String, Interaction>>,
    test_suites: RwLock<HashMap<String, TestSuite>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            interactions: RwLock::new(HashMap::new()),
            test_suites: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Insert or replace an interaction and notify subscribed sessions.
    pub fn register_interaction(&self, interaction: Interaction) {
        let info = interaction.info();
        debug!(interaction = %info.name, "registering interaction");
        self.interactions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.name.clone(), interaction);
        self.notify(RegistryEvent::Interaction(info));
    }

    /// Insert or replace a test suite and notify subscribed sessions.
    pub fn register_test_suite(&self, suite: TestSuite) {
        let info = suite.info();
        debug!(test_suite = %info.name, "registering test suite");
        self.test_suites
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.name.clone(), suite);
        self.notify(RegistryEvent::TestSuite(info));
    }

    pub fn interaction(&self, name: &str) -> Option<Interaction> {
        self.interactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn test_suite(&self, name: &str) -> Option<TestSuite> {
        self.test_suites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Metadata for every registered unit, sorted by name.
    pub fn snapshot(&self) -> EnvironmentDetails {
        let mut interactions: Vec<InteractionInfo> = self
            .interactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Interaction::info)
            .collect();
        interactions.sort_by(|a, b| a.name.cmp(&b.name));

        let mut test_suites: Vec<TestSuiteInfo> = self
            .test_suites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(TestSuite::info)
            .collect();
        test_suites.sort_by(|a, b| a.name.cmp(&b.name));

        EnvironmentDetails {
            interactions,
            test_suites,
        }
    }

    /// Receive every registration made from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: RegistryEvent) {
        // No subscribers just means no session is connected yet.
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(name: &str) -> Interaction {
        Interaction::new(name, |input| async move { Ok(input) })
    }

    #[tokio::test]
    async fn test_lookup_and_call() {
        let registry = Registry::new();
        registry.register_interaction(echo("greet"));

        let found = registry.interaction("greet").expect("registered");
        let out = found.call(json!({ "name": "Bob" })).await.unwrap();
        assert_eq!(out, json!({ "name": "Bob" }));
        assert!(registry.interaction("missing").is_none());
    }

    #[tokio::test]
    async fn test_call_defers_function_until_polled() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let interaction = {
            let calls = Arc::clone(&calls);
            Interaction::new("lazy", move |input| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(input) }
            })
        };

        let pending = interaction.call(json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(pending.await.unwrap(), json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reregistration_is_last_write_wins() {
        let registry = Registry::new();
        registry.register_interaction(echo("greet"));
        registry.register_interaction(
            echo("greet").with_input_schema(json!({ "type": "object" })),
        );

        let snap = registry.snapshot();
        assert_eq!(snap.interactions.len(), 1);
        assert!(snap.interactions[0].has_validation);
    }

    #[test]
    fn test_registration_broadcasts_exactly_once_per_subscriber() {
        let registry = Registry::new();
        let mut rx = registry.subscribe();

        registry.register_interaction(echo("greet"));
        let event = rx.try_recv().expect("one event");
        assert!(matches!(event, RegistryEvent::Interaction(ref i) if i.name == "greet"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_registration_before_subscribe_is_not_replayed() {
        let registry = Registry::new();
        registry.register_test_suite(TestSuite::new("nightly", || async { Ok(()) }));

        let mut rx = registry.subscribe();
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.snapshot().test_suites[0].name, "nightly");
    }

    #[test]
    fn test_snapshot_includes_parameters_sorted() {
        let registry = Registry::new();
        registry.register_interaction(echo("zeta"));
        registry.register_interaction(echo("alpha").with_parameter(Parameter::numeric("temp", 0.5)));

        let snap = registry.snapshot();
        let names: Vec<_> = snap.interactions.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["alpha", "zeta"]);
        assert_eq!(snap.interactions[0].parameters[0].kind, "numeric");
    }

    #[test]
    fn test_event_into_message() {
        let msg = RegistryEvent::TestSuite(TestSuiteInfo { name: "s".into() }).into_message();
        assert!(matches!(msg, OutboundMessage::RegisterTestSuite(_)));
    }
}
