//! Message types for the eval link control channel.
//!
//! Every frame is an [`Envelope`] carrying a correlation `id`, an optional
//! `for` peer address, an optional `init` marker, and a tagged message in
//! `data`. Messages are internally tagged JSON (`"type": "..."`) so the
//! receiver can dispatch on `type` before parsing the body.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Top-level envelope for every frame on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Unique frame identifier.
    pub id: String,
    /// Peer id assigned by the orchestrator. Omitted until the handshake completes.
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub for_peer: Option<String>,
    /// Present only on the first outbound frame of a WebSocket session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    pub data: T,
}

impl<T> Envelope<T> {
    /// Wrap `data` in an envelope with a fresh v4 id.
    pub fn new(data: T) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            for_peer: None,
            init: None,
            data,
        }
    }

    pub fn addressed_to(mut self, peer: impl Into<String>) -> Self {
        self.for_peer = Some(peer.into());
        self
    }

    pub fn with_init(mut self, init: impl Into<String>) -> Self {
        self.init = Some(init.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Inbound (orchestrator -> SDK)
// ---------------------------------------------------------------------------

/// Control messages the orchestrator sends to this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundMessage {
    EnvironmentDetails(EnvironmentDetailsRequest),
    RunInteractionInputValidation(RunInteractionInputValidation),
    RunTestInteraction(RunTestInteraction),
    RunTestSuite(RunTestSuite),
}

impl InboundMessage {
    /// Wire `type` values understood by [`InboundMessage`].
    pub const KNOWN_TYPES: [&'static str; 4] = [
        "environment-details",
        "run-interaction-input-validation",
        "run-test-interaction",
        "run-test-suite",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDetailsRequest {
    #[serde(default)]
    pub id: Option<String>,
}

/// One test case as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseInput {
    pub id: String,
    #[serde(default)]
    pub inputs: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInteractionInputValidation {
    pub id: String,
    pub interaction_name: String,
    #[serde(default)]
    pub data: Vec<TestCaseInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTestInteraction {
    pub pipeline_id: String,
    pub test_job_id: String,
    pub interaction_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub data: Vec<TestCaseInput>,
    #[serde(default)]
    pub overrides: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTestSuite {
    pub pipeline_id: String,
    pub test_job_id: String,
    pub test_suite_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

// ---------------------------------------------------------------------------
// Outbound (SDK -> orchestrator)
// ---------------------------------------------------------------------------

/// Messages this process sends to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    Setup(Setup),
    Heartbeat,
    EnvironmentDetails(EnvironmentDetails),
    RegisterInteraction(RegisterInteraction),
    RegisterTestSuite(RegisterTestSuite),
    RunInteractionInputValidationResults(ValidationResults),
    Confirmation(Confirmation),
}

/// First frame of every WebSocket session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub api_key: String,
    pub environment_name: String,
}

/// Parameter metadata advertised alongside an interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub default_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionInfo {
    pub name: String,
    pub has_validation: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuiteInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDetails {
    pub interactions: Vec<InteractionInfo>,
    pub test_suites: Vec<TestSuiteInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterInteraction {
    pub interaction: InteractionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTestSuite {
    pub test_suite: TestSuiteInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Success,
    Failure,
}

/// Outcome of validating one test case's inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub id: String,
    pub status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationOutcome {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ValidationStatus::Success,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ValidationStatus::Failure,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResults {
    pub id: String,
    pub interaction_name: String,
    pub data: Vec<ValidationOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub ok: bool,
}
