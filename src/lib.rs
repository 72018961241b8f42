//! evallink -- remote test execution for evaluation pipelines.
//!
//! A process registers interaction functions and test suites in a
//! [`registry::Registry`], then either keeps a WebSocket session open to the
//! orchestrator ([`link_proto::listen`]) or serves the same control messages
//! over HTTP ([`webhook::serve`]). Execution requests run in the background
//! with bounded concurrency and their results are posted through a
//! [`results::ResultSink`].

pub mod config;
pub mod dispatch;
pub mod error;
pub mod link_proto;
pub mod local;
pub mod registry;
pub mod results;
pub mod runs;
pub mod scheduler;
pub mod validation;
pub mod webhook;

use std::sync::Arc;

use serde_json::{json, Value};

use crate::registry::params::Parameter;
use crate::registry::{Interaction, Registry, TestSuite};

/// Name of the demo interaction served by the binary.
pub const ECHO_INTERACTION: &str = "echo";

/// The `echo` interaction: returns its input along with the rendered
/// `prefix` template parameter.
pub fn echo_interaction() -> Interaction {
    let prefix = Parameter::template("prefix", "echo: {{ message }}");
    Interaction::new(ECHO_INTERACTION, {
        let prefix = prefix.clone();
        move |input: Value| {
            let prefix = prefix.clone();
            async move {
                Ok(json!({
                    "prefix": prefix.render(&input),
                    "input": input,
                }))
            }
        }
    })
    .with_input_schema(json!({ "type": "object" }))
    .with_parameter(prefix)
}

/// Registry served by the `evallink` binary.
pub fn demo_registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry.register_interaction(echo_interaction());
    registry.register_test_suite(TestSuite::new("noop", || async {
        tracing::info!("noop test suite ran");
        Ok(())
    }));
    registry
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::params::with_overrides;

    #[tokio::test]
    async fn test_echo_renders_prefix_from_input() {
        let out = echo_interaction()
            .call(json!({ "message": "hi" }))
            .await
            .unwrap();
        assert_eq!(out["prefix"], "echo: hi");
        assert_eq!(out["input"]["message"], "hi");
    }

    #[tokio::test]
    async fn test_echo_prefix_follows_override() {
        let mut overrides = serde_json::Map::new();
        overrides.insert("prefix".into(), json!(">> {{ message }}"));

        let out = with_overrides(Arc::new(overrides), echo_interaction().call(json!({ "message": "x" })))
            .await
            .unwrap();
        assert_eq!(out["prefix"], ">> x");
    }

    #[test]
    fn test_demo_registry_advertises_echo_and_noop() {
        let details = demo_registry().snapshot();
        assert_eq!(details.interactions.len(), 1);
        assert_eq!(details.interactions[0].name, ECHO_INTERACTION);
        assert!(details.interactions[0].has_validation);
        assert_eq!(details.interactions[0].parameters[0].name, "prefix");
        assert_eq!(details.test_suites[0].name, "noop");
    }
}
