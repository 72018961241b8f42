//! Tunable parameters and per-job override scoping.
//!
//! Overrides live in a tokio task-local that the dispatcher installs around
//! each test case of a job, so concurrently running jobs with different
//! overrides never observe each other's values.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::link_proto::rpc::ParameterInfo;

/// Override values keyed by parameter name.
pub type Overrides = Map<String, Value>;

tokio::task_local! {
    static OVERRIDES: Arc<Overrides>;
}

/// Run `fut` with `overrides` visible to every [`Parameter::value`] call it makes.
///
/// Task-locals do not cross `tokio::spawn`; work spawned from inside the
/// scope must be wrapped again.
pub async fn with_overrides<F: Future>(overrides: Arc<Overrides>, fut: F) -> F::Output {
    OVERRIDES.scope(overrides, fut).await
}

/// Override for `name` in the current scope, if any.
pub fn current_override(name: &str) -> Option<Value> {
    OVERRIDES
        .try_with(|overrides| overrides.get(name).cloned())
        .ok()
        .flatten()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterKind {
    Numeric { default: f64 },
    Text { default: String },
    Enum { default: String, options: Vec<String> },
    Template { default: String },
}

/// A named override slot with a declared kind and default.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    kind: ParameterKind,
}

impl Parameter {
    pub fn numeric(name: impl Into<String>, default: f64) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Numeric { default },
        }
    }

    pub fn string(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Text {
                default: default.into(),
            },
        }
    }

    pub fn enumeration<I, S>(name: impl Into<String>, options: I, default: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: ParameterKind::Enum {
                default: default.into(),
                options: options.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn template(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Template {
                default: default.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ParameterKind {
        &self.kind
    }

    /// Wire label for the parameter kind.
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            ParameterKind::Numeric { .. } => "numeric",
            ParameterKind::Text { .. } => "string",
            ParameterKind::Enum { .. } => "enum",
            ParameterKind::Template { .. } => "template",
        }
    }

    pub fn default_value(&self) -> Value {
        match &self.kind {
            ParameterKind::Numeric { default } => Value::from(*default),
            ParameterKind::Text { default }
            | ParameterKind::Enum { default, .. }
            | ParameterKind::Template { default } => Value::String(default.clone()),
        }
    }

    /// Effective value: the scoped override when it fits the kind, else the default.
    pub fn value(&self) -> Value {
        let Some(raw) = current_override(&self.name) else {
            return self.default_value();
        };

        match self.coerce(&raw) {
            Some(v) => v,
            None => {
                warn!(parameter = %self.name, kind = self.kind_label(), value = %raw, "override does not fit parameter, using default");
                self.default_value()
            }
        }
    }

    /// Effective value as a number. Non-numeric kinds parse their text, falling back to `0.0`.
    pub fn as_f64(&self) -> f64 {
        match self.value() {
            Value::Number(n) => n.as_f64().unwrap_or_default(),
            Value::String(s) => s.trim().parse().unwrap_or_default(),
            _ => 0.0,
        }
    }

    /// Effective value as text.
    pub fn as_string(&self) -> String {
        match self.value() {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }

    /// Render the effective value as a template, substituting `{{key}}` from `vars`.
    pub fn render(&self, vars: &Value) -> String {
        render_template(&self.as_string(), vars)
    }

    pub fn info(&self) -> ParameterInfo {
        ParameterInfo {
            name: self.name.clone(),
            kind: self.kind_label().to_string(),
            default_value: self.default_value(),
            options: match &self.kind {
                ParameterKind::Enum { options, .. } => Some(options.clone()),
                _ => None,
            },
        }
    }

    fn coerce(&self, raw: &Value) -> Option<Value> {
        match &self.kind {
            ParameterKind::Numeric { .. } => match raw {
                Value::Number(_) => Some(raw.clone()),
                Value::String(s) => s.trim().parse::<f64>().ok().map(Value::from),
                _ => None,
            },
            ParameterKind::Text { .. } | ParameterKind::Template { .. } => {
                raw.as_str().map(|s| Value::String(s.to_string()))
            }
            ParameterKind::Enum { options, .. } => raw
                .as_str()
                .filter(|s| options.iter().any(|o| o == s))
                .map(|s| Value::String(s.to_string())),
        }
    }
}

/// Replace `{{ key }}` placeholders with values from `vars`.
///
/// Unknown keys and unterminated placeholders are left as written.
pub fn render_template(template: &str, vars: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after[..end].trim();
        match vars.get(key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..start + end + 4]),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(values: Value) -> Arc<Overrides> {
        match values {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(Map::new()),
        }
    }

    #[test]
    fn test_value_without_scope_is_default() {
        let p = Parameter::numeric("temperature", 0.7);
        assert_eq!(p.as_f64(), 0.7);
    }

    #[tokio::test]
    async fn test_scoped_override_is_visible() {
        let p = Parameter::numeric("temperature", 0.7);
        let seen = with_overrides(scope(json!({ "temperature": 0.1 })), async { p.as_f64() }).await;
        assert_eq!(seen, 0.1);
        assert_eq!(p.as_f64(), 0.7);
    }

    #[tokio::test]
    async fn test_concurrent_scopes_do_not_leak() {
        let p = Parameter::string("model", "small");

        let a = {
            let p = p.clone();
            tokio::spawn(with_overrides(scope(json!({ "model": "alpha" })), async move {
                tokio::task::yield_now().await;
                p.as_string()
            }))
        };
        let b = {
            let p = p.clone();
            tokio::spawn(with_overrides(scope(json!({ "model": "beta" })), async move {
                tokio::task::yield_now().await;
                p.as_string()
            }))
        };

        assert_eq!(a.await.unwrap(), "alpha");
        assert_eq!(b.await.unwrap(), "beta");
    }

    #[tokio::test]
    async fn test_enum_override_outside_options_falls_back() {
        let p = Parameter::enumeration("tone", ["formal", "casual"], "formal");
        let v = with_overrides(scope(json!({ "tone": "pirate" })), async { p.as_string() }).await;
        assert_eq!(v, "formal");

        let v = with_overrides(scope(json!({ "tone": "casual" })), async { p.as_string() }).await;
        assert_eq!(v, "casual");
    }

    #[tokio::test]
    async fn test_numeric_override_accepts_numeric_string() {
        let p = Parameter::numeric("top_k", 5.0);
        let v = with_overrides(scope(json!({ "top_k": "12" })), async { p.as_f64() }).await;
        assert_eq!(v, 12.0);
    }

    #[tokio::test]
    async fn test_template_render_uses_override() {
        let p = Parameter::template("greeting", "Hello {{name}}");
        assert_eq!(p.render(&json!({ "name": "Bob" })), "Hello Bob");

        let v = with_overrides(scope(json!({ "greeting": "Hi {{ name }}, {{missing}}" })), async {
            p.render(&json!({ "name": "Ann" }))
        })
        .await;
        assert_eq!(v, "Hi Ann, {{missing}}");
    }

    #[test]
    fn test_render_unterminated_placeholder() {
        assert_eq!(render_template("a {{b", &json!({ "b": 1 })), "a {{b");
        assert_eq!(render_template("n={{n}}", &json!({ "n": 3 })), "n=3");
    }

    #[test]
    fn test_enum_info_lists_options() {
        let info = Parameter::enumeration("tone", ["formal", "casual"], "formal").info();
        assert_eq!(info.kind, "enum");
        assert_eq!(info.options, Some(vec!["formal".into(), "casual".into()]));
        assert_eq!(info.default_value, json!("formal"));
    }
}
