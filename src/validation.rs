//! Input validation against an interaction's declared schema.

use jsonschema::JSONSchema;
use serde_json::Value;

/// Validates a value against a schema, returning every violation on failure.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema: &Value, value: &Value) -> Result<(), Vec<String>>;
}

/// [`SchemaValidator`] backed by JSON Schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaValidator;

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, schema: &Value, value: &Value) -> Result<(), Vec<String>> {
        let compiled = JSONSchema::compile(schema)
            .map_err(|e| vec![format!("invalid schema: {e}")])?;

        compiled.validate(value).map_err(|errors| {
            errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect()
        })
    }
}

/// Join violations into one message for the wire.
pub fn describe(errors: &[String]) -> String {
    if errors.is_empty() {
        "validation failed".to_string()
    } else {
        errors.join("; ")
    }
}
