//! JSON Schema checks for `verify.body.schema`.

use serde_json::Value;

/// Validates a JSON instance against a schema document.
pub trait SchemaValidator: Send + Sync {
    /// One message per violation. `Err` when the schema itself is not
    /// a valid JSON Schema.
    fn validate(
        &self,
        instance: &Value,
        schema: &Value,
    ) -> Result<Vec<String>, String>;
}

/// Full JSON Schema validation backed by the `jsonschema` crate. The
/// draft is taken from `$schema`, defaulting to the latest one.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaValidator;

impl SchemaValidator for JsonSchemaValidator {
    fn validate(
        &self,
        instance: &Value,
        schema: &Value,
    ) -> Result<Vec<String>, String> {
        let validator =
            jsonschema::validator_for(schema).map_err(|e| e.to_string())?;

        let errors = validator
            .iter_errors(instance)
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{path}: {error}")
                }
            })
            .collect();
        Ok(errors)
    }
}
