//! `save` handling: pulls values out of a response into new variables.

use serde_json::Value;
use tracing::debug;

use crate::error::{ExtractionError, StageError};
use crate::functions::FunctionRegistry;
use crate::model::{Save, Vars};
use crate::template;
use crate::transport::HttpResponse;

/// Evaluate a JMESPath expression against a JSON document.
pub fn search(value: &Value, expression: &str) -> Result<Value, String> {
    let compiled = jmespath::compile(expression).map_err(|e| e.to_string())?;
    let found = compiled
        .search(value.clone())
        .map_err(|e| e.to_string())?;
    serde_json::to_value(&*found).map_err(|e| e.to_string())
}

/// Evaluate a save path against a response.
///
/// `$status`, `$headers.<name>` and `$body` address the response
/// itself; anything else is a JMESPath expression over the JSON body.
/// `Ok(None)` means the path matched nothing.
pub fn select(response: &HttpResponse, path: &str) -> Result<Option<Value>, String> {
    let path = path.trim();
    if path == "$status" {
        return Ok(Some(Value::from(response.status)));
    }
    if let Some(name) = path.strip_prefix("$headers.") {
        return Ok(response
            .header(name)
            .map(|v| Value::String(v.to_string())));
    }
    if path == "$headers" {
        let headers = response
            .header_map()
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        return Ok(Some(Value::Object(headers)));
    }

    let body = response.json();
    if path == "$body" {
        return Ok(Some(body.unwrap_or_else(|| Value::String(response.text()))));
    }
    let expression = path.strip_prefix("$body.").unwrap_or(path);
    let Some(body) = body else {
        // still reject malformed expressions on non-JSON bodies
        jmespath::compile(expression).map_err(|e| e.to_string())?;
        return Ok(None);
    };
    match search(&body, expression)? {
        Value::Null => Ok(None),
        found => Ok(Some(found)),
    }
}

/// Runs the `save` block of a stage.
pub struct Extractor<'a> {
    registry: &'a FunctionRegistry,
}

impl<'a> Extractor<'a> {
    pub fn new(registry: &'a FunctionRegistry) -> Self {
        Self { registry }
    }

    /// Apply `save` to `response`. New entries are also written into
    /// `scope` so later save functions see them. Returns only the new
    /// entries.
    pub fn apply(
        &self,
        save: &Save,
        response: &HttpResponse,
        scope: &mut Vars,
    ) -> Result<Vars, StageError> {
        let mut saved = Vars::new();
        let mut errors = Vec::new();

        for (var, path) in &save.vars {
            let path = match template::resolve_string(path, scope) {
                Ok(path) => path,
                Err(source) => {
                    errors.push(ExtractionError::Path {
                        var: var.clone(),
                        source,
                    });
                    continue;
                }
            };
            match select(response, &path) {
                Ok(Some(value)) => {
                    debug!("Saved variable '{}' with value: {:?}", var, value);
                    saved.insert(var.clone(), value);
                }
                Ok(None) => errors.push(ExtractionError::NoMatch {
                    var: var.clone(),
                    path,
                }),
                Err(message) => errors.push(ExtractionError::InvalidPath {
                    var: var.clone(),
                    path,
                    message,
                }),
            }
        }
        if !errors.is_empty() {
            return Err(StageError::Extraction(errors));
        }
        scope.extend(saved.clone());

        for call in &save.functions {
            let name = call.name();
            let kwargs = match call.kwargs() {
                Some(kwargs) => template::resolve_vars(kwargs, scope).map_err(|source| {
                    StageError::Extraction(vec![ExtractionError::Kwargs {
                        name: name.to_string(),
                        source,
                    }])
                })?,
                None => Vars::new(),
            };
            let produced = self
                .registry
                .call_save(name, response, &kwargs)
                .map_err(|e| StageError::Extraction(vec![e.into()]))?;
            debug!(function = %name, count = produced.len(), "Save function produced variables");
            for (key, value) in produced {
                scope.insert(key.clone(), value.clone());
                saved.insert(key, value);
            }
        }

        Ok(saved)
    }
}
