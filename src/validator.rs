//! Response verification for the `verify` block of a stage.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::TemplateError;
use crate::functions::FunctionRegistry;
use crate::model::{CheckKind, Finding, SchemaSource, Verify, Vars};
use crate::schema::SchemaValidator;
use crate::template;
use crate::transport::HttpResponse;

/// `verify` with every template resolved against the stage scope.
#[derive(Debug, Clone, Default)]
struct ResolvedVerify {
    status: Option<u16>,
    headers: BTreeMap<String, String>,
    vars: BTreeMap<String, Value>,
    schema: Option<ResolvedSchema>,
    contains: Vec<String>,
    not_contains: Vec<String>,
    matches: Vec<String>,
    not_matches: Vec<String>,
}

#[derive(Debug, Clone)]
enum ResolvedSchema {
    Inline(Value),
    File(PathBuf),
}

/// Evaluates assertions and collects every failure as a [`Finding`].
pub struct Verifier<'a> {
    registry: &'a FunctionRegistry,
    schemas: &'a dyn SchemaValidator,
    base_dir: &'a Path,
}

impl<'a> Verifier<'a> {
    pub fn new(
        registry: &'a FunctionRegistry,
        schemas: &'a dyn SchemaValidator,
        base_dir: &'a Path,
    ) -> Self {
        Self {
            registry,
            schemas,
            base_dir,
        }
    }

    /// Check `response` and the stage scope against `verify`.
    ///
    /// Template failures abort evaluation; assertion failures never
    /// do, all of them are returned together.
    pub fn evaluate(
        &self,
        verify: &Verify,
        response: &HttpResponse,
        scope: &Vars,
    ) -> Result<Vec<Finding>, TemplateError> {
        let resolved = self.resolve(verify, scope)?;
        let mut findings = Vec::new();

        if let Some(expected) = resolved.status {
            if response.status != expected {
                findings.push(Finding::new(
                    CheckKind::Status,
                    "status",
                    format!(
                        "Status code doesn't match: expected {expected}, got {}",
                        response.status
                    ),
                ));
            }
        }

        findings.extend(validate_headers(response, &resolved.headers));
        findings.extend(validate_vars(scope, &resolved.vars));
        findings.extend(self.validate_functions(verify, response, scope));

        let body = response.text();
        if let Some(schema) = &resolved.schema {
            findings.extend(self.validate_schema(response, schema));
        }
        findings.extend(validate_contains(&body, &resolved.contains));
        findings.extend(validate_not_contains(&body, &resolved.not_contains));
        findings.extend(validate_matches(&body, &resolved.matches, true));
        findings.extend(validate_matches(&body, &resolved.not_matches, false));

        Ok(findings)
    }

    fn resolve(&self, verify: &Verify, scope: &Vars) -> Result<ResolvedVerify, TemplateError> {
        let resolve_all = |items: &[String]| -> Result<Vec<String>, TemplateError> {
            items
                .iter()
                .map(|item| template::resolve_string(item, scope))
                .collect()
        };

        let mut headers = BTreeMap::new();
        for (name, value) in &verify.headers {
            headers.insert(name.clone(), template::resolve_string(value, scope)?);
        }
        let mut vars = BTreeMap::new();
        for (name, value) in &verify.vars {
            vars.insert(name.clone(), template::resolve_value(value, scope)?);
        }
        let schema = match &verify.body.schema {
            Some(SchemaSource::Inline(map)) => Some(ResolvedSchema::Inline(
                template::resolve_value(&Value::Object(map.clone()), scope)?,
            )),
            Some(SchemaSource::File(path)) => Some(ResolvedSchema::File(
                self.base_dir.join(template::resolve_string(path, scope)?),
            )),
            None => None,
        };

        Ok(ResolvedVerify {
            status: verify.status.as_ref().map(|s| s.resolve(scope)).transpose()?,
            headers,
            vars,
            schema,
            contains: resolve_all(&verify.body.contains)?,
            not_contains: resolve_all(&verify.body.not_contains)?,
            matches: resolve_all(&verify.body.matches)?,
            not_matches: resolve_all(&verify.body.not_matches)?,
        })
    }

    fn validate_functions(
        &self,
        verify: &Verify,
        response: &HttpResponse,
        scope: &Vars,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();
        for call in &verify.functions {
            let name = call.name();
            let kwargs = match call.kwargs() {
                Some(kwargs) => match template::resolve_vars(kwargs, scope) {
                    Ok(kwargs) => kwargs,
                    Err(e) => {
                        findings.push(Finding::new(
                            CheckKind::Function,
                            name,
                            format!("Arguments of function '{name}' could not be resolved: {e}"),
                        ));
                        continue;
                    }
                },
                None => Vars::new(),
            };
            match self.registry.call_verify(name, response, &kwargs) {
                Ok(true) => {}
                Ok(false) => findings.push(Finding::new(
                    CheckKind::Function,
                    name,
                    format!("Function '{name}' verification failed"),
                )),
                Err(e) => findings.push(Finding::new(
                    CheckKind::Function,
                    name,
                    format!("Error calling user function '{name}': {e}"),
                )),
            }
        }
        findings
    }

    fn validate_schema(&self, response: &HttpResponse, schema: &ResolvedSchema) -> Vec<Finding> {
        let schema = match schema {
            ResolvedSchema::Inline(value) => value.clone(),
            ResolvedSchema::File(path) => match load_schema(path) {
                Ok(value) => value,
                Err(message) => {
                    return vec![Finding::new(CheckKind::Body, "schema", message)];
                }
            },
        };
        let Some(body) = response.json() else {
            return vec![Finding::new(
                CheckKind::Body,
                "schema",
                "Body schema validation failed: response body is not valid JSON",
            )];
        };
        match self.schemas.validate(&body, &schema) {
            Ok(errors) => errors
                .into_iter()
                .map(|e| {
                    Finding::new(
                        CheckKind::Body,
                        "schema",
                        format!("Body schema validation failed: {e}"),
                    )
                })
                .collect(),
            Err(e) => vec![Finding::new(
                CheckKind::Body,
                "schema",
                format!("Invalid body validation schema: {e}"),
            )],
        }
    }
}

fn load_schema(path: &Path) -> Result<Value, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Error reading body schema file '{}': {e}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("Error parsing body schema file '{}': {e}", path.display()))
}

/// JSON equality where numbers compare by value, so `1 == 1.0`.
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if x == y {
                return true;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| json_eq(v, other)))
        }
        _ => a == b,
    }
}

fn validate_headers(response: &HttpResponse, expected: &BTreeMap<String, String>) -> Vec<Finding> {
    let mut findings = Vec::new();

    for (name, value) in expected {
        match response.header(name) {
            Some(actual) if actual == value => {}
            Some(actual) => findings.push(Finding::new(
                CheckKind::Header,
                name,
                format!("Header '{name}' doesn't match: expected '{value}', got '{actual}'"),
            )),
            None => findings.push(Finding::new(
                CheckKind::Header,
                name,
                format!("Header '{name}' is missing from the response"),
            )),
        }
    }

    findings
}

fn validate_vars(scope: &Vars, expected: &BTreeMap<String, Value>) -> Vec<Finding> {
    let mut findings = Vec::new();

    for (name, value) in expected {
        match scope.get(name) {
            Some(actual) if json_eq(actual, value) => {}
            Some(actual) => findings.push(Finding::new(
                CheckKind::Var,
                name,
                format!("Variable '{name}' doesn't match: expected {value}, got {actual}"),
            )),
            None => findings.push(Finding::new(
                CheckKind::Var,
                name,
                format!("Variable '{name}' not found in data context"),
            )),
        }
    }

    findings
}

fn validate_contains(body: &str, texts: &[String]) -> Vec<Finding> {
    texts
        .iter()
        .filter(|text| !body.contains(text.as_str()))
        .map(|text| {
            Finding::new(
                CheckKind::Body,
                "contains",
                format!("Body doesn't contain '{text}'"),
            )
        })
        .collect()
}

fn validate_not_contains(body: &str, texts: &[String]) -> Vec<Finding> {
    texts
        .iter()
        .filter(|text| body.contains(text.as_str()))
        .map(|text| {
            Finding::new(
                CheckKind::Body,
                "not_contains",
                format!("Body contains '{text}' while it shouldn't"),
            )
        })
        .collect()
}

fn validate_matches(body: &str, patterns: &[String], should_match: bool) -> Vec<Finding> {
    let subject = if should_match { "matches" } else { "not_matches" };
    let mut findings = Vec::new();

    for pattern in patterns {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(body) == should_match => {}
            Ok(_) if should_match => findings.push(Finding::new(
                CheckKind::Body,
                subject,
                format!("Body doesn't match '{pattern}'"),
            )),
            Ok(_) => findings.push(Finding::new(
                CheckKind::Body,
                subject,
                format!("Body matches '{pattern}' while it shouldn't"),
            )),
            Err(e) => findings.push(Finding::new(
                CheckKind::Body,
                subject,
                format!("Invalid regular expression '{pattern}': {e}"),
            )),
        }
    }

    findings
}
