//! Scenario data model and execution results.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::TemplateError;
use crate::template;

/// Ordered variable mapping used for seed vars, kwargs and scopes.
pub type Vars = Map<String, Value>;

/// An ordered chain of stages sharing one variable context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name. Loaders fall back to the file stem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Fixture names the host must supply for every stage.
    #[serde(default)]
    pub fixtures: Vec<String>,
    /// Host-level marks (skip, xfail, ...). Carried, not interpreted.
    #[serde(default)]
    pub marks: Vec<String>,
    /// Seed variables, resolved in order at run start.
    #[serde(default)]
    pub vars: Vars,
    /// Session-level TLS defaults.
    #[serde(default)]
    pub ssl: Option<SslConfig>,
    /// Session-level authentication.
    #[serde(default)]
    pub auth: Option<UserFunctionCall>,
    pub stages: Vec<Stage>,
}

/// One HTTP request/response step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fixtures: Vec<String>,
    #[serde(default)]
    pub marks: Vec<String>,
    /// Stage seed variables; later entries may reference earlier ones.
    #[serde(default)]
    pub vars: Vars,
    /// Run this stage even after an earlier stage failed.
    #[serde(default)]
    pub always_run: Templated<bool>,
    pub request: Request,
    #[serde(default)]
    pub save: Option<Save>,
    #[serde(default)]
    pub verify: Option<Verify>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    #[serde(default)]
    pub method: Templated<HttpMethod>,
    #[serde(default)]
    pub params: Vars,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<RequestBody>,
    /// Timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: Templated<f64>,
    #[serde(default = "default_allow_redirects")]
    pub allow_redirects: Templated<bool>,
    #[serde(default)]
    pub ssl: Option<SslConfig>,
    #[serde(default)]
    pub auth: Option<UserFunctionCall>,
}

fn default_timeout() -> Templated<f64> {
    Templated::Literal(30.0)
}

fn default_allow_redirects() -> Templated<bool> {
    Templated::Literal(true)
}

/// Request body. Exactly one kind is active per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestBody {
    Json(Value),
    Xml(String),
    Form(Vars),
    Raw(String),
    /// Multipart upload: field name -> file path.
    Files(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(format!("unsupported HTTP method '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for HttpMethod {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A field that accepts either a literal or a full template
/// expression such as `"{{ timeout }}"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Templated<T> {
    Literal(T),
    Expression(String),
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Templated<T> {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        if let Value::String(text) = &raw {
            if template::complete_expression(text).is_some() {
                return Ok(Templated::Expression(text.clone()));
            }
        }
        serde_json::from_value(raw.clone())
            .map(Templated::Literal)
            .map_err(|e| {
                serde::de::Error::custom(format!(
                    "expected a {} or a '{{{{ expression }}}}' template, \
                     got {raw}: {e}",
                    short_type_name::<T>()
                ))
            })
    }
}

impl<T: Default> Default for Templated<T> {
    fn default() -> Self {
        Templated::Literal(T::default())
    }
}

impl<T: DeserializeOwned + Clone> Templated<T> {
    /// Resolve against `vars`, keeping the literal's native type.
    pub fn resolve(&self, vars: &Vars) -> Result<T, TemplateError> {
        match self {
            Templated::Literal(value) => Ok(value.clone()),
            Templated::Expression(text) => {
                let value = template::resolve_full(text, vars)?;
                serde_json::from_value(value.clone()).map_err(|_| {
                    TemplateError::TypeMismatch {
                        expr: text.clone(),
                        expected: short_type_name::<T>(),
                        actual: value.to_string(),
                    }
                })
            }
        }
    }
}

impl<T> Templated<T> {
    pub fn expression(&self) -> Option<&str> {
        match self {
            Templated::Literal(_) => None,
            Templated::Expression(text) => Some(text),
        }
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// TLS settings. Unset fields fall back to the session, then to the
/// defaults (verification on, no client certificate).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub verify: Option<SslVerify>,
    #[serde(default)]
    pub cert: Option<ClientCert>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SslVerify {
    Enabled(bool),
    /// Path to a CA bundle, or a template resolving to a bool or path.
    CaBundle(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientCert {
    /// `[cert_path, key_path]`
    Pair(String, String),
    /// Single PEM file holding certificate and key.
    Pem(String),
}

/// Reference to a host-registered user function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserFunctionCall {
    Name(String),
    WithKwargs {
        function: String,
        #[serde(default)]
        kwargs: Vars,
    },
}

impl UserFunctionCall {
    pub fn name(&self) -> &str {
        match self {
            UserFunctionCall::Name(name) => name,
            UserFunctionCall::WithKwargs { function, .. } => function,
        }
    }

    pub fn kwargs(&self) -> Option<&Vars> {
        match self {
            UserFunctionCall::Name(_) => None,
            UserFunctionCall::WithKwargs { kwargs, .. } => Some(kwargs),
        }
    }
}

impl fmt::Display for UserFunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Extraction rules: path-based first, then functions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Save {
    /// Variable name -> path expression over the response.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub functions: Vec<UserFunctionCall>,
}

/// Response assertions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verify {
    #[serde(default)]
    pub status: Option<Templated<u16>>,
    /// Expected header values; names match case-insensitively.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Expected values of context variables after `save` ran.
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub functions: Vec<UserFunctionCall>,
    #[serde(default)]
    pub body: BodyVerify,
}

impl Verify {
    /// `true` when no assertion family is populated.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.headers.is_empty()
            && self.vars.is_empty()
            && self.functions.is_empty()
            && self.body.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyVerify {
    #[serde(default)]
    pub schema: Option<SchemaSource>,
    #[serde(default)]
    pub contains: Vec<String>,
    #[serde(default)]
    pub not_contains: Vec<String>,
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub not_matches: Vec<String>,
}

impl BodyVerify {
    pub fn is_empty(&self) -> bool {
        self.schema.is_none()
            && self.contains.is_empty()
            && self.not_contains.is_empty()
            && self.matches.is_empty()
            && self.not_matches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaSource {
    Inline(Map<String, Value>),
    File(String),
}

impl Scenario {
    /// Deserialize a scenario from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Deserialize a scenario from a YAML string.
    ///
    /// The document goes through `serde_json::Value` so that body and
    /// function variants use the same map-based shape as JSON.
    pub fn from_yaml(yaml: &str) -> Result<Self, anyhow::Error> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize the scenario to a YAML string.
    pub fn to_yaml(&self) -> Result<String, anyhow::Error> {
        let value = serde_json::to_value(self)?;
        Ok(serde_yaml::to_string(&value)?)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("scenario")
    }

    /// Every fixture/variable name collision in the scenario.
    ///
    /// Fixtures of the scenario and of every stage are checked against
    /// the scenario seed vars and every path-saved variable. A stage's
    /// seed vars are checked against the fixtures visible to that stage.
    pub fn fixture_conflicts(&self) -> Vec<String> {
        let mut conflicts = Vec::new();
        let scenario_fixtures: BTreeSet<&str> =
            self.fixtures.iter().map(String::as_str).collect();
        let all_fixtures: BTreeSet<&str> = scenario_fixtures
            .iter()
            .copied()
            .chain(
                self.stages
                    .iter()
                    .flat_map(|s| s.fixtures.iter().map(String::as_str)),
            )
            .collect();

        let clash = intersect(&all_fixtures, self.vars.keys());
        if !clash.is_empty() {
            conflicts.push(format!(
                "Conflicting fixtures and vars: {} (scenario vars)",
                clash.join(", ")
            ));
        }

        for stage in &self.stages {
            let visible: BTreeSet<&str> = scenario_fixtures
                .iter()
                .copied()
                .chain(stage.fixtures.iter().map(String::as_str))
                .collect();
            let clash = intersect(&visible, stage.vars.keys());
            if !clash.is_empty() {
                conflicts.push(format!(
                    "Conflicting fixtures and vars: {} (stage '{}' vars)",
                    clash.join(", "),
                    stage.name
                ));
            }

            if let Some(save) = &stage.save {
                let clash = intersect(&all_fixtures, save.vars.keys());
                if !clash.is_empty() {
                    conflicts.push(format!(
                        "Conflicting fixtures and vars: {} (saved by stage '{}')",
                        clash.join(", "),
                        stage.name
                    ));
                }
            }
        }

        conflicts
    }
}

fn intersect<'a, I>(fixtures: &BTreeSet<&str>, names: I) -> Vec<&'a str>
where
    I: Iterator<Item = &'a String>,
{
    names
        .map(String::as_str)
        .filter(|name| fixtures.contains(name))
        .collect()
}

// ── Results ─────────────────────────────────────────────

/// Stage execution phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Pending,
    Resolving,
    Dispatched,
    Extracting,
    Verifying,
    Completed,
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StagePhase::Pending => "pending",
            StagePhase::Resolving => "resolving",
            StagePhase::Dispatched => "dispatched",
            StagePhase::Extracting => "extracting",
            StagePhase::Verifying => "verifying",
            StagePhase::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Assertion family a finding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Status,
    Header,
    Var,
    Function,
    Body,
}

/// One failed assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub check: CheckKind,
    /// What was checked: header name, variable name, function name...
    pub subject: String,
    pub message: String,
}

impl Finding {
    pub fn new(
        check: CheckKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            check,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Passed,
    Failed {
        phase: StagePhase,
        message: String,
        #[serde(default)]
        findings: Vec<Finding>,
    },
    Skipped {
        reason: String,
    },
}

/// Result of a single stage within a scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub outcome: StageOutcome,
    pub request: Option<RequestInfo>,
    pub response: Option<ResponseInfo>,
    /// Variables produced by this stage's `save` block.
    #[serde(default)]
    pub saved: Vars,
    pub duration_ms: u64,
}

impl StageResult {
    pub fn skipped(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            outcome: StageOutcome::Skipped {
                reason: reason.into(),
            },
            request: None,
            response: None,
            saved: Vars::new(),
            duration_ms: 0,
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self.outcome, StageOutcome::Passed)
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, StageOutcome::Failed { .. })
    }

    pub fn skipped_reason(&self) -> Option<&str> {
        match &self.outcome {
            StageOutcome::Skipped { reason } => Some(reason),
            _ => None,
        }
    }

    /// Error message of a failed stage.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            StageOutcome::Failed { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn findings(&self) -> &[Finding] {
        match &self.outcome {
            StageOutcome::Failed { findings, .. } => findings,
            _ => &[],
        }
    }
}

/// Result of running one scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub success: bool,
    pub stages: Vec<StageResult>,
    /// Variable context as committed when the run ended.
    #[serde(default)]
    pub variables: Vars,
    pub duration_ms: u64,
}

impl ScenarioResult {
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn failed_stages(&self) -> impl Iterator<Item = &StageResult> {
        self.stages.iter().filter(|s| s.failed())
    }
}

/// Captured request as it was dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// Captured response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario(value: Value) -> Scenario {
        serde_json::from_value(value).expect("valid scenario")
    }

    #[test]
    fn test_request_defaults() {
        let s = scenario(json!({
            "stages": [{"name": "s", "request": {"url": "http://x"}}]
        }));
        let request = &s.stages[0].request;
        assert_eq!(request.method, Templated::Literal(HttpMethod::Get));
        assert_eq!(request.timeout, Templated::Literal(30.0));
        assert_eq!(request.allow_redirects, Templated::Literal(true));
        assert_eq!(s.stages[0].always_run, Templated::Literal(false));
        assert!(request.body.is_none());
    }

    #[test]
    fn test_templated_fields_accept_expressions() {
        let s = scenario(json!({
            "stages": [{
                "name": "s",
                "always_run": "{{ cleanup }}",
                "request": {
                    "url": "http://x",
                    "method": "{{ verb }}",
                    "timeout": "{{ t }}",
                    "allow_redirects": false
                },
                "verify": {"status": "{{ expected }}"}
            }]
        }));
        let stage = &s.stages[0];
        assert_eq!(stage.always_run.expression(), Some("{{ cleanup }}"));
        assert_eq!(stage.request.method.expression(), Some("{{ verb }}"));
        assert_eq!(stage.request.timeout.expression(), Some("{{ t }}"));
        assert_eq!(
            stage.request.allow_redirects,
            Templated::Literal(false)
        );
        let status = stage.verify.as_ref().unwrap().status.as_ref();
        assert_eq!(
            status.and_then(Templated::expression),
            Some("{{ expected }}")
        );
    }

    #[test]
    fn test_method_is_case_insensitive() {
        let s = scenario(json!({
            "stages": [{"name": "s", "request": {"url": "u", "method": "post"}}]
        }));
        assert_eq!(
            s.stages[0].request.method,
            Templated::Literal(HttpMethod::Post)
        );
    }

    #[test]
    fn test_templated_resolution_preserves_type() {
        let mut vars = Vars::new();
        vars.insert("t".into(), json!(2.5));
        vars.insert("verb".into(), json!("delete"));
        let timeout: Templated<f64> =
            Templated::Expression("{{ t }}".into());
        assert_eq!(timeout.resolve(&vars).unwrap(), 2.5);
        let method: Templated<HttpMethod> =
            Templated::Expression("{{ verb }}".into());
        assert_eq!(method.resolve(&vars).unwrap(), HttpMethod::Delete);

        let flag: Templated<bool> = Templated::Expression("{{ t }}".into());
        assert!(matches!(
            flag.resolve(&vars),
            Err(TemplateError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_body_variants() {
        let s = scenario(json!({
            "stages": [
                {"name": "a", "request": {"url": "u", "body": {"json": {"k": 1}}}},
                {"name": "b", "request": {"url": "u", "body": {"xml": "<a/>"}}},
                {"name": "c", "request": {"url": "u", "body": {"form": {"k": "v"}}}},
                {"name": "d", "request": {"url": "u", "body": {"raw": "text"}}},
                {"name": "e", "request": {"url": "u", "body": {"files": {"f": "a.txt"}}}}
            ]
        }));
        let bodies: Vec<_> = s
            .stages
            .iter()
            .map(|st| st.request.body.clone().unwrap())
            .collect();
        assert_eq!(bodies[0], RequestBody::Json(json!({"k": 1})));
        assert_eq!(bodies[1], RequestBody::Xml("<a/>".into()));
        assert!(matches!(bodies[2], RequestBody::Form(_)));
        assert_eq!(bodies[3], RequestBody::Raw("text".into()));
        assert!(matches!(bodies[4], RequestBody::Files(_)));
    }

    #[test]
    fn test_ssl_and_auth_shapes() {
        let s = scenario(json!({
            "ssl": {"verify": false, "cert": ["c.pem", "k.pem"]},
            "auth": {"function": "httpchain:bearer_auth", "kwargs": {"token": "t"}},
            "stages": [{
                "name": "s",
                "request": {
                    "url": "u",
                    "ssl": {"verify": "/etc/ca.pem", "cert": "both.pem"},
                    "auth": "conftest:login"
                }
            }]
        }));
        let ssl = s.ssl.as_ref().unwrap();
        assert_eq!(ssl.verify, Some(SslVerify::Enabled(false)));
        assert_eq!(
            ssl.cert,
            Some(ClientCert::Pair("c.pem".into(), "k.pem".into()))
        );
        assert_eq!(s.auth.as_ref().unwrap().name(), "httpchain:bearer_auth");

        let request = &s.stages[0].request;
        let ssl = request.ssl.as_ref().unwrap();
        assert_eq!(ssl.verify, Some(SslVerify::CaBundle("/etc/ca.pem".into())));
        assert_eq!(ssl.cert, Some(ClientCert::Pem("both.pem".into())));
        assert_eq!(
            request.auth,
            Some(UserFunctionCall::Name("conftest:login".into()))
        );
    }

    #[test]
    fn test_verify_emptiness() {
        assert!(Verify::default().is_empty());
        let verify = Verify {
            body: BodyVerify {
                contains: vec!["x".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!verify.is_empty());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let s = scenario(json!({
            "flavour": "extra",
            "stages": [{"name": "s", "request": {"url": "u"}, "note": 1}]
        }));
        assert_eq!(s.stages.len(), 1);
    }

    #[test]
    fn test_fixture_conflicts() {
        let s = scenario(json!({
            "fixtures": ["server"],
            "vars": {"server": "x"},
            "stages": [
                {
                    "name": "one",
                    "fixtures": ["token"],
                    "vars": {"token": 1},
                    "request": {"url": "u"},
                    "save": {"vars": {"server": "id"}}
                },
                {"name": "two", "request": {"url": "u"}}
            ]
        }));
        let conflicts = s.fixture_conflicts();
        assert_eq!(conflicts.len(), 3);
        assert!(conflicts
            .iter()
            .all(|c| c.starts_with("Conflicting fixtures and vars")));
        assert!(conflicts[1].contains("stage 'one'"));
        assert!(conflicts[2].contains("saved by stage 'one'"));
    }

    #[test]
    fn test_no_conflicts_for_disjoint_names() {
        let s = scenario(json!({
            "fixtures": ["server"],
            "vars": {"base": "x"},
            "stages": [{
                "name": "one",
                "request": {"url": "u"},
                "save": {"vars": {"id": "id"}}
            }]
        }));
        assert!(s.fixture_conflicts().is_empty());
    }

    #[test]
    fn test_yaml_round_trip_keeps_stage_order() {
        let yaml = r#"
name: yaml
stages:
  - name: first
    request:
      url: http://example.com/a
      body:
        json:
          id: 1
  - name: second
    request:
      url: http://example.com/b
"#;
        let s = Scenario::from_yaml(yaml).unwrap();
        assert_eq!(s.display_name(), "yaml");
        let names: Vec<_> =
            s.stages.iter().map(|st| st.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(
            s.stages[0].request.body,
            Some(RequestBody::Json(json!({"id": 1})))
        );
        assert!(s.to_yaml().unwrap().contains("second"));
    }

    #[test]
    fn test_templated_rejects_bare_strings() {
        for (field, value) in [
            ("method", json!("PSOT")),
            ("timeout", json!("soon")),
            ("allow_redirects", json!("yes")),
        ] {
            let mut request = json!({"url": "u"});
            request[field] = value;
            let parsed: Result<Scenario, _> = serde_json::from_value(json!({
                "stages": [{"name": "s", "request": request}]
            }));
            assert!(parsed.is_err(), "{field} should be rejected");
        }

        let parsed: Result<Scenario, _> = serde_json::from_value(json!({
            "stages": [{"name": "s", "always_run": "yes", "request": {"url": "u"}}]
        }));
        assert!(parsed.is_err());

        let err = serde_json::from_value::<Verify>(json!({"status": "ok"}))
            .unwrap_err();
        assert!(err.to_string().contains("template"), "{err}");
    }
}
