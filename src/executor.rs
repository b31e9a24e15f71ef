//! Runs one stage: resolve, dispatch, extract, verify, commit.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::context::VariableContext;
use crate::error::{ConfigurationError, StageError, TemplateError, UserFunctionError};
use crate::extract::Extractor;
use crate::functions::{AuthProvider, FunctionRegistry};
use crate::model::{
    ClientCert, RequestBody, RequestInfo, ResponseInfo, SslConfig, SslVerify, Stage,
    StageOutcome, StagePhase, StageResult, Templated, Vars,
};
use crate::schema::SchemaValidator;
use crate::template;
use crate::transport::{
    ClientIdentity, HttpResponse, PreparedBody, PreparedRequest, TlsSettings, Transport,
};
use crate::validator::Verifier;

/// Scenario-level settings applied to every stage unless overridden.
#[derive(Debug, Clone, Default)]
pub struct SessionDefaults {
    pub ssl: Option<SslConfig>,
    pub auth: Option<Arc<dyn AuthProvider>>,
}

/// What a stage got to before it finished, for the result report.
#[derive(Debug)]
struct Trace {
    phase: StagePhase,
    request: Option<RequestInfo>,
    response: Option<ResponseInfo>,
    saved: Vars,
}

/// Executes single stages against a shared [`VariableContext`].
pub struct StageExecutor<'a> {
    pub transport: &'a dyn Transport,
    pub registry: &'a FunctionRegistry,
    pub schemas: &'a dyn SchemaValidator,
    pub session: &'a SessionDefaults,
    /// Fixture values supplied by the host.
    pub fixtures: &'a Vars,
    /// Fixture names requested by the scenario for every stage.
    pub scenario_fixtures: &'a [String],
    pub base_dir: &'a Path,
}

impl<'a> StageExecutor<'a> {
    /// Build the stage scope. Returns the scope together with the
    /// stage's own resolved vars.
    pub fn scope(&self, stage: &Stage, ctx: &VariableContext) -> Result<(Vars, Vars), StageError> {
        let mut scope = ctx.snapshot().clone();

        for name in self.scenario_fixtures.iter().chain(&stage.fixtures) {
            let value = self
                .fixtures
                .get(name)
                .ok_or_else(|| ConfigurationError::MissingFixture(name.clone()))?;
            scope.insert(name.clone(), value.clone());
        }

        let mut stage_vars = Vars::new();
        for (name, value) in &stage.vars {
            let resolved = template::resolve_value(value, &scope)
                .map_err(|e| StageError::template(&stage.name, e))?;
            scope.insert(name.clone(), resolved.clone());
            stage_vars.insert(name.clone(), resolved);
        }

        Ok((scope, stage_vars))
    }

    /// Whether `stage` runs after an earlier failure.
    pub fn always_run(&self, stage: &Stage, ctx: &VariableContext) -> Result<bool, StageError> {
        match &stage.always_run {
            Templated::Literal(flag) => Ok(*flag),
            flag => {
                let (scope, _) = self.scope(stage, ctx)?;
                flag.resolve(&scope)
                    .map_err(|e| StageError::template(&stage.name, e))
            }
        }
    }

    /// Run `stage`. The context changes only when the stage passes.
    pub async fn execute(&self, stage: &Stage, ctx: &mut VariableContext) -> StageResult {
        let started = Instant::now();
        info!("Running stage: {}", stage.name);

        let mut trace = Trace {
            phase: StagePhase::Pending,
            request: None,
            response: None,
            saved: Vars::new(),
        };
        let outcome = match self.run_phases(stage, ctx, &mut trace).await {
            Ok(()) => {
                info!("Stage '{}' passed", stage.name);
                StageOutcome::Passed
            }
            Err(err) => {
                warn!(phase = %trace.phase, "Stage '{}' failed: {}", stage.name, err);
                let findings = match &err {
                    StageError::Verification(findings) => findings.clone(),
                    _ => Vec::new(),
                };
                StageOutcome::Failed {
                    phase: trace.phase,
                    message: err.to_string(),
                    findings,
                }
            }
        };

        StageResult {
            name: stage.name.clone(),
            outcome,
            request: trace.request,
            response: trace.response,
            saved: trace.saved,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run_phases(
        &self,
        stage: &Stage,
        ctx: &mut VariableContext,
        trace: &mut Trace,
    ) -> Result<(), StageError> {
        trace.phase = StagePhase::Resolving;
        let (mut scope, stage_vars) = self.scope(stage, ctx)?;
        let request = self.prepare(stage, &scope)?;
        trace.request = Some(request_info(&request));

        trace.phase = StagePhase::Dispatched;
        debug!(method = %request.method, url = %request.url, "Dispatching request");
        let response = self.transport.send(&request).await?;
        trace.response = Some(response_info(&response));

        trace.phase = StagePhase::Extracting;
        let saved = match &stage.save {
            Some(save) => Extractor::new(self.registry).apply(save, &response, &mut scope)?,
            None => Vars::new(),
        };

        trace.phase = StagePhase::Verifying;
        if let Some(verify) = &stage.verify {
            let findings = Verifier::new(self.registry, self.schemas, self.base_dir)
                .evaluate(verify, &response, &scope)
                .map_err(|e| StageError::template(&stage.name, e))?;
            if !findings.is_empty() {
                return Err(StageError::Verification(findings));
            }
        }

        trace.phase = StagePhase::Completed;
        for (name, value) in &saved {
            debug!("Committing saved variable '{}': {}", name, value);
        }
        ctx.merge(stage_vars);
        ctx.merge(saved.clone());
        trace.saved = saved;
        Ok(())
    }

    /// Resolve the stage's request against its scope.
    pub fn prepare(&self, stage: &Stage, scope: &Vars) -> Result<PreparedRequest, StageError> {
        let spec = &stage.request;
        let tpl = |e: TemplateError| StageError::template(&stage.name, e);

        let method = spec.method.resolve(scope).map_err(tpl)?;
        let url = template::resolve_string(&spec.url, scope).map_err(tpl)?;
        let mut request = PreparedRequest::new(method, url);

        for (name, value) in &spec.headers {
            let value = template::resolve_string(value, scope).map_err(tpl)?;
            request.headers.insert(name.clone(), value);
        }

        let params = template::resolve_vars(&spec.params, scope).map_err(tpl)?;
        request.params = flatten_pairs(&params);

        request.body = match &spec.body {
            None => None,
            Some(RequestBody::Json(value)) => Some(PreparedBody::Json(
                template::resolve_value(value, scope).map_err(tpl)?,
            )),
            Some(RequestBody::Xml(text)) => Some(PreparedBody::Xml(
                template::resolve_string(text, scope).map_err(tpl)?,
            )),
            Some(RequestBody::Form(fields)) => Some(PreparedBody::Form(flatten_pairs(
                &template::resolve_vars(fields, scope).map_err(tpl)?,
            ))),
            Some(RequestBody::Raw(text)) => Some(PreparedBody::Raw(
                template::resolve_string(text, scope).map_err(tpl)?,
            )),
            Some(RequestBody::Files(files)) => {
                let mut resolved = std::collections::BTreeMap::new();
                for (field, path) in files {
                    let path = template::resolve_string(path, scope).map_err(tpl)?;
                    resolved.insert(field.clone(), self.base_dir.join(path));
                }
                Some(PreparedBody::Files(resolved))
            }
        };

        let timeout = spec.timeout.resolve(scope).map_err(tpl)?;
        request.timeout = match Duration::try_from_secs_f64(timeout) {
            Ok(duration) if !duration.is_zero() => duration,
            _ => {
                return Err(StageError::InvalidRequest(format!(
                    "timeout must be a positive number of seconds, got {timeout}"
                )))
            }
        };
        request.allow_redirects = spec.allow_redirects.resolve(scope).map_err(tpl)?;

        let ssl = merge_ssl(self.session.ssl.as_ref(), spec.ssl.as_ref());
        request.tls = self.tls_settings(&ssl, scope).map_err(tpl)?;

        match &spec.auth {
            Some(call) => {
                let kwargs = match call.kwargs() {
                    Some(kwargs) => template::resolve_vars(kwargs, scope).map_err(tpl)?,
                    None => Vars::new(),
                };
                let provider = self.registry.call_auth(call.name(), &kwargs)?;
                apply_auth(provider.as_ref(), call.name(), &mut request)?;
            }
            None => {
                if let Some(provider) = &self.session.auth {
                    apply_auth(provider.as_ref(), "session auth", &mut request)?;
                }
            }
        }

        Ok(request)
    }

    fn tls_settings(&self, ssl: &SslConfig, scope: &Vars) -> Result<TlsSettings, TemplateError> {
        let mut tls = TlsSettings::default();

        match &ssl.verify {
            None => {}
            Some(SslVerify::Enabled(flag)) => tls.verify = *flag,
            Some(SslVerify::CaBundle(text)) => match template::resolve_str(text, scope)? {
                Value::Bool(flag) => tls.verify = flag,
                Value::String(path) => tls.ca_bundle = Some(self.resolve_path(&path)),
                other => {
                    return Err(TemplateError::TypeMismatch {
                        expr: text.clone(),
                        expected: "bool or CA bundle path",
                        actual: other.to_string(),
                    })
                }
            },
        }

        tls.client_cert = match &ssl.cert {
            None => None,
            Some(ClientCert::Pem(path)) => Some(ClientIdentity::Pem(
                self.resolve_path(&template::resolve_string(path, scope)?),
            )),
            Some(ClientCert::Pair(cert, key)) => Some(ClientIdentity::Pair {
                cert: self.resolve_path(&template::resolve_string(cert, scope)?),
                key: self.resolve_path(&template::resolve_string(key, scope)?),
            }),
        };

        Ok(tls)
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        self.base_dir.join(path)
    }
}

/// Stage TLS settings override the session's field by field.
fn merge_ssl(session: Option<&SslConfig>, stage: Option<&SslConfig>) -> SslConfig {
    let session = session.cloned().unwrap_or_default();
    match stage {
        None => session,
        Some(stage) => SslConfig {
            verify: stage.verify.clone().or(session.verify),
            cert: stage.cert.clone().or(session.cert),
        },
    }
}

fn apply_auth(
    provider: &dyn AuthProvider,
    name: &str,
    request: &mut PreparedRequest,
) -> Result<(), StageError> {
    provider.apply(request).map_err(|source| {
        StageError::UserFunction(UserFunctionError::Call {
            name: name.to_string(),
            source,
        })
    })
}

/// Expand a mapping to `(key, value)` pairs: lists repeat the key,
/// nulls are dropped.
fn flatten_pairs(map: &Vars) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items.iter().filter(|item| !item.is_null()) {
                    pairs.push((key.clone(), template::render(item)));
                }
            }
            other => pairs.push((key.clone(), template::render(other))),
        }
    }
    pairs
}

fn request_info(request: &PreparedRequest) -> RequestInfo {
    RequestInfo {
        method: request.method.to_string(),
        url: request.url.clone(),
        headers: request.headers.clone(),
        body: request.body.as_ref().map(PreparedBody::describe),
    }
}

fn response_info(response: &HttpResponse) -> ResponseInfo {
    let body = response.text();
    ResponseInfo {
        status: response.status,
        headers: response.header_map(),
        body: (!body.is_empty()).then_some(body),
        elapsed_ms: response.elapsed.as_millis() as u64,
    }
}
