//! Registry of host-provided user functions referenced by name from
//! scenarios (`verify.functions`, `save.functions`, `auth`).

use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::error::{FunctionKind, UserFunctionError};
use crate::model::Vars;
use crate::transport::{Credentials, HttpResponse, PreparedRequest};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<module>[a-zA-Z_][a-zA-Z0-9_.]*):)?(?P<function>[a-zA-Z_][a-zA-Z0-9_]*)$",
    )
    .expect("failed to compile function name regex")
});

/// Namespace of the built-in auth functions.
pub const BUILTIN_NAMESPACE: &str = "httpchain";

/// Attaches credentials to an outgoing request.
pub trait AuthProvider: Send + Sync + fmt::Debug {
    fn apply(&self, request: &mut PreparedRequest) -> Result<()>;
}

pub type VerifyFn = Arc<dyn Fn(&HttpResponse, &Vars) -> Result<bool> + Send + Sync>;
pub type SaveFn = Arc<dyn Fn(&HttpResponse, &Vars) -> Result<Vars> + Send + Sync>;
pub type AuthFn = Arc<dyn Fn(&Vars) -> Result<Arc<dyn AuthProvider>> + Send + Sync>;

#[derive(Clone)]
pub enum UserFunction {
    Verify(VerifyFn),
    Save(SaveFn),
    Auth(AuthFn),
}

impl UserFunction {
    pub fn kind(&self) -> FunctionKind {
        match self {
            UserFunction::Verify(_) => FunctionKind::Verify,
            UserFunction::Save(_) => FunctionKind::Save,
            UserFunction::Auth(_) => FunctionKind::Auth,
        }
    }
}

/// A parsed `module:function` or bare `function` name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionName<'a> {
    pub module: Option<&'a str>,
    pub function: &'a str,
}

pub fn parse_name(name: &str) -> Result<FunctionName<'_>, UserFunctionError> {
    let caps = NAME_RE
        .captures(name)
        .ok_or_else(|| UserFunctionError::InvalidName(name.to_string()))?;
    let function = caps
        .name("function")
        .map(|m| m.as_str())
        .ok_or_else(|| UserFunctionError::InvalidName(name.to_string()))?;
    Ok(FunctionName {
        module: caps.name("module").map(|m| m.as_str()),
        function,
    })
}

/// Name -> function table. Bare names are looked up in the default
/// namespace first, then as registered.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    default_namespace: Option<String>,
    functions: HashMap<String, UserFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `httpchain:` auth helpers installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_auth(
            format!("{BUILTIN_NAMESPACE}:basic_auth"),
            |kwargs: &Vars| -> Result<Arc<dyn AuthProvider>> {
                Ok(Arc::new(BasicAuth {
                    username: required_str(kwargs, "username")?,
                    password: required_str(kwargs, "password")?,
                }))
            },
        );
        registry.register_auth(
            format!("{BUILTIN_NAMESPACE}:bearer_auth"),
            |kwargs: &Vars| -> Result<Arc<dyn AuthProvider>> {
                Ok(Arc::new(BearerAuth {
                    token: required_str(kwargs, "token")?,
                }))
            },
        );
        registry.register_auth(
            format!("{BUILTIN_NAMESPACE}:header_auth"),
            |kwargs: &Vars| -> Result<Arc<dyn AuthProvider>> {
                Ok(Arc::new(HeaderAuth {
                    name: required_str(kwargs, "name")?,
                    value: required_str(kwargs, "value")?,
                }))
            },
        );
        registry
    }

    /// Namespace tried first for bare names.
    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = Some(namespace.into());
        self
    }

    pub fn register(&mut self, name: impl Into<String>, function: UserFunction) {
        let name = name.into();
        debug!(name = %name, kind = %function.kind(), "Registered user function");
        self.functions.insert(name, function);
    }

    pub fn register_verify<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&HttpResponse, &Vars) -> Result<bool> + Send + Sync + 'static,
    {
        self.register(name, UserFunction::Verify(Arc::new(f)));
    }

    pub fn register_save<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&HttpResponse, &Vars) -> Result<Vars> + Send + Sync + 'static,
    {
        self.register(name, UserFunction::Save(Arc::new(f)));
    }

    pub fn register_auth<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Vars) -> Result<Arc<dyn AuthProvider>> + Send + Sync + 'static,
    {
        self.register(name, UserFunction::Auth(Arc::new(f)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Look up a function by its scenario name.
    pub fn resolve(&self, name: &str) -> Result<&UserFunction, UserFunctionError> {
        let parsed = parse_name(name)?;
        if parsed.module.is_none() {
            if let Some(namespace) = &self.default_namespace {
                let qualified = format!("{namespace}:{}", parsed.function);
                if let Some(function) = self.functions.get(&qualified) {
                    return Ok(function);
                }
            }
        }
        self.functions
            .get(name)
            .ok_or_else(|| UserFunctionError::NotFound(name.to_string()))
    }

    pub fn verify_fn(&self, name: &str) -> Result<VerifyFn, UserFunctionError> {
        match self.resolve(name)? {
            UserFunction::Verify(f) => Ok(f.clone()),
            other => Err(not_callable(name, FunctionKind::Verify, other)),
        }
    }

    pub fn save_fn(&self, name: &str) -> Result<SaveFn, UserFunctionError> {
        match self.resolve(name)? {
            UserFunction::Save(f) => Ok(f.clone()),
            other => Err(not_callable(name, FunctionKind::Save, other)),
        }
    }

    pub fn auth_fn(&self, name: &str) -> Result<AuthFn, UserFunctionError> {
        match self.resolve(name)? {
            UserFunction::Auth(f) => Ok(f.clone()),
            other => Err(not_callable(name, FunctionKind::Auth, other)),
        }
    }

    /// Resolve and call a verify function.
    pub fn call_verify(
        &self,
        name: &str,
        response: &HttpResponse,
        kwargs: &Vars,
    ) -> Result<bool, UserFunctionError> {
        let f = self.verify_fn(name)?;
        f(response, kwargs).map_err(|source| call_error(name, source))
    }

    /// Resolve and call a save function.
    pub fn call_save(
        &self,
        name: &str,
        response: &HttpResponse,
        kwargs: &Vars,
    ) -> Result<Vars, UserFunctionError> {
        let f = self.save_fn(name)?;
        f(response, kwargs).map_err(|source| call_error(name, source))
    }

    /// Resolve and call an auth function.
    pub fn call_auth(
        &self,
        name: &str,
        kwargs: &Vars,
    ) -> Result<Arc<dyn AuthProvider>, UserFunctionError> {
        let f = self.auth_fn(name)?;
        f(kwargs).map_err(|source| call_error(name, source))
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("default_namespace", &self.default_namespace)
            .field("functions", &names)
            .finish()
    }
}

fn not_callable(name: &str, expected: FunctionKind, found: &UserFunction) -> UserFunctionError {
    UserFunctionError::NotCallable {
        name: name.to_string(),
        expected,
        actual: found.kind(),
    }
}

fn call_error(name: &str, source: anyhow::Error) -> UserFunctionError {
    UserFunctionError::Call {
        name: name.to_string(),
        source,
    }
}

fn required_str(kwargs: &Vars, key: &str) -> Result<String> {
    match kwargs.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(anyhow!("missing argument '{key}'")),
        Some(other) => Ok(other.to_string()),
    }
}

#[derive(Debug)]
struct BasicAuth {
    username: String,
    password: String,
}

impl AuthProvider for BasicAuth {
    fn apply(&self, request: &mut PreparedRequest) -> Result<()> {
        request.credentials = Some(Credentials::Basic {
            username: self.username.clone(),
            password: self.password.clone(),
        });
        Ok(())
    }
}

#[derive(Debug)]
struct BearerAuth {
    token: String,
}

impl AuthProvider for BearerAuth {
    fn apply(&self, request: &mut PreparedRequest) -> Result<()> {
        request.credentials = Some(Credentials::Bearer(self.token.clone()));
        Ok(())
    }
}

#[derive(Debug)]
struct HeaderAuth {
    name: String,
    value: String,
}

impl AuthProvider for HeaderAuth {
    fn apply(&self, request: &mut PreparedRequest) -> Result<()> {
        request.headers.insert(self.name.clone(), self.value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HttpMethod;
    use serde_json::json;

    fn kwargs(value: Value) -> Vars {
        match value {
            Value::Object(map) => map,
            _ => Vars::new(),
        }
    }

    #[test]
    fn test_parse_name() {
        let parsed = parse_name("tests.helpers:check_user").unwrap();
        assert_eq!(parsed.module, Some("tests.helpers"));
        assert_eq!(parsed.function, "check_user");

        let parsed = parse_name("check_user").unwrap();
        assert_eq!(parsed.module, None);

        for bad in ["", "1abc", "mod:", "a:b:c", "has space"] {
            assert!(
                matches!(parse_name(bad), Err(UserFunctionError::InvalidName(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_bare_name_prefers_default_namespace() {
        let mut registry = FunctionRegistry::new().with_default_namespace("conftest");
        registry.register_verify("ok", |_: &HttpResponse, _: &Vars| Ok(false));
        registry.register_verify("conftest:ok", |_: &HttpResponse, _: &Vars| Ok(true));

        let response = HttpResponse::new(200);
        assert!(registry.call_verify("ok", &response, &Vars::new()).unwrap());
        assert!(registry.contains("conftest:ok"));
        assert!(!registry.contains("other:ok"));
    }

    #[test]
    fn test_kind_mismatch_is_not_callable() {
        let registry = FunctionRegistry::with_builtins();
        let err = registry
            .call_verify("httpchain:basic_auth", &HttpResponse::new(200), &Vars::new())
            .unwrap_err();
        assert!(matches!(
            err,
            UserFunctionError::NotCallable {
                expected: FunctionKind::Verify,
                actual: FunctionKind::Auth,
                ..
            }
        ));
    }

    #[test]
    fn test_not_found() {
        let registry = FunctionRegistry::new();
        assert!(matches!(
            registry.save_fn("missing"),
            Err(UserFunctionError::NotFound(_))
        ));
    }

    #[test]
    fn test_call_errors_name_the_function() {
        let mut registry = FunctionRegistry::new();
        registry.register_save("boom", |_: &HttpResponse, _: &Vars| {
            Err(anyhow!("exploded"))
        });
        let err = registry
            .call_save("boom", &HttpResponse::new(200), &Vars::new())
            .unwrap_err();
        assert!(err.to_string().contains("'boom'"));
        assert!(err.to_string().contains("exploded"));
    }

    #[test]
    fn test_builtin_auth_providers() {
        let registry = FunctionRegistry::with_builtins();
        let mut request = PreparedRequest::new(HttpMethod::Get, "http://x");

        let basic = registry
            .call_auth(
                "httpchain:basic_auth",
                &kwargs(json!({"username": "u", "password": "p"})),
            )
            .unwrap();
        basic.apply(&mut request).unwrap();
        assert_eq!(
            request.credentials,
            Some(Credentials::Basic {
                username: "u".into(),
                password: "p".into()
            })
        );

        let bearer = registry
            .call_auth("httpchain:bearer_auth", &kwargs(json!({"token": "t"})))
            .unwrap();
        bearer.apply(&mut request).unwrap();
        assert_eq!(request.credentials, Some(Credentials::Bearer("t".into())));

        let header = registry
            .call_auth(
                "httpchain:header_auth",
                &kwargs(json!({"name": "X-Api-Key", "value": "k"})),
            )
            .unwrap();
        header.apply(&mut request).unwrap();
        assert_eq!(request.header("x-api-key"), Some("k"));
    }

    #[test]
    fn test_builtin_auth_requires_arguments() {
        let registry = FunctionRegistry::with_builtins();
        let err = registry
            .call_auth("httpchain:bearer_auth", &Vars::new())
            .unwrap_err();
        assert!(matches!(err, UserFunctionError::Call { .. }));
    }
}
