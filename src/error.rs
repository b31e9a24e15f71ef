//! Error taxonomy for scenario loading, stage execution and user
//! functions.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::model::Finding;

/// Fatal problems detected before any stage runs.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid syntax in {format} source: {message}")]
    InvalidSyntax {
        format: &'static str,
        message: String,
    },

    #[error("Invalid scenario structure: {0}")]
    InvalidStructure(String),

    #[error("{}", .0.join("; "))]
    ConflictingNames(Vec<String>),

    #[error("Fixture '{0}' is required but was not supplied")]
    MissingFixture(String),
}

/// Failure to turn a template into a concrete value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("Undefined variable '{name}' in '{{{{ {expr} }}}}'")]
    UndefinedVariable { name: String, expr: String },

    #[error("Invalid expression '{expr}': {message}")]
    InvalidExpression { expr: String, message: String },

    #[error("Empty template expression in '{0}'")]
    EmptyExpression(String),

    #[error("'{0}' is neither a literal nor a complete template expression")]
    NotAnExpression(String),

    #[error("Expression '{expr}' produced {actual}, expected {expected}")]
    TypeMismatch {
        expr: String,
        expected: &'static str,
        actual: String,
    },
}

/// The kind a user function is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Verify,
    Save,
    Auth,
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionKind::Verify => "verify",
            FunctionKind::Save => "save",
            FunctionKind::Auth => "auth",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum UserFunctionError {
    #[error("Invalid function name format: '{0}'")]
    InvalidName(String),

    #[error("Function '{0}' not found in registry")]
    NotFound(String),

    #[error("'{name}' is a {actual} function and cannot be called as a {expected} function")]
    NotCallable {
        name: String,
        expected: FunctionKind,
        actual: FunctionKind,
    },

    #[error("Error calling function '{name}': {source}")]
    Call {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised by a [`crate::transport::Transport`].
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP connection error: {0}")]
    Connect(String),

    #[error("HTTP request timed out after {0:?}")]
    Timeout(Duration),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("File not found for upload: {}", .path.display())]
    UploadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request failed: {0}")]
    Request(String),
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Path '{path}' for variable '{var}' matched nothing")]
    NoMatch { var: String, path: String },

    #[error("Invalid save path '{path}' for variable '{var}': {message}")]
    InvalidPath {
        var: String,
        path: String,
        message: String,
    },

    #[error("Path for variable '{var}' could not be resolved: {source}")]
    Path {
        var: String,
        #[source]
        source: TemplateError,
    },

    #[error("Arguments of save function '{name}' could not be resolved: {source}")]
    Kwargs {
        name: String,
        #[source]
        source: TemplateError,
    },

    #[error("Save function failed: {0}")]
    Function(#[from] UserFunctionError),
}

/// Terminal error of a single stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Stage '{stage}': {source}")]
    Template {
        stage: String,
        #[source]
        source: TemplateError,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    UserFunction(#[from] UserFunctionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{}", join_messages(.0))]
    Extraction(Vec<ExtractionError>),

    #[error("Verification failed: {}", join_messages(.0))]
    Verification(Vec<Finding>),
}

impl StageError {
    pub fn template(stage: &str, source: TemplateError) -> Self {
        StageError::Template {
            stage: stage.to_string(),
            source,
        }
    }
}

/// Errors that prevent a scenario from starting at all.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Scenario vars could not be resolved: {0}")]
    Template(#[from] TemplateError),

    #[error("Session authentication failed: {0}")]
    Auth(#[from] UserFunctionError),
}

fn join_messages<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckKind;

    #[test]
    fn test_template_error_names_expression() {
        let err = TemplateError::UndefinedVariable {
            name: "user_id".into(),
            expr: "user_id".into(),
        };
        assert_eq!(
            err.to_string(),
            "Undefined variable 'user_id' in '{{ user_id }}'"
        );
    }

    #[test]
    fn test_verification_lists_every_finding() {
        let err = StageError::Verification(vec![
            Finding::new(CheckKind::Status, "status", "expected 200, got 500"),
            Finding::new(
                CheckKind::Var,
                "user_name",
                "Variable 'user_name' doesn't match: expected \"bob\", got \"alice\"",
            ),
        ]);
        let message = err.to_string();
        assert!(message.contains("expected 200, got 500"));
        assert!(message.contains("user_name"));
    }

    #[test]
    fn test_conflicts_are_joined() {
        let err = ConfigurationError::ConflictingNames(vec![
            "Conflicting fixtures and vars: a".into(),
            "Conflicting fixtures and vars: b".into(),
        ]);
        assert_eq!(
            err.to_string(),
            "Conflicting fixtures and vars: a; Conflicting fixtures and vars: b"
        );
    }
}
