//! Declarative HTTP scenario engine.
//!
//! A [`Scenario`] is an ordered chain of HTTP stages sharing one
//! variable context: values saved from one response feed the templates
//! of later requests. [`DefaultScenarioRunner`] executes scenarios and
//! [`analyzer`] checks them statically without touching the network.

pub mod analyzer;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod expression;
pub mod extract;
pub mod functions;
pub mod model;
pub mod runner;
pub mod schema;
pub mod template;
pub mod transport;
pub mod validator;

pub use analyzer::{validate, Analyzer, ScenarioInfo, ValidationResult};
pub use config::ScenarioLoader;
pub use context::VariableContext;
pub use error::*;
pub use functions::{AuthProvider, FunctionRegistry};
pub use model::*;
pub use runner::*;
pub use transport::{HttpResponse, PreparedRequest, ReqwestTransport, Transport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
