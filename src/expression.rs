//! CEL-based evaluation of the expressions embedded in `{{ ... }}`
//! templates.

use cel::{Context, ExecutionError, Program};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::TemplateError;
use crate::model::Vars;

/// Evaluate a CEL expression against the variable scope and convert
/// the result back to JSON.
pub fn evaluate(expr: &str, vars: &Vars) -> Result<Value, TemplateError> {
    let program = compile(expr)?;
    let context = build_context(expr, vars)?;
    let result = program
        .execute(&context)
        .map_err(|e| execution_error(expr, e))?;

    cel_to_json(expr, &result)
}

/// Names of the variables an expression reads, sorted.
pub fn references(expr: &str) -> Result<Vec<String>, TemplateError> {
    let program = compile(expr)?;
    let mut names: Vec<String> = program
        .references()
        .variables()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Pre-process an expression to support function aliases.
///
/// Conversions:
/// - `len(x)` → `size(x)`
/// - `type(x)` → `type_of(x)` (avoid CEL keyword clash)
fn preprocess_expr(expr: &str) -> String {
    use regex::Regex;
    use std::sync::LazyLock;

    static LEN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\blen\(").expect("failed to compile len regex")
    });

    static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\btype\(")
            .expect("failed to compile type regex")
    });

    let result = LEN_RE.replace_all(expr.trim(), "size(").into_owned();
    TYPE_RE.replace_all(&result, "type_of(").into_owned()
}

fn compile(expr: &str) -> Result<Program, TemplateError> {
    let processed = preprocess_expr(expr);
    if processed.is_empty() {
        return Err(TemplateError::EmptyExpression(expr.to_string()));
    }
    debug!("Compiling CEL expression: {processed}");
    Program::compile(&processed).map_err(|e| {
        TemplateError::InvalidExpression {
            expr: expr.trim().to_string(),
            message: e.to_string(),
        }
    })
}

fn build_context<'a>(
    expr: &str,
    vars: &Vars,
) -> Result<Context<'a>, TemplateError> {
    let mut context = Context::default();

    for (key, value) in vars {
        context
            .add_variable(key.as_str(), value.clone())
            .map_err(|e| TemplateError::InvalidExpression {
                expr: expr.trim().to_string(),
                message: format!(
                    "variable '{key}' cannot be used in expressions: {e}"
                ),
            })?;
    }

    register_custom_functions(&mut context);

    Ok(context)
}

fn register_custom_functions(context: &mut Context<'_>) {
    // compare(a, b) - deep equality check returning bool
    context.add_function(
        "compare",
        |a: cel::Value, b: cel::Value| -> bool { a == b },
    );

    // type_of(x) - type name as string
    context.add_function(
        "type_of",
        |v: cel::Value| -> Arc<String> {
            let t = match v {
                cel::Value::Int(_) => "int",
                cel::Value::UInt(_) => "uint",
                cel::Value::Float(_) => "double",
                cel::Value::String(_) => "string",
                cel::Value::Bool(_) => "bool",
                cel::Value::List(_) => "list",
                cel::Value::Map(_) => "map",
                cel::Value::Null => "null",
                cel::Value::Bytes(_) => "bytes",
                _ => "unknown",
            };
            Arc::new(t.to_string())
        },
    );

    // urlencode(str) - URL-encode a string
    context.add_function(
        "urlencode",
        |s: Arc<String>| -> Arc<String> {
            Arc::new(
                url::form_urlencoded::byte_serialize(s.as_bytes())
                    .collect::<String>(),
            )
        },
    );
}

fn execution_error(expr: &str, err: ExecutionError) -> TemplateError {
    let expr = expr.trim().to_string();
    match err {
        ExecutionError::UndeclaredReference(name) => {
            TemplateError::UndefinedVariable {
                name: name.to_string(),
                expr,
            }
        }
        ExecutionError::NoSuchKey(key) => TemplateError::UndefinedVariable {
            name: key.to_string(),
            expr,
        },
        other => TemplateError::InvalidExpression {
            expr,
            message: other.to_string(),
        },
    }
}

fn cel_to_json(expr: &str, value: &cel::Value) -> Result<Value, TemplateError> {
    value.json().map_err(|e| TemplateError::InvalidExpression {
        expr: expr.trim().to_string(),
        message: format!("result cannot be converted to JSON: {e}"),
    })
}
