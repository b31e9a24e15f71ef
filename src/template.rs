//! `{{ expression }}` substitution over strings and JSON trees.
//!
//! A string that is exactly one template (surrounding whitespace
//! allowed) resolves to the expression's native value. Any other
//! string containing templates is rendered to a string with every
//! template replaced by its value's textual form.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::error::TemplateError;
use crate::expression;
use crate::model::Vars;

static TEMPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{(?P<expr>[^}]*?)\}\}")
        .expect("failed to compile template regex")
});

static COMPLETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\{\{(?P<expr>[^}]*?)\}\}\s*$")
        .expect("failed to compile complete template regex")
});

pub fn contains_template(text: &str) -> bool {
    TEMPLATE_RE.is_match(text)
}

/// The inner expression if `text` is a single complete template.
pub fn complete_expression(text: &str) -> Option<&str> {
    COMPLETE_RE
        .captures(text)
        .and_then(|caps| caps.name("expr"))
        .map(|m| m.as_str().trim())
}

/// Every template expression in `text`, trimmed, in order.
pub fn expressions(text: &str) -> Vec<&str> {
    TEMPLATE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.name("expr"))
        .map(|m| m.as_str().trim())
        .collect()
}

/// Resolve a string that must be a single complete template.
pub fn resolve_full(text: &str, vars: &Vars) -> Result<Value, TemplateError> {
    let expr = complete_expression(text)
        .ok_or_else(|| TemplateError::NotAnExpression(text.to_string()))?;
    evaluate(expr, text, vars)
}

/// Resolve one string. Complete templates keep their native type,
/// partial ones render to a string, plain text passes through.
pub fn resolve_str(text: &str, vars: &Vars) -> Result<Value, TemplateError> {
    if let Some(expr) = complete_expression(text) {
        return evaluate(expr, text, vars);
    }
    if contains_template(text) {
        return resolve_partial(text, vars).map(Value::String);
    }
    Ok(Value::String(text.to_string()))
}

/// Resolve a string and force a string result.
pub fn resolve_string(text: &str, vars: &Vars) -> Result<String, TemplateError> {
    resolve_str(text, vars).map(|value| render(&value))
}

/// Resolve every string in a JSON tree. Keys are left untouched.
pub fn resolve_value(value: &Value, vars: &Vars) -> Result<Value, TemplateError> {
    match value {
        Value::String(text) => resolve_str(text, vars),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, vars))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = Vars::new();
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, vars)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Resolve every value of a mapping, in order.
pub fn resolve_vars(map: &Vars, vars: &Vars) -> Result<Vars, TemplateError> {
    let mut resolved = Vars::new();
    for (key, item) in map {
        resolved.insert(key.clone(), resolve_value(item, vars)?);
    }
    Ok(resolved)
}

/// Textual form used when a value is spliced into a larger string.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Variable names referenced by the templates in `text`.
pub fn references(text: &str) -> Result<Vec<String>, TemplateError> {
    let mut names = Vec::new();
    for expr in expressions(text) {
        if expr.is_empty() {
            return Err(TemplateError::EmptyExpression(text.to_string()));
        }
        for name in expression::references(expr)? {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Variable names referenced anywhere in a JSON tree. Malformed
/// expressions are returned as errors alongside the names found.
pub fn value_references(value: &Value) -> (Vec<String>, Vec<TemplateError>) {
    let mut names = Vec::new();
    let mut errors = Vec::new();
    collect_references(value, &mut names, &mut errors);
    (names, errors)
}

fn collect_references(
    value: &Value,
    names: &mut Vec<String>,
    errors: &mut Vec<TemplateError>,
) {
    match value {
        Value::String(text) => match references(text) {
            Ok(found) => {
                for name in found {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
            Err(e) => errors.push(e),
        },
        Value::Array(items) => {
            for item in items {
                collect_references(item, names, errors);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, names, errors);
            }
        }
        _ => {}
    }
}

fn evaluate(expr: &str, text: &str, vars: &Vars) -> Result<Value, TemplateError> {
    if expr.is_empty() {
        return Err(TemplateError::EmptyExpression(text.to_string()));
    }
    expression::evaluate(expr, vars)
}

fn resolve_partial(text: &str, vars: &Vars) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in TEMPLATE_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);
        let expr = caps.name("expr").map_or("", |m| m.as_str().trim());
        out.push_str(&render(&evaluate(expr, text, vars)?));
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}
