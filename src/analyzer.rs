//! Static scenario analysis: finds problems in a scenario file without
//! sending requests or calling user functions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

use crate::config::{self, SourceFormat};
use crate::error::{ConfigurationError, FunctionKind};
use crate::functions::{self, FunctionRegistry};
use crate::model::{Scenario, Stage, UserFunctionCall, Vars};
use crate::template;

const EXPECTED_EXTENSIONS: &str = "'.json', '.yaml' or '.yml'";

/// Outcome of validating one scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Present once the document parsed into a scenario.
    pub scenario_info: Option<ScenarioInfo>,
}

impl ValidationResult {
    fn error(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![message.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioInfo {
    pub num_stages: usize,
    pub stage_names: Vec<String>,
    pub vars_referenced: BTreeSet<String>,
    pub vars_saved: BTreeSet<String>,
}

/// Validate the scenario file at `path`.
pub fn validate(path: impl AsRef<Path>) -> ValidationResult {
    validate_with(path, &Analyzer::new())
}

/// Validate the scenario file at `path` with a configured analyzer.
pub fn validate_with(path: impl AsRef<Path>, analyzer: &Analyzer<'_>) -> ValidationResult {
    let path = path.as_ref();
    if !path.exists() {
        let missing = ConfigurationError::FileNotFound(path.to_path_buf());
        return ValidationResult::error(missing.to_string());
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(source) => {
            return ValidationResult::error(
                ConfigurationError::Io {
                    path: path.to_path_buf(),
                    source,
                }
                .to_string(),
            )
        }
    };

    let mut warnings = Vec::new();
    let format = match SourceFormat::from_path(path) {
        Some(format) => format,
        None => {
            let extension = path
                .extension()
                .map(|e| format!("'.{}'", e.to_string_lossy()))
                .unwrap_or_else(|| "(none)".to_string());
            warnings.push(format!(
                "File extension {extension} does not match the expected {EXPECTED_EXTENSIONS}"
            ));
            SourceFormat::sniff(&content)
        }
    };

    let scenario = match config::parse_scenario(&content, format) {
        Ok(scenario) => scenario,
        Err(err) => {
            return ValidationResult {
                valid: false,
                errors: vec![err.to_string()],
                warnings,
                scenario_info: None,
            }
        }
    };

    let mut result = analyzer.analyze(&scenario);
    warnings.append(&mut result.warnings);
    result.warnings = warnings;
    result
}

/// Checks a parsed scenario. With a registry attached, function names
/// are resolved against it; without one only their syntax is checked.
#[derive(Debug, Default)]
pub struct Analyzer<'a> {
    registry: Option<&'a FunctionRegistry>,
}

/// Tracks which names are available and which undefined names were
/// already reported.
struct Walk<'s> {
    available: BTreeSet<String>,
    reported: BTreeSet<String>,
    referenced: BTreeSet<String>,
    warnings: &'s mut Vec<String>,
}

impl Walk<'_> {
    fn scan(&mut self, stage: &str, value: &Value, local: &BTreeSet<String>) {
        let (names, errors) = template::value_references(value);
        for err in errors {
            self.warnings.push(format!(
                "Stage '{stage}' has a malformed template expression: {err}"
            ));
        }
        for name in names {
            self.require(stage, &name, local);
        }
    }

    fn require(&mut self, stage: &str, name: &str, local: &BTreeSet<String>) {
        self.referenced.insert(name.to_string());
        if self.available.contains(name) || local.contains(name) {
            return;
        }
        if self.reported.insert(name.to_string()) {
            self.warnings.push(format!(
                "Stage '{stage}' uses undefined variable '{name}'"
            ));
        }
    }
}

impl<'a> Analyzer<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(mut self, registry: &'a FunctionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn analyze(&self, scenario: &Scenario) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let mut seen = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        for stage in &scenario.stages {
            if !seen.insert(stage.name.as_str()) {
                duplicates.insert(stage.name.as_str());
            }
        }
        if !duplicates.is_empty() {
            errors.push(format!(
                "Duplicate stage names: {}",
                duplicates.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
        errors.extend(scenario.fixture_conflicts());

        let mut walk = Walk {
            available: scenario.fixtures.iter().cloned().collect(),
            reported: BTreeSet::new(),
            referenced: BTreeSet::new(),
            warnings: &mut warnings,
        };
        let mut vars_saved = BTreeSet::new();
        let none = BTreeSet::new();

        for (name, value) in &scenario.vars {
            walk.scan("<scenario>", value, &none);
            walk.available.insert(name.clone());
        }
        walk.scan("<scenario>", &to_value(&scenario.ssl), &none);
        if let Some(call) = &scenario.auth {
            self.check_function(&mut walk, "<scenario>", call, FunctionKind::Auth);
            walk.scan("<scenario>", &kwargs_value(call), &none);
        }

        for stage in &scenario.stages {
            self.analyze_stage(stage, &mut walk, &mut vars_saved);
        }

        let referenced = std::mem::take(&mut walk.referenced);
        let info = ScenarioInfo {
            num_stages: scenario.stages.len(),
            stage_names: scenario.stages.iter().map(|s| s.name.clone()).collect(),
            vars_referenced: referenced,
            vars_saved,
        };
        debug!(
            errors = errors.len(),
            warnings = warnings.len(),
            "Analyzed scenario '{}'",
            scenario.display_name()
        );

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
            scenario_info: Some(info),
        }
    }

    fn analyze_stage(&self, stage: &Stage, walk: &mut Walk<'_>, vars_saved: &mut BTreeSet<String>) {
        let name = stage.name.as_str();
        let mut local: BTreeSet<String> = stage.fixtures.iter().cloned().collect();

        for (var, value) in &stage.vars {
            walk.scan(name, value, &local);
            local.insert(var.clone());
        }

        walk.scan(name, &to_value(&stage.always_run), &local);
        walk.scan(name, &to_value(&stage.request), &local);
        if let Some(call) = &stage.request.auth {
            self.check_function(walk, name, call, FunctionKind::Auth);
        }

        if let Some(save) = &stage.save {
            for path in save.vars.values() {
                walk.scan(name, &Value::String(path.clone()), &local);
            }
            for var in save.vars.keys() {
                local.insert(var.clone());
                vars_saved.insert(var.clone());
            }
            for call in &save.functions {
                self.check_function(walk, name, call, FunctionKind::Save);
                walk.scan(name, &kwargs_value(call), &local);
            }
        }

        match &stage.verify {
            Some(verify) if !verify.is_empty() => {
                for var in verify.vars.keys() {
                    walk.require(name, var, &local);
                }
                for call in &verify.functions {
                    self.check_function(walk, name, call, FunctionKind::Verify);
                }
                walk.scan(name, &to_value(verify), &local);
            }
            _ => walk
                .warnings
                .push(format!("Stage '{name}' has no response validation")),
        }

        for var in stage.vars.keys() {
            walk.available.insert(var.clone());
        }
        if let Some(save) = &stage.save {
            walk.available.extend(save.vars.keys().cloned());
        }
    }

    fn check_function(
        &self,
        walk: &mut Walk<'_>,
        stage: &str,
        call: &UserFunctionCall,
        kind: FunctionKind,
    ) {
        let name = call.name();
        let problem = match self.registry {
            Some(registry) => {
                let resolved = match kind {
                    FunctionKind::Verify => registry.verify_fn(name).map(|_| ()),
                    FunctionKind::Save => registry.save_fn(name).map(|_| ()),
                    FunctionKind::Auth => registry.auth_fn(name).map(|_| ()),
                };
                resolved.err()
            }
            None => functions::parse_name(name).err(),
        };
        if let Some(err) = problem {
            walk.warnings
                .push(format!("Stage '{stage}' {kind} function: {err}"));
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn kwargs_value(call: &UserFunctionCall) -> Value {
    Value::Object(call.kwargs().cloned().unwrap_or_else(Vars::new))
}
