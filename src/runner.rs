//! Scenario execution: runs stages in order over one variable context

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::context::VariableContext;
use crate::error::{ConfigurationError, EngineError};
use crate::executor::{SessionDefaults, StageExecutor};
use crate::functions::FunctionRegistry;
use crate::model::{Scenario, ScenarioResult, StageOutcome, StagePhase, StageResult, Vars};
use crate::schema::{JsonSchemaValidator, SchemaValidator};
use crate::template;
use crate::transport::{ReqwestTransport, Transport};

const ABORTED_REASON: &str = "Flow aborted by an earlier failure";

/// Scenario runner trait
#[async_trait]
pub trait ScenarioRunner: Send + Sync {
    /// Execute a scenario with the given host fixture values.
    async fn run(
        &self,
        scenario: &Scenario,
        fixtures: &Vars,
    ) -> Result<ScenarioResult, EngineError>;
}

/// Default scenario runner
pub struct DefaultScenarioRunner {
    transport: Arc<dyn Transport>,
    registry: Arc<FunctionRegistry>,
    schemas: Arc<dyn SchemaValidator>,
    base_dir: PathBuf,
}

impl DefaultScenarioRunner {
    /// Runner with the reqwest transport, built-in functions and the
    /// JSON Schema validator.
    pub fn new() -> Self {
        Self {
            transport: Arc::new(ReqwestTransport::new()),
            registry: Arc::new(FunctionRegistry::with_builtins()),
            schemas: Arc::new(JsonSchemaValidator),
            base_dir: PathBuf::from("."),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_schema_validator(mut self, schemas: Arc<dyn SchemaValidator>) -> Self {
        self.schemas = schemas;
        self
    }

    /// Directory that relative file paths (uploads, schemas,
    /// certificates) are resolved against.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    fn session_defaults(
        &self,
        scenario: &Scenario,
        seed: &Vars,
    ) -> Result<SessionDefaults, EngineError> {
        let auth = match &scenario.auth {
            Some(call) => {
                let kwargs = match call.kwargs() {
                    Some(kwargs) => template::resolve_vars(kwargs, seed)?,
                    None => Vars::new(),
                };
                Some(self.registry.call_auth(call.name(), &kwargs)?)
            }
            None => None,
        };
        Ok(SessionDefaults {
            ssl: scenario.ssl.clone(),
            auth,
        })
    }
}

impl Default for DefaultScenarioRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DefaultScenarioRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultScenarioRunner")
            .field("registry", &self.registry)
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

/// Resolve the scenario seed vars in order, each seeing the scenario
/// fixtures and the vars before it.
fn seed_vars(scenario: &Scenario, fixtures: &Vars) -> Result<(Vars, Vars), EngineError> {
    let mut scope = Vars::new();
    for name in &scenario.fixtures {
        let value = fixtures
            .get(name)
            .ok_or_else(|| ConfigurationError::MissingFixture(name.clone()))?;
        scope.insert(name.clone(), value.clone());
    }

    let mut seed = Vars::new();
    for (name, value) in &scenario.vars {
        let resolved = template::resolve_value(value, &scope)?;
        scope.insert(name.clone(), resolved.clone());
        seed.insert(name.clone(), resolved);
    }
    Ok((seed, scope))
}

#[async_trait]
impl ScenarioRunner for DefaultScenarioRunner {
    #[instrument(skip(self, scenario, fixtures), fields(name = %scenario.display_name()))]
    async fn run(
        &self,
        scenario: &Scenario,
        fixtures: &Vars,
    ) -> Result<ScenarioResult, EngineError> {
        let start_time = Instant::now();

        let conflicts = scenario.fixture_conflicts();
        if !conflicts.is_empty() {
            error!("Scenario has conflicting names: {}", conflicts.join("; "));
            return Err(ConfigurationError::ConflictingNames(conflicts).into());
        }

        let (seed, seed_scope) = seed_vars(scenario, fixtures)?;
        let session = self.session_defaults(scenario, &seed_scope)?;
        let mut ctx = VariableContext::seeded(seed);

        let executor = StageExecutor {
            transport: self.transport.as_ref(),
            registry: self.registry.as_ref(),
            schemas: self.schemas.as_ref(),
            session: &session,
            fixtures,
            scenario_fixtures: &scenario.fixtures,
            base_dir: &self.base_dir,
        };

        info!("Starting scenario: {}", scenario.display_name());

        let mut stage_results: Vec<StageResult> = Vec::new();
        let mut aborted = false;

        for (idx, stage) in scenario.stages.iter().enumerate() {
            info!(
                "Stage {}/{}: {}",
                idx + 1,
                scenario.stages.len(),
                stage.name
            );

            if aborted {
                match executor.always_run(stage, &ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("Skipping stage '{}' after an earlier failure", stage.name);
                        stage_results.push(StageResult::skipped(&stage.name, ABORTED_REASON));
                        continue;
                    }
                    Err(err) => {
                        warn!("Cannot resolve always_run of stage '{}': {}", stage.name, err);
                        stage_results.push(StageResult {
                            name: stage.name.clone(),
                            outcome: StageOutcome::Failed {
                                phase: StagePhase::Resolving,
                                message: err.to_string(),
                                findings: Vec::new(),
                            },
                            request: None,
                            response: None,
                            saved: Vars::new(),
                            duration_ms: 0,
                        });
                        continue;
                    }
                }
            }

            let result = executor.execute(stage, &mut ctx).await;
            if result.failed() {
                aborted = true;
            }
            stage_results.push(result);
        }

        let success = !stage_results.iter().any(StageResult::failed);
        let result = ScenarioResult {
            name: scenario.display_name().to_string(),
            success,
            stages: stage_results,
            variables: ctx.into_vars(),
            duration_ms: start_time.elapsed().as_millis() as u64,
        };

        info!(
            "Scenario finished: {} ({} ms) - Success: {}",
            result.name, result.duration_ms, result.success
        );

        Ok(result)
    }
}
