//! httpchain CLI - runs and validates declarative HTTP scenarios.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use httpchain::{
    analyzer, DefaultScenarioRunner, Scenario, ScenarioLoader, ScenarioResult, ScenarioRunner,
    StageOutcome, Vars,
};
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// httpchain - declarative HTTP scenario runner.
#[derive(Parser, Debug)]
#[command(name = "httpchain", version, about)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scenarios.
    Run(RunArgs),
    /// Statically check a scenario file and print the result as JSON.
    Validate {
        /// Scenario file to check.
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Scenario file or directory path.
    #[arg(short = 'p', long = "path", env = "HTTPCHAIN_PATH")]
    scenario_path: Option<String>,

    /// Filter scenarios by name (partial match).
    #[arg(short = 'f', long = "filter")]
    scenario_filter: Option<String>,

    /// Fixture value as name=JSON (a bare string is accepted too).
    #[arg(long = "fixture", value_parser = parse_fixture)]
    fixtures: Vec<(String, Value)>,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<String>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn parse_fixture(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn truncate(text: &str) -> String {
    if text.chars().count() > 500 {
        format!("{}...(truncated)", text.chars().take(500).collect::<String>())
    } else {
        text.to_string()
    }
}

fn print_scenario_result(result: &ScenarioResult, verbose: bool) {
    let status = if result.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!("{} scenario: {} ({} ms)", status, result.name, result.duration_ms);

    for (i, stage) in result.stages.iter().enumerate() {
        let stage_status = match &stage.outcome {
            StageOutcome::Passed => "\x1b[32m✓\x1b[0m",
            StageOutcome::Failed { .. } => "\x1b[31m✗\x1b[0m",
            StageOutcome::Skipped { .. } => "\x1b[33m-\x1b[0m",
        };
        info!("  {}. {} {} ({} ms)", i + 1, stage_status, stage.name, stage.duration_ms);

        match &stage.outcome {
            StageOutcome::Failed { phase, message, .. } => {
                error!("     \x1b[31mError ({}): {}\x1b[0m", phase, message);
            }
            StageOutcome::Skipped { reason } => info!("     Skipped: {}", reason),
            StageOutcome::Passed => {}
        }

        if verbose {
            if let Some(request) = &stage.request {
                debug!("     Request: {} {}", request.method, request.url);
                if let Some(body) = &request.body {
                    debug!("     Request body: {}", truncate(body));
                }
            }
            if let Some(response) = &stage.response {
                debug!("     Response: Status {}", response.status);
                if let Some(body) = &response.body {
                    debug!("     Response body: {}", truncate(body));
                }
            }
        }
    }
}

fn save_report(
    result: &ScenarioResult,
    report_dir: &Path,
    format: ReportFormat,
) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = result.name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => {
            let filename = format!("{sanitized_name}-{timestamp}.json");
            (filename, serde_json::to_string_pretty(result)?)
        }
        ReportFormat::Yaml => {
            let filename = format!("{sanitized_name}-{timestamp}.yaml");
            (filename, serde_yaml::to_string(&serde_json::to_value(result)?)?)
        }
        ReportFormat::Text => {
            let filename = format!("{sanitized_name}-{timestamp}.txt");
            let mut content = String::new();
            content.push_str(&format!("Scenario: {}\n", result.name));
            content.push_str(&format!(
                "Status: {}\n",
                if result.success { "PASS" } else { "FAIL" }
            ));
            content.push_str(&format!("Duration: {} ms\n\n", result.duration_ms));
            content.push_str("Stages:\n");
            for (i, stage) in result.stages.iter().enumerate() {
                let label = match &stage.outcome {
                    StageOutcome::Passed => "PASS",
                    StageOutcome::Failed { .. } => "FAIL",
                    StageOutcome::Skipped { .. } => "SKIP",
                };
                content.push_str(&format!("  {}. {} ({})\n", i + 1, stage.name, label));
                if let Some(error) = stage.error() {
                    content.push_str(&format!("     Error: {error}\n"));
                }
                content.push_str(&format!("     Duration: {} ms\n", stage.duration_ms));
            }
            (filename, content)
        }
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn load_scenarios(scenario_path: Option<String>) -> Result<(PathBuf, Vec<Scenario>)> {
    let loader = ScenarioLoader::new();

    let Some(path) = scenario_path else {
        let scenarios = loader.load_all_scenarios()?;
        if scenarios.is_empty() {
            return Err(anyhow!("No scenarios found"));
        }
        return Ok((PathBuf::from("."), scenarios));
    };

    let path = PathBuf::from(path);
    if !path.exists() {
        return Err(anyhow!("Path does not exist: {}", path.display()));
    }

    let (base_dir, scenarios) = if path.is_file() {
        let scenario = loader
            .load_scenario(&path)
            .context(format!("Failed to load scenario: {}", path.display()))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        (base_dir, vec![scenario])
    } else {
        let scenarios = loader.load_scenarios_from_dir(&path).context(format!(
            "Failed to load scenarios from directory: {}",
            path.display()
        ))?;
        (path.clone(), scenarios)
    };

    if scenarios.is_empty() {
        return Err(anyhow!("No scenarios found in {}", path.display()));
    }
    Ok((base_dir, scenarios))
}

async fn run_scenarios(args: RunArgs, verbose: bool) -> Result<bool> {
    let (base_dir, scenarios) = load_scenarios(args.scenario_path)?;
    let runner = DefaultScenarioRunner::new().with_base_dir(base_dir);
    let fixtures: Vars = args.fixtures.into_iter().collect();
    let report_dir = args.report_dir.map(PathBuf::from);

    let filtered: Vec<Scenario> = match &args.scenario_filter {
        Some(filter) => scenarios
            .into_iter()
            .filter(|s| s.display_name().to_lowercase().contains(&filter.to_lowercase()))
            .collect(),
        None => scenarios,
    };
    if filtered.is_empty() {
        return Err(anyhow!("No scenarios matching the filter were found"));
    }

    let total = filtered.len();
    let total_start = Instant::now();
    let mut passed = 0;
    let mut failed = 0;
    info!("Running {} scenario(s)...", total);

    for (idx, scenario) in filtered.iter().enumerate() {
        info!("Scenario {}/{}: {}", idx + 1, total, scenario.display_name());
        match runner.run(scenario, &fixtures).await {
            Ok(result) => {
                print_scenario_result(&result, verbose);

                if let Some(dir) = &report_dir {
                    match save_report(&result, dir, args.report_format) {
                        Ok(path) => info!("Report saved: {}", path.display()),
                        Err(e) => error!("Failed to save report: {}", e),
                    }
                }

                if result.success {
                    passed += 1;
                } else {
                    failed += 1;
                }
            }
            Err(e) => {
                error!(
                    "\x1b[31mScenario could not start: {} - {}\x1b[0m",
                    scenario.display_name(),
                    e
                );
                failed += 1;
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  \
         Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    Ok(failed == 0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let success = match cli.command {
        Command::Run(args) => run_scenarios(args, cli.verbose).await?,
        Command::Validate { path } => {
            let result = analyzer::validate(&path);
            println!("{}", serde_json::to_string_pretty(&result)?);
            result.valid
        }
    };

    if !success {
        exit(1);
    }

    Ok(())
}
