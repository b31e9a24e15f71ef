//! Scenario file loading.

use crate::error::ConfigurationError;
use crate::model::Scenario;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Serialization format of a scenario source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Json,
    Yaml,
}

impl SourceFormat {
    /// Format implied by the file extension, if recognised.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(SourceFormat::Json),
            "yaml" | "yml" => Some(SourceFormat::Yaml),
            _ => None,
        }
    }

    /// Guess the format from the content itself.
    pub fn sniff(content: &str) -> Self {
        if content.trim_start().starts_with(['{', '[']) {
            SourceFormat::Json
        } else {
            SourceFormat::Yaml
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SourceFormat::Json => "JSON",
            SourceFormat::Yaml => "YAML",
        }
    }
}

/// Parse a scenario document. Syntax problems and shape problems are
/// reported separately.
pub fn parse_scenario(content: &str, format: SourceFormat) -> Result<Scenario, ConfigurationError> {
    let syntax = |message: String| ConfigurationError::InvalidSyntax {
        format: format.name(),
        message,
    };
    let document: Value = match format {
        SourceFormat::Json => serde_json::from_str(content).map_err(|e| syntax(e.to_string()))?,
        SourceFormat::Yaml => serde_yaml::from_str(content).map_err(|e| syntax(e.to_string()))?,
    };
    serde_json::from_value(document)
        .map_err(|e| ConfigurationError::InvalidStructure(e.to_string()))
}

/// Finds and loads scenario files.
#[derive(Debug)]
pub struct ScenarioLoader {
    pub search_paths: Vec<PathBuf>,
}

impl ScenarioLoader {
    pub fn new() -> Self {
        Self {
            search_paths: vec![PathBuf::from("tests/scenarios")],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single scenario file. The scenario name falls back to the
    /// file stem.
    pub fn load_scenario<P: AsRef<Path>>(&self, path: P) -> Result<Scenario> {
        let path = path.as_ref();
        info!("Loading scenario from {}", path.display());

        if !path.exists() {
            return Err(ConfigurationError::FileNotFound(path.to_path_buf()).into());
        }
        let content = fs::read_to_string(path)
            .map_err(|source| ConfigurationError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let format = SourceFormat::from_path(path).unwrap_or_else(|| SourceFormat::sniff(&content));
        let mut scenario = parse_scenario(&content, format)
            .context(format!("Failed to parse scenario from {}", path.display()))?;

        if scenario.name.is_none() {
            scenario.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }

        debug!("Successfully loaded scenario: {}", scenario.display_name());
        Ok(scenario)
    }

    /// Load every scenario file in `dir`, sorted by file name. Files
    /// that fail to load are logged and skipped.
    pub fn load_scenarios_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<Scenario>> {
        let dir = dir.as_ref();
        info!("Loading scenarios from directory: {}", dir.display());

        let mut paths = Vec::new();
        let entries = fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_scenario_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut scenarios = Vec::new();
        for path in paths {
            match self.load_scenario(&path) {
                Ok(scenario) => scenarios.push(scenario),
                Err(err) => {
                    debug!("Failed to load scenario from {}: {:#}", path.display(), err);
                }
            }
        }

        info!("Loaded {} scenarios from {}", scenarios.len(), dir.display());
        Ok(scenarios)
    }

    /// Load from every search path. A path may be a directory or a
    /// single file.
    pub fn load_all_scenarios(&self) -> Result<Vec<Scenario>> {
        let mut all_scenarios = Vec::new();

        for path in &self.search_paths {
            if path.is_dir() {
                match self.load_scenarios_from_dir(path) {
                    Ok(mut scenarios) => all_scenarios.append(&mut scenarios),
                    Err(err) => {
                        debug!("Failed to load scenarios from {}: {}", path.display(), err);
                    }
                }
            } else if path.is_file() {
                all_scenarios.push(self.load_scenario(path)?);
            }
        }

        info!("Loaded {} scenarios in total", all_scenarios.len());
        Ok(all_scenarios)
    }
}

impl Default for ScenarioLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Return `true` if the file path looks like a scenario file
/// (`.json`, `.yaml` or `.yml`).
pub fn is_scenario_file(path: &Path) -> bool {
    SourceFormat::from_path(path).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_file_extensions() {
        assert!(is_scenario_file(Path::new("test.yaml")));
        assert!(is_scenario_file(Path::new("test.yml")));
        assert!(is_scenario_file(Path::new("dir/nested/foo.json")));
        assert!(!is_scenario_file(Path::new("readme.md")));
        assert!(!is_scenario_file(Path::new("test.txt")));
        assert!(!is_scenario_file(Path::new("no_ext")));
    }

    #[test]
    fn test_sniff() {
        assert_eq!(SourceFormat::sniff("  {\"stages\": []}"), SourceFormat::Json);
        assert_eq!(SourceFormat::sniff("stages: []"), SourceFormat::Yaml);
    }

    #[test]
    fn test_parse_errors_are_classified() {
        assert!(matches!(
            parse_scenario("{", SourceFormat::Json),
            Err(ConfigurationError::InvalidSyntax { format: "JSON", .. })
        ));
        assert!(matches!(
            parse_scenario("stages: [", SourceFormat::Yaml),
            Err(ConfigurationError::InvalidSyntax { format: "YAML", .. })
        ));
        assert!(matches!(
            parse_scenario(r#"{"name": "no stages"}"#, SourceFormat::Json),
            Err(ConfigurationError::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_load_from_dir_with_mixed_formats() {
        let dir = tempdir_with_files(&[
            (
                "a.yaml",
                "name: yaml-test\nstages:\n  - name: s\n    request:\n      url: /t\n",
            ),
            ("b.json", r#"{"stages": [{"name": "s", "request": {"url": "/t"}}]}"#),
            ("c.json", "{\"broken\": "),
            ("d.md", "# Not a scenario\n"),
        ]);

        let loader = ScenarioLoader::new();
        let scenarios = loader.load_scenarios_from_dir(dir.path()).unwrap();

        let names: Vec<&str> = scenarios.iter().map(|s| s.display_name()).collect();
        assert_eq!(names, ["yaml-test", "b"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ScenarioLoader::new().load_scenario("/no/such/file.yaml").unwrap_err();
        assert!(err.to_string().starts_with("File not found"));
    }

    #[test]
    fn test_default_search_path() {
        let loader = ScenarioLoader::new();
        assert_eq!(loader.search_paths, [PathBuf::from("tests/scenarios")]);
    }

    #[test]
    fn test_load_all_from_files_and_dirs() {
        let dir = tempdir_with_files(&[("one.json", r#"{"stages": []}"#)]);
        let single = tempdir_with_files(&[("two.yml", "stages: []\n")]);

        let mut loader = ScenarioLoader::new();
        loader.add_path(dir.path()).add_path(single.path().join("two.yml"));
        let scenarios = loader.load_all_scenarios().unwrap();
        let names: Vec<&str> = scenarios.iter().map(|s| s.display_name()).collect();
        assert_eq!(names, ["one", "two"]);
    }

    fn tempdir_with_files(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }
}
