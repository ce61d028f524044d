// Grader configuration loading for the engine host
use anyhow::{bail, Context, Result};
use codelab_common::config::{GraderConfig, SandboxMode};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config/grader.json";

/// Grader configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a grader configuration from a JSON file; absent keys take defaults
    pub fn load(config_path: &Path) -> Result<GraderConfig> {
        if !config_path.exists() {
            bail!("Grader config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: GraderConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        info!(
            path = %config_path.display(),
            sandbox_mode = %config.sandbox_mode,
            max_execution_time_ms = config.max_execution_time_ms,
            "Loaded grader config"
        );
        Ok(config)
    }

    /// Load with default path (config/grader.json), falling back to defaults
    pub fn load_default() -> Result<GraderConfig> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if !default_path.exists() {
            info!("No {} found, using default grader config", DEFAULT_CONFIG_PATH);
            return Ok(GraderConfig::default());
        }
        Self::load(default_path)
    }

    /// Apply CODELAB_* environment overrides on top of `config`
    pub fn apply_env(config: GraderConfig) -> Result<GraderConfig> {
        Self::apply_vars(config, |key| env::var(key).ok())
    }

    fn apply_vars(
        mut config: GraderConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<GraderConfig> {
        if let Some(value) = lookup("CODELAB_TIMEOUT_MS") {
            config.timeout_ms = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid CODELAB_TIMEOUT_MS: {}", value))?;
        }
        if let Some(value) = lookup("CODELAB_MAX_EXECUTION_MS") {
            config.max_execution_time_ms = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid CODELAB_MAX_EXECUTION_MS: {}", value))?;
        }
        if let Some(value) = lookup("CODELAB_TYPE_CHECKING") {
            config.enable_type_checking = parse_flag("CODELAB_TYPE_CHECKING", &value)?;
        }
        if let Some(value) = lookup("CODELAB_CONSOLE_CAPTURE") {
            config.enable_console_capture = parse_flag("CODELAB_CONSOLE_CAPTURE", &value)?;
        }
        if let Some(value) = lookup("CODELAB_SANDBOX_MODE") {
            config.sandbox_mode = value
                .parse::<SandboxMode>()
                .map_err(anyhow::Error::msg)
                .context("Invalid CODELAB_SANDBOX_MODE")?;
        }

        if config.max_execution_time_ms > config.timeout_ms {
            warn!(
                max_execution_time_ms = config.max_execution_time_ms,
                timeout_ms = config.timeout_ms,
                "Execution limit exceeds the overall evaluation timeout"
            );
        }
        Ok(config)
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("Invalid {}: expected a boolean, got {}", name, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = ConfigLoader::load(Path::new("does/not/exist.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_partial_file() {
        let path = env::temp_dir().join(format!("codelab-grader-{}.json", std::process::id()));
        fs::write(&path, r#"{ "sandbox_mode": "restricted", "timeout_ms": 3000 }"#).unwrap();

        let config = ConfigLoader::load(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.sandbox_mode, SandboxMode::Restricted);
        assert_eq!(config.timeout_ms, 3000);
        assert_eq!(config.max_execution_time_ms, 5000);
    }

    #[test]
    fn test_env_overrides() {
        let config = ConfigLoader::apply_vars(
            GraderConfig::default(),
            vars(&[
                ("CODELAB_MAX_EXECUTION_MS", "250"),
                ("CODELAB_CONSOLE_CAPTURE", "off"),
                ("CODELAB_SANDBOX_MODE", "isolated"),
            ]),
        )
        .unwrap();

        assert_eq!(config.max_execution_time_ms, 250);
        assert!(!config.enable_console_capture);
        assert!(config.enable_type_checking);
        assert_eq!(config.sandbox_mode, SandboxMode::Restricted);
    }

    #[test]
    fn test_bad_env_values_are_errors() {
        assert!(ConfigLoader::apply_vars(GraderConfig::default(), vars(&[("CODELAB_TIMEOUT_MS", "soon")])).is_err());
        assert!(ConfigLoader::apply_vars(GraderConfig::default(), vars(&[("CODELAB_TYPE_CHECKING", "maybe")])).is_err());
        assert!(ConfigLoader::apply_vars(GraderConfig::default(), vars(&[("CODELAB_SANDBOX_MODE", "vm")])).is_err());
    }
}
