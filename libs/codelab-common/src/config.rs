// Grader configuration shared by the engine, the API and the CLI
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Isolation strategy for the sandboxed executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Interpreter with the full built-in set
    #[default]
    Standard,
    /// Tighter resource ceilings and no blocking built-ins
    Restricted,
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxMode::Standard => write!(f, "standard"),
            SandboxMode::Restricted => write!(f, "restricted"),
        }
    }
}

impl FromStr for SandboxMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" | "direct" => Ok(SandboxMode::Standard),
            "restricted" | "isolated" => Ok(SandboxMode::Restricted),
            other => Err(format!("unknown sandbox mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Overall ceiling for one evaluation call
    pub timeout_ms: u64,
    /// Ceiling for a single sandboxed run
    pub max_execution_time_ms: u64,
    pub enable_type_checking: bool,
    pub enable_console_capture: bool,
    pub sandbox_mode: SandboxMode,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_execution_time_ms: 5_000,
            enable_type_checking: true,
            enable_console_capture: true,
            sandbox_mode: SandboxMode::Standard,
        }
    }
}

/// Lesson-level overrides; absent fields keep the base value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
    #[serde(default)]
    pub enable_type_checking: Option<bool>,
    #[serde(default)]
    pub enable_console_capture: Option<bool>,
    #[serde(default)]
    pub sandbox_mode: Option<SandboxMode>,
}

impl GraderConfig {
    pub fn with_overrides(&self, overrides: &ConfigOverrides) -> Self {
        Self {
            timeout_ms: overrides.timeout_ms.unwrap_or(self.timeout_ms),
            max_execution_time_ms: overrides
                .max_execution_time_ms
                .unwrap_or(self.max_execution_time_ms),
            enable_type_checking: overrides
                .enable_type_checking
                .unwrap_or(self.enable_type_checking),
            enable_console_capture: overrides
                .enable_console_capture
                .unwrap_or(self.enable_console_capture),
            sandbox_mode: overrides.sandbox_mode.unwrap_or(self.sandbox_mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: GraderConfig =
            serde_json::from_str(r#"{ "max_execution_time_ms": 250 }"#).unwrap();

        assert_eq!(config.max_execution_time_ms, 250);
        assert_eq!(config.timeout_ms, 10_000);
        assert!(config.enable_type_checking);
        assert_eq!(config.sandbox_mode, SandboxMode::Standard);
    }

    #[test]
    fn test_overrides_only_touch_present_fields() {
        let base = GraderConfig::default();
        let overrides = ConfigOverrides {
            enable_console_capture: Some(false),
            sandbox_mode: Some(SandboxMode::Restricted),
            ..Default::default()
        };

        let merged = base.with_overrides(&overrides);
        assert!(!merged.enable_console_capture);
        assert_eq!(merged.sandbox_mode, SandboxMode::Restricted);
        assert_eq!(merged.max_execution_time_ms, base.max_execution_time_ms);
    }

    #[test]
    fn test_sandbox_mode_parsing() {
        assert_eq!("Restricted".parse::<SandboxMode>(), Ok(SandboxMode::Restricted));
        assert_eq!("direct".parse::<SandboxMode>(), Ok(SandboxMode::Standard));
        assert!("vm".parse::<SandboxMode>().is_err());
    }
}
