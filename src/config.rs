//! Planner Configuration
//!
//! Knobs that apply to every plan built by one arena.

use serde::{Deserialize, Serialize};

use crate::observability::{Logger, Severity};
use crate::plan::{PlanError, PlanResult};

/// Planner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Allow folding plans into their parent (default: true)
    #[serde(default = "default_inlining_enabled")]
    pub inlining_enabled: bool,

    /// Placeholder ceiling per plan (default: 100000)
    #[serde(default = "default_max_placeholders")]
    pub max_placeholders: usize,

    /// Hex characters of the order digest embedded in cursors (default: 10)
    #[serde(default = "default_cursor_digest_length")]
    pub cursor_digest_length: usize,

    /// Minimum log severity (default: "INFO")
    #[serde(default = "default_log_severity")]
    pub log_severity: String,
}

fn default_inlining_enabled() -> bool {
    true
}

fn default_max_placeholders() -> usize {
    100_000
}

fn default_cursor_digest_length() -> usize {
    10
}

fn default_log_severity() -> String {
    "INFO".to_string()
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            inlining_enabled: default_inlining_enabled(),
            max_placeholders: default_max_placeholders(),
            cursor_digest_length: default_cursor_digest_length(),
            log_severity: default_log_severity(),
        }
    }
}

impl PlannerConfig {
    /// Parses a JSON document; missing keys take their defaults
    pub fn from_json_str(json: &str) -> PlanResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PlanError::invalid_config(format!("invalid planner config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Config with inlining switched off
    pub fn without_inlining() -> Self {
        Self {
            inlining_enabled: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> PlanResult<()> {
        if self.max_placeholders == 0 {
            return Err(PlanError::invalid_config("max_placeholders must be positive"));
        }
        if self.cursor_digest_length == 0 || self.cursor_digest_length > 64 {
            return Err(PlanError::invalid_config(
                "cursor_digest_length must be between 1 and 64",
            ));
        }
        self.severity()?;
        Ok(())
    }

    /// Parsed `log_severity`
    pub fn severity(&self) -> PlanResult<Severity> {
        self.log_severity
            .parse::<Severity>()
            .map_err(PlanError::invalid_config)
    }

    /// Installs `log_severity` as the process-wide logging threshold.
    ///
    /// Arenas never do this themselves, so several planners with different
    /// configs can share a process.
    pub fn apply_logging(&self) -> PlanResult<()> {
        Logger::set_min_severity(self.severity()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlannerConfig::default();
        assert!(config.inlining_enabled);
        assert_eq!(config.max_placeholders, 100_000);
        assert_eq!(config.cursor_digest_length, 10);
        assert_eq!(config.severity().unwrap(), Severity::Info);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PlannerConfig::from_json_str(r#"{"inlining_enabled": false}"#).unwrap();
        assert!(!config.inlining_enabled);
        assert_eq!(config.max_placeholders, 100_000);
    }

    #[test]
    fn test_logging_applied_only_on_request() {
        let before = Logger::min_severity();
        let config = PlannerConfig {
            log_severity: "ERROR".to_string(),
            ..Default::default()
        };

        crate::plan::PlanArena::new(config.clone()).unwrap();
        assert_eq!(Logger::min_severity(), before);

        config.apply_logging().unwrap();
        assert_eq!(Logger::min_severity(), Severity::Error);
        Logger::set_min_severity(before);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(PlannerConfig::from_json_str(r#"{"max_placeholders": 0}"#).is_err());
        assert!(PlannerConfig::from_json_str(r#"{"log_severity": "LOUD"}"#).is_err());
        assert!(PlannerConfig::from_json_str("not json").is_err());
    }
}
