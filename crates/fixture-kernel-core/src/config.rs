use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::KernelError;

fn default_deactivate_missing() -> bool {
    true
}

fn default_added_review_threshold() -> usize {
    3
}

fn default_source() -> String {
    "import".to_string()
}

/// Engine-wide tunables. Every field has a default, so an empty document is valid.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct KernelConfig {
    #[serde(default = "default_deactivate_missing")]
    pub deactivate_missing: bool,
    /// `positions_added` needs review once more than this many positions appear at once.
    #[serde(default = "default_added_review_threshold")]
    pub added_review_threshold: usize,
    #[serde(default = "default_source")]
    pub default_source: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            deactivate_missing: default_deactivate_missing(),
            added_review_threshold: default_added_review_threshold(),
            default_source: default_source(),
        }
    }
}

impl KernelConfig {
    /// # Errors
    /// Returns [`KernelError::Config`] when the YAML is malformed or fails validation.
    pub fn from_yaml_str(raw: &str) -> Result<Self, KernelError> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| KernelError::Config(format!("invalid YAML config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`KernelError::Config`] when the JSON is malformed or fails validation.
    pub fn from_json_str(raw: &str) -> Result<Self, KernelError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| KernelError::Config(format!("invalid JSON config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`KernelError::Config`] when `default_source` is blank.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.default_source.trim().is_empty() {
            return Err(KernelError::Config("default_source MUST be non-empty".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            deactivate_missing: self.deactivate_missing,
            source: self.default_source.clone(),
            uploaded_at: None,
        }
    }
}

/// Per-call knobs for one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileOptions {
    pub deactivate_missing: bool,
    /// Provenance label stamped on every record touched by the run.
    pub source: String,
    /// When the source file was uploaded; defaults to the run's clock time.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub uploaded_at: Option<OffsetDateTime>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        KernelConfig::default().reconcile_options()
    }
}

impl ReconcileOptions {
    #[must_use]
    pub fn keep_missing(mut self) -> Self {
        self.deactivate_missing = false;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_document_yields_defaults() {
        let config = match KernelConfig::from_yaml_str("{}") {
            Ok(config) => config,
            Err(err) => panic!("empty config should parse: {err}"),
        };
        assert_eq!(config, KernelConfig::default());
        assert!(config.deactivate_missing);
        assert_eq!(config.added_review_threshold, 3);
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let raw = "deactivate_missing: false\nadded_review_threshold: 10\n";
        let config = match KernelConfig::from_yaml_str(raw) {
            Ok(config) => config,
            Err(err) => panic!("config should parse: {err}"),
        };
        assert!(!config.deactivate_missing);
        assert_eq!(config.added_review_threshold, 10);
        assert_eq!(config.default_source, "import");
        assert!(!config.reconcile_options().deactivate_missing);
    }

    #[test]
    fn json_rejects_blank_source() {
        let err = match KernelConfig::from_json_str(r#"{"default_source": "  "}"#) {
            Ok(config) => panic!("expected validation failure, got {config:?}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("default_source MUST be non-empty"));
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let err = match KernelConfig::from_yaml_str("added_review_threshold: [1, 2") {
            Ok(config) => panic!("expected parse failure, got {config:?}"),
            Err(err) => err,
        };
        assert!(matches!(err, KernelError::Config(_)));
    }
}
