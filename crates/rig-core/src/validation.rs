//! Validation helpers for scenario names and controller configuration.

use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;

/// Maximum length of an action name. Action names seed child object names,
/// so they must stay within the usual label budget.
pub const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

/// Checks an action name against the qualified-name grammar: non-empty, at
/// most 63 characters, alphanumeric at both ends, with interior characters
/// drawn from alphanumerics plus `-`, `_`, and `.`.
pub fn qualified_name_errors(name: &str) -> Vec<String> {
    let mut errors = Vec::new();

    if name.is_empty() {
        errors.push("name must not be empty".to_string());
        return errors;
    }

    if name.len() > MAX_NAME_LEN {
        errors.push(format!("name must be at most {MAX_NAME_LEN} characters"));
    }

    let valid_interior = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if let Some(bad) = name.chars().find(|c| !valid_interior(*c)) {
        errors.push(format!("invalid character {bad:?}"));
    }

    let first = name.chars().next().unwrap_or(' ');
    let last = name.chars().next_back().unwrap_or(' ');
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        errors.push("name must start and end with an alphanumeric character".to_string());
    }

    errors
}

pub fn is_qualified_name(name: &str) -> bool {
    qualified_name_errors(name).is_empty()
}

impl Validate for ControllerConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.timeouts.management_call.is_zero() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "timeouts.management_call.zero",
                message: "management call timeout must be greater than zero".to_string(),
            });
        }

        if self.timeouts.finalizer_grace.is_zero() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "timeouts.finalizer_grace.zero",
                message: "finalizer grace window must be greater than zero".to_string(),
            });
        }

        for (code, template) in [
            (
                "telemetry.prometheus_template.empty",
                &self.telemetry.prometheus_template,
            ),
            (
                "telemetry.grafana_template.empty",
                &self.telemetry.grafana_template,
            ),
            (
                "telemetry.dataviewer_template.empty",
                &self.telemetry.dataviewer_template,
            ),
        ] {
            if template.trim().is_empty() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Warning,
                    code,
                    message: "telemetry template is empty; the overlay will be skipped"
                        .to_string(),
                });
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn qualified_names_accept_the_usual_identifiers() {
        for name in ["boot", "workers-3", "app.server", "a", "kill_leader"] {
            assert!(is_qualified_name(name), "expected {name} to qualify");
        }
    }

    #[test]
    fn qualified_names_reject_bad_edges_and_characters() {
        for name in ["", "-boot", "boot-", "a b", "mön", "a/b"] {
            assert!(!is_qualified_name(name), "expected {name} to be rejected");
        }
    }

    #[test]
    fn qualified_names_reject_overlong_identifiers() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert!(!is_qualified_name(&name));
        assert!(is_qualified_name(&"a".repeat(MAX_NAME_LEN)));
    }

    #[test]
    fn controller_config_validation_reports_zero_timeouts() {
        let mut config = ControllerConfig::default();
        config.timeouts.management_call = Duration::ZERO;

        let issues = config.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "timeouts.management_call.zero");
        assert_eq!(issues[0].level, ValidationLevel::Error);
    }

    #[test]
    fn controller_config_validation_warns_on_empty_templates() {
        let mut config = ControllerConfig::default();
        config.telemetry.grafana_template = " ".to_string();

        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|issue| issue.code == "telemetry.grafana_template.empty"
                && issue.level == ValidationLevel::Warning));
    }
}
