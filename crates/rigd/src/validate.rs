//! Static validation of a scenario plan.
//!
//! Runs on submission and before the first execution round. No scheduling
//! proceeds until the whole plan passes; every error names the offending
//! action.

use std::collections::BTreeMap;

use rig_core::types::{Action, ActionType};
use rig_core::validation::qualified_name_errors;

use crate::expressions::{validate_alert_expr, validate_state_expr, AlertExprError, ExprError};
use crate::template::{Scheme, TemplateError, TemplateResolver};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("action [{action}] has no supported action type")]
    UnsupportedAction { action: String },
    #[error("action [{action}] of type [{expected}] is missing its spec, or carries a spec for another type")]
    SpecMismatch { action: String, expected: &'static str },
    #[error("invalid action name [{action}]: {reason}")]
    UnqualifiedName { action: String, reason: String },
    #[error("duplicate action [{action}]")]
    DuplicateAction { action: String },
    #[error("invalid dependency: action [{action}] depends on undefined [{dependency}]")]
    UnknownDependency { action: String, dependency: String },
    #[error("delete action [{action}] cannot have an assertion")]
    AssertOnDelete { action: String },
    #[error("invalid state expression for action [{action}]: {source}")]
    InvalidStateExpr {
        action: String,
        #[source]
        source: ExprError,
    },
    #[error("invalid metrics expression for action [{action}]: {source}")]
    InvalidMetricsExpr {
        action: String,
        #[source]
        source: AlertExprError,
    },
    #[error("template reference error for action [{action}]: {source}")]
    Template {
        action: String,
        #[source]
        source: TemplateError,
    },
    #[error("job [{target}] of delete action [{action}] does not exist")]
    UnknownDeleteTarget { action: String, target: String },
    #[error("cycle deletion: job [{target}] of delete action [{action}] is itself a deletion job")]
    DeleteOfDelete { action: String, target: String },
}

/// Validate a plan against the identifier grammar, the dependency graph,
/// assertion syntax, template references, and delete-cycle safety.
pub fn validate_plan(
    namespace: &str,
    actions: &[Action],
    templates: &dyn TemplateResolver,
) -> Result<(), PlanError> {
    let mut index: BTreeMap<&str, &Action> = BTreeMap::new();

    for action in actions {
        if action.action.is_none() {
            return Err(PlanError::UnsupportedAction {
                action: action.name.clone(),
            });
        }

        if !action.has_matching_spec() || action.embedded_spec_count() != 1 {
            return Err(PlanError::SpecMismatch {
                action: action.name.clone(),
                expected: action.action.map(|a| a.as_str()).unwrap_or("unknown"),
            });
        }

        // Action names seed child object names, so they must qualify.
        let name_errors = qualified_name_errors(&action.name);
        if !name_errors.is_empty() {
            return Err(PlanError::UnqualifiedName {
                action: action.name.clone(),
                reason: name_errors.join("; "),
            });
        }

        if index.insert(action.name.as_str(), action).is_some() {
            return Err(PlanError::DuplicateAction {
                action: action.name.clone(),
            });
        }
    }

    for action in actions {
        if let Some(deps) = action.depends.as_ref() {
            for dependency in deps.success.iter().chain(deps.running.iter()) {
                if !index.contains_key(dependency.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        action: action.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        if let Some(assert) = action.assert.as_ref() {
            if !assert.is_zero() {
                if action.action == Some(ActionType::Delete) {
                    return Err(PlanError::AssertOnDelete {
                        action: action.name.clone(),
                    });
                }

                if let Some(expr) = assert.state.as_deref() {
                    validate_state_expr(expr).map_err(|source| PlanError::InvalidStateExpr {
                        action: action.name.clone(),
                        source,
                    })?;
                }

                if let Some(expr) = assert.metrics.as_deref() {
                    validate_alert_expr(expr).map_err(|source| {
                        PlanError::InvalidMetricsExpr {
                            action: action.name.clone(),
                            source,
                        }
                    })?;
                }
            }
        }

        if let Some(template) = action.template_ref() {
            let mut inputs = template.inputs.clone();
            // List generators validate against their first input set.
            let cartesian = action
                .cluster
                .as_ref()
                .map(|c| c.inputs.as_slice())
                .or_else(|| action.cascade.as_ref().map(|c| c.inputs.as_slice()))
                .unwrap_or(&[]);
            if let Some(first) = cartesian.first() {
                inputs.extend(first.clone());
            }

            let scheme = Scheme {
                scenario: namespace.to_string(),
                instance: action.name.clone(),
                inputs,
            };
            templates
                .resolve(namespace, &template.name, &scheme)
                .map_err(|source| PlanError::Template {
                    action: action.name.clone(),
                    source,
                })?;
        }

        if let Some(delete) = action.delete.as_ref().filter(|_| action.action == Some(ActionType::Delete)) {
            for target in &delete.jobs {
                let Some(target_action) = index.get(target.as_str()) else {
                    return Err(PlanError::UnknownDeleteTarget {
                        action: action.name.clone(),
                        target: target.clone(),
                    });
                };

                if target_action.action == Some(ActionType::Delete) {
                    return Err(PlanError::DeleteOfDelete {
                        action: action.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{TemplateCatalog, TemplateDef};
    use rig_core::types::{
        AssertSpec, ClusterSpec, DeleteSpec, ServiceSpec, TemplateRef, VirtualObjectSpec, WaitSpec,
    };

    fn catalog() -> TemplateCatalog {
        let mut catalog = TemplateCatalog::new();
        catalog.insert("app/server", TemplateDef::new(r#"{"image": "server"}"#));
        catalog.insert(
            "app/worker",
            TemplateDef::new(r#"{"image": "worker:{{ .inputs.tag }}"}"#),
        );
        catalog
    }

    fn service(name: &str) -> Action {
        Action {
            name: name.to_string(),
            action: Some(ActionType::Service),
            service: Some(ServiceSpec {
                from_template: TemplateRef::new("app/server"),
            }),
            ..Action::default()
        }
    }

    fn delete(name: &str, jobs: &[&str]) -> Action {
        Action {
            name: name.to_string(),
            action: Some(ActionType::Delete),
            delete: Some(DeleteSpec {
                jobs: jobs.iter().map(|j| j.to_string()).collect(),
            }),
            ..Action::default()
        }
    }

    #[test]
    fn a_clean_plan_validates() {
        let mut chain = service("second");
        chain.depends = Some(WaitSpec {
            running: vec!["first".to_string()],
            ..WaitSpec::default()
        });
        let actions = vec![service("first"), chain, delete("cleanup", &["first"])];
        assert!(validate_plan("demo", &actions, &catalog()).is_ok());
    }

    #[test]
    fn missing_action_type_is_rejected() {
        let action = Action {
            name: "boot".to_string(),
            ..Action::default()
        };
        assert!(matches!(
            validate_plan("demo", &[action], &catalog()),
            Err(PlanError::UnsupportedAction { action }) if action == "boot"
        ));
    }

    #[test]
    fn spec_must_match_the_declared_type() {
        let mut action = service("boot");
        action.action = Some(ActionType::Chaos);
        assert!(matches!(
            validate_plan("demo", &[action], &catalog()),
            Err(PlanError::SpecMismatch { .. })
        ));

        let mut two_specs = service("boot");
        two_specs.virtual_object = Some(VirtualObjectSpec::default());
        assert!(matches!(
            validate_plan("demo", &[two_specs], &catalog()),
            Err(PlanError::SpecMismatch { .. })
        ));
    }

    #[test]
    fn unqualified_names_are_rejected() {
        let action = service("-bad-");
        assert!(matches!(
            validate_plan("demo", &[action], &catalog()),
            Err(PlanError::UnqualifiedName { .. })
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let actions = vec![service("boot"), service("boot")];
        assert!(matches!(
            validate_plan("demo", &actions, &catalog()),
            Err(PlanError::DuplicateAction { action }) if action == "boot"
        ));
    }

    #[test]
    fn dependencies_must_resolve() {
        let mut action = service("boot");
        action.depends = Some(WaitSpec {
            success: vec!["ghost".to_string()],
            ..WaitSpec::default()
        });
        assert!(matches!(
            validate_plan("demo", &[action], &catalog()),
            Err(PlanError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn assertions_on_delete_are_rejected() {
        let mut action = delete("cleanup", &[]);
        action.assert = Some(AssertSpec {
            state: Some("failed() == 0".to_string()),
            metrics: None,
        });
        // Give the delete a resolvable target set.
        let actions = vec![service("boot"), {
            let mut d = action;
            d.delete = Some(DeleteSpec {
                jobs: vec!["boot".to_string()],
            });
            d
        }];
        assert!(matches!(
            validate_plan("demo", &actions, &catalog()),
            Err(PlanError::AssertOnDelete { .. })
        ));
    }

    #[test]
    fn malformed_assertions_fail_at_parse_time() {
        let mut action = service("boot");
        action.assert = Some(AssertSpec {
            state: Some("bogus() == 1".to_string()),
            metrics: None,
        });
        assert!(matches!(
            validate_plan("demo", &[action], &catalog()),
            Err(PlanError::InvalidStateExpr { .. })
        ));

        let mut action = service("boot");
        action.assert = Some(AssertSpec {
            state: None,
            metrics: Some("garbage".to_string()),
        });
        assert!(matches!(
            validate_plan("demo", &[action], &catalog()),
            Err(PlanError::InvalidMetricsExpr { .. })
        ));
    }

    #[test]
    fn template_references_must_resolve() {
        let mut action = service("boot");
        action.service = Some(ServiceSpec {
            from_template: TemplateRef::new("app/ghost"),
        });
        assert!(matches!(
            validate_plan("demo", &[action], &catalog()),
            Err(PlanError::Template { .. })
        ));
    }

    #[test]
    fn cluster_templates_validate_with_their_first_input_set() {
        let mut inputs = std::collections::BTreeMap::new();
        inputs.insert("tag".to_string(), "v1".to_string());
        let action = Action {
            name: "workers".to_string(),
            action: Some(ActionType::Cluster),
            cluster: Some(ClusterSpec {
                from_template: TemplateRef::new("app/worker"),
                inputs: vec![inputs],
                ..ClusterSpec::default()
            }),
            ..Action::default()
        };
        assert!(validate_plan("demo", &[action], &catalog()).is_ok());

        // Without inputs the worker template placeholder cannot resolve.
        let bare = Action {
            name: "workers".to_string(),
            action: Some(ActionType::Cluster),
            cluster: Some(ClusterSpec {
                from_template: TemplateRef::new("app/worker"),
                ..ClusterSpec::default()
            }),
            ..Action::default()
        };
        assert!(matches!(
            validate_plan("demo", &[bare], &catalog()),
            Err(PlanError::Template { .. })
        ));
    }

    #[test]
    fn delete_targets_must_exist_and_not_be_deletes() {
        let actions = vec![service("boot"), delete("cleanup", &["ghost"])];
        assert!(matches!(
            validate_plan("demo", &actions, &catalog()),
            Err(PlanError::UnknownDeleteTarget { target, .. }) if target == "ghost"
        ));

        let actions = vec![
            service("boot"),
            delete("d1", &["boot"]),
            delete("d2", &["d1"]),
        ];
        assert!(matches!(
            validate_plan("demo", &actions, &catalog()),
            Err(PlanError::DeleteOfDelete { action, target })
                if action == "d2" && target == "d1"
        ));
    }

    #[test]
    fn mutual_delete_cycle_is_rejected_with_the_target_named() {
        // D1 deletes D2 and D2 deletes D1; the first offending pair wins.
        let actions = vec![delete("d1", &["d2"]), delete("d2", &["d1"])];
        let err = validate_plan("demo", &actions, &catalog()).unwrap_err();
        assert!(matches!(
            err,
            PlanError::DeleteOfDelete { ref target, .. } if target == "d2"
        ));
    }
}
