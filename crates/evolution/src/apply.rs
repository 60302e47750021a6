//! Applying suggestions to a policy and persisting the result.

use policy::{Capability, Policy, Scope, ScopeField};
use std::path::Path;
use tracing::info;

use crate::suggest::{PolicySuggestion, SuggestionKind};
use crate::EvolutionError;

/// Apply a suggestion to a policy, returning the mutated copy.
///
/// The input policy is never modified; the result is revalidated against the
/// schema and an invalid result aborts the evolution step.
///
/// # Errors
///
/// Returns [`EvolutionError::InvalidResult`] when the mutated policy fails
/// validation.
pub fn apply_policy_change(
    policy: &Policy,
    suggestion: &PolicySuggestion,
) -> Result<Policy, EvolutionError> {
    let mut next = policy.clone();

    match &suggestion.kind {
        SuggestionKind::AddCapability { tool, scope } => {
            next.capabilities.push(Capability {
                tool: tool.clone(),
                scope: scope.clone(),
            });
        }
        SuggestionKind::WidenScope { tool, field, add } => {
            match next.capabilities.iter_mut().find(|c| &c.tool == tool) {
                Some(cap) => union_append(scope_list_mut(&mut cap.scope, *field), add),
                None => {
                    // No capability to widen; fall back to adding one with
                    // just the requested field populated.
                    let mut scope = Scope::default();
                    union_append(scope_list_mut(&mut scope, *field), add);
                    next.capabilities.push(Capability {
                        tool: tool.clone(),
                        scope,
                    });
                }
            }
        }
        SuggestionKind::RemoveForbidden { pattern } => {
            next.forbidden.retain(|f| &f.pattern != pattern);
        }
    }

    next.normalize();
    next.validate().map_err(EvolutionError::InvalidResult)?;
    info!(suggestion = %suggestion.describe(), "policy change applied");
    Ok(next)
}

fn scope_list_mut(scope: &mut Scope, field: ScopeField) -> &mut Option<Vec<String>> {
    match field {
        ScopeField::Paths => &mut scope.paths,
        ScopeField::Binaries => &mut scope.binaries,
        ScopeField::Domains => &mut scope.domains,
        ScopeField::Methods => &mut scope.methods,
        ScopeField::Repos => &mut scope.repos,
    }
}

/// Append new values, preserving existing order and skipping duplicates.
fn union_append(list: &mut Option<Vec<String>>, add: &[String]) {
    let target = list.get_or_insert_with(Vec::new);
    for value in add {
        if !target.iter().any(|v| v == value) {
            target.push(value.clone());
        }
    }
}

/// Serialize a policy to YAML and write it atomically (temp file + rename),
/// creating missing parent directories.
///
/// # Errors
///
/// Returns [`EvolutionError::Yaml`] or [`EvolutionError::Io`].
pub fn write_policy_to_file(policy: &Policy, path: impl AsRef<Path>) -> Result<(), EvolutionError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let yaml = serde_yaml::to_string(policy)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml)?;
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), "policy persisted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suggest::suggest_policy_change;
    use policy::DenialReason;
    use serde_json::json;
    use warden_core::{ActionRequest, Verdict};

    fn base_policy() -> Policy {
        Policy::from_yaml_str(
            r#"
name: p
capabilities:
  - tool: "file:read"
    scope:
      paths: ["/data/**"]
forbidden:
  - pattern: "**/.env"
"#,
        )
        .unwrap()
    }

    #[test]
    fn widen_scope_unions_without_duplicates() {
        let p = base_policy();
        let s = PolicySuggestion {
            kind: SuggestionKind::WidenScope {
                tool: "file:read".into(),
                field: ScopeField::Paths,
                add: vec!["/data/**".into(), "/etc/hosts".into()],
            },
        };
        let next = apply_policy_change(&p, &s).unwrap();
        assert_eq!(
            next.capabilities[0].scope.paths.as_deref().unwrap(),
            &["/data/**".to_string(), "/etc/hosts".to_string()]
        );
    }

    #[test]
    fn widen_scope_falls_back_to_add_capability() {
        let p = base_policy();
        let s = PolicySuggestion {
            kind: SuggestionKind::WidenScope {
                tool: "git:push".into(),
                field: ScopeField::Repos,
                add: vec!["org/*".into()],
            },
        };
        let next = apply_policy_change(&p, &s).unwrap();
        let cap = next.capability_for("git:push").unwrap();
        assert_eq!(cap.scope.repos.as_deref().unwrap(), &["org/*".to_string()]);
    }

    #[test]
    fn remove_forbidden_removes_every_match() {
        let p = base_policy();
        let s = PolicySuggestion {
            kind: SuggestionKind::RemoveForbidden {
                pattern: "**/.env".into(),
            },
        };
        let next = apply_policy_change(&p, &s).unwrap();
        assert!(next.forbidden.is_empty());
    }

    #[test]
    fn original_policy_is_untouched() {
        let p = base_policy();
        let s = PolicySuggestion {
            kind: SuggestionKind::RemoveForbidden {
                pattern: "**/.env".into(),
            },
        };
        let _ = apply_policy_change(&p, &s).unwrap();
        assert_eq!(p.forbidden.len(), 1);
    }

    #[test]
    fn applied_suggestion_allows_the_denied_action() {
        // add-to-policy round trip: deny -> suggest -> apply -> allow.
        let p = base_policy();
        let action = ActionRequest::new("file:write", json!({"path": "/data/out/r.txt"}));
        let eval = policy::evaluate(&action, &p, None, 0);
        assert_eq!(eval.verdict, Verdict::Deny);

        let suggestion = suggest_policy_change(&action, &eval.reasons, &p).unwrap();
        let next = apply_policy_change(&p, &suggestion).unwrap();
        let eval = policy::evaluate(&action, &next, None, 0);
        assert_eq!(eval.verdict, Verdict::Allow);
    }

    #[test]
    fn widen_suggestion_allows_the_denied_action() {
        let p = base_policy();
        let action = ActionRequest::new("file:read", json!({"path": "/etc/hosts"}));
        let eval = policy::evaluate(&action, &p, None, 0);
        assert_eq!(eval.verdict, Verdict::Deny);
        let reasons: Vec<DenialReason> = eval.reasons.clone();

        let suggestion = suggest_policy_change(&action, &reasons, &p).unwrap();
        let next = apply_policy_change(&p, &suggestion).unwrap();
        assert_eq!(policy::evaluate(&action, &next, None, 0).verdict, Verdict::Allow);
    }

    #[test]
    fn persisted_policy_reparses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/policy.yaml");
        let p = base_policy();
        write_policy_to_file(&p, &path).unwrap();
        let back = Policy::load(&path).unwrap();
        assert_eq!(back, p);
    }
}
