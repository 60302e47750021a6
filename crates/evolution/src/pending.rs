//! Pending suggestions awaiting an in-band decision.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use warden_core::ActionRequest;

use crate::suggest::PolicySuggestion;
use crate::EvolutionError;

/// A suggestion bound to the denial that produced it, keyed by a short
/// opaque id handed to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSuggestion {
    /// The proposed edit.
    pub suggestion: PolicySuggestion,
    /// The denied action.
    pub action: ActionRequest,
    /// Session the denial occurred in.
    pub session_id: String,
    /// Creation time, ISO-8601.
    pub created_at: String,
}

/// In-memory store of pending suggestions.
#[derive(Debug, Default)]
pub struct PendingSuggestions {
    entries: DashMap<String, PendingSuggestion>,
}

impl PendingSuggestions {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a suggestion to a fresh 12-character id and return the id.
    pub fn insert(
        &self,
        suggestion: PolicySuggestion,
        action: ActionRequest,
        session_id: &str,
    ) -> String {
        let id = warden_core::ids::suggestion_id();
        self.entries.insert(
            id.clone(),
            PendingSuggestion {
                suggestion,
                action,
                session_id: session_id.to_string(),
                created_at: warden_core::ids::now_iso(),
            },
        );
        id
    }

    /// Remove and return the suggestion bound to `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EvolutionError::UnknownSuggestion`] for an unknown id.
    pub fn take(&self, id: &str) -> Result<PendingSuggestion, EvolutionError> {
        self.entries
            .remove(id)
            .map(|(_, v)| v)
            .ok_or_else(|| EvolutionError::UnknownSuggestion { id: id.to_string() })
    }

    /// Number of suggestions waiting for a decision.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suggest::SuggestionKind;
    use serde_json::json;

    fn suggestion() -> PolicySuggestion {
        PolicySuggestion {
            kind: SuggestionKind::RemoveForbidden {
                pattern: "**/.env".into(),
            },
        }
    }

    #[test]
    fn insert_take_round_trip() {
        let store = PendingSuggestions::new();
        let action = ActionRequest::new("file:read", json!({"path": "/x"}));
        let id = store.insert(suggestion(), action, "sess");
        assert_eq!(id.len(), 12);
        assert_eq!(store.len(), 1);

        let pending = store.take(&id).unwrap();
        assert_eq!(pending.session_id, "sess");
        assert!(store.is_empty());
    }

    #[test]
    fn unknown_id_errors() {
        let store = PendingSuggestions::new();
        assert!(matches!(
            store.take("nope"),
            Err(EvolutionError::UnknownSuggestion { .. })
        ));
    }

    #[test]
    fn take_is_consumed_once() {
        let store = PendingSuggestions::new();
        let id = store.insert(
            suggestion(),
            ActionRequest::new("t", json!({})),
            "s",
        );
        assert!(store.take(&id).is_ok());
        assert!(store.take(&id).is_err());
    }
}
