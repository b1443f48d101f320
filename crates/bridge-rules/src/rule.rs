//! Rule type and matching predicate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted trigger rule
///
/// Watches `entity_id` for state transitions. The optional `from_state`
/// and `to_state` constrain which transitions fire; a rule with neither
/// fires on any real state change of its entity. A `one_shot` rule is
/// removed after its first match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Unique identifier, assigned at creation
    pub id: String,

    /// Entity to monitor (exact match, not a glob)
    pub entity_id: String,

    /// Previous state the transition must come from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,

    /// New state the transition must land on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,

    /// Text delivered when the rule fires
    pub message: String,

    /// Remove the rule after its first match
    pub one_shot: bool,

    /// When the rule was created
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied fields for a new rule
///
/// `id` and `created_at` are assigned by [`RuleStore::add`].
///
/// [`RuleStore::add`]: crate::RuleStore::add
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleInput {
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,
    pub message: String,
    #[serde(default)]
    pub one_shot: bool,
}

impl Rule {
    /// Build a rule from caller input with a fresh id and timestamp
    pub fn from_input(input: RuleInput) -> Self {
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id: input.entity_id,
            from_state: input.from_state,
            to_state: input.to_state,
            message: input.message,
            one_shot: input.one_shot,
            created_at: Utc::now(),
        }
    }

    /// Does this rule fire for the given transition?
    ///
    /// Never matches a no-op transition where `old_state == new_state`,
    /// even if the from/to constraints would nominally allow it.
    pub fn matches(&self, entity_id: &str, old_state: &str, new_state: &str) -> bool {
        if self.entity_id != entity_id {
            return false;
        }
        if old_state == new_state {
            return false;
        }
        if let Some(from) = &self.from_state {
            if from != old_state {
                return false;
            }
        }
        if let Some(to) = &self.to_state {
            if to != new_state {
                return false;
            }
        }
        true
    }

    /// One-line rendering for listing rules to an end user
    pub fn describe(&self) -> String {
        let parts: Vec<String> = [
            self.from_state.as_ref().map(|s| format!("from \"{s}\"")),
            self.to_state.as_ref().map(|s| format!("to \"{s}\"")),
        ]
        .into_iter()
        .flatten()
        .collect();

        let trigger = if parts.is_empty() {
            "any state change".to_string()
        } else {
            parts.join(" -> ")
        };

        let kind = if self.one_shot { "one-shot" } else { "recurring" };

        format!(
            "[{}] {}: {} ({}) - {}",
            self.id, self.entity_id, trigger, kind, self.message
        )
    }
}
