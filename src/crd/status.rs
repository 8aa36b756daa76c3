//! # Conditions
//!
//! Condition records shared by both resources. Conditions are keyed by type and
//! never duplicated.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition represents a condition of a resource
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False)
    pub status: String,
    /// Last time the status flipped (RFC3339)
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(
        r#type: &str,
        status: bool,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(now.to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Insert or replace the condition with the same type.
///
/// The transition time of an existing condition is kept unless its status flips.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|existing| existing.r#type == condition.r#type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition
                    .last_transition_time
                    .clone_from(&existing.last_transition_time);
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}
