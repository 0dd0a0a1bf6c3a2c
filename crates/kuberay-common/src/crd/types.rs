//! Shared types used across CRD definitions

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., HeadPodReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert or replace a condition by type.
///
/// The existing transition time is kept when the status did not change, so
/// re-asserting the same condition on every reconcile is not a status delta.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn same_status_keeps_transition_time() {
        let mut conditions = vec![];
        let mut first = Condition::new("HeadPodReady", ConditionStatus::True, "Ready", "ok");
        first.last_transition_time = Utc::now() - Duration::minutes(5);
        let original_time = first.last_transition_time;
        set_condition(&mut conditions, first);

        set_condition(
            &mut conditions,
            Condition::new("HeadPodReady", ConditionStatus::True, "Ready", "still ok"),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, original_time);
        assert_eq!(conditions[0].message, "still ok");
    }

    #[test]
    fn status_flip_moves_transition_time() {
        let mut conditions = vec![];
        let mut first = Condition::new("HeadPodReady", ConditionStatus::True, "Ready", "ok");
        first.last_transition_time = Utc::now() - Duration::minutes(5);
        let original_time = first.last_transition_time;
        set_condition(&mut conditions, first);

        set_condition(
            &mut conditions,
            Condition::new("HeadPodReady", ConditionStatus::False, "NotReady", "down"),
        );

        assert!(conditions[0].last_transition_time > original_time);
        assert_eq!(conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn remove_and_find_by_type() {
        let mut conditions = vec![
            Condition::new("A", ConditionStatus::True, "r", "m"),
            Condition::new("B", ConditionStatus::False, "r", "m"),
        ];
        remove_condition(&mut conditions, "A");
        assert!(find_condition(&conditions, "A").is_none());
        assert_eq!(
            find_condition(&conditions, "B").map(|c| c.status.clone()),
            Some(ConditionStatus::False)
        );
    }

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let condition = Condition::new("HeadPodReady", ConditionStatus::True, "Ready", "ok");
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "HeadPodReady");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }
}
