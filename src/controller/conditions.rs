//! Condition management helpers following Kubernetes API conventions

use crate::crd::Condition;

/// Standard condition types
pub const CONDITION_TYPE_READY: &str = "Ready";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Update or add a condition to the conditions list
///
/// The transition time of an existing condition is only moved forward when
/// its status changes. Returns true if anything other than the timestamp
/// changed.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        let changed = existing.status != condition.status
            || existing.reason != condition.reason
            || existing.message != condition.message
            || existing.observed_generation != condition.observed_generation;
        if !changed {
            return false;
        }
        if existing.status != condition.status {
            existing.last_transition_time = condition.last_transition_time;
        }
        existing.status = condition.status;
        existing.reason = condition.reason;
        existing.message = condition.message;
        existing.observed_generation = condition.observed_generation;
        true
    } else {
        conditions.push(condition);
        true
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Remove a condition by type, returning whether one was present
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        assert!(set_condition(
            &mut conditions,
            Condition::ready(true, "AllHealthy", "All checks passed"),
        ));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
    }

    #[test]
    fn test_set_condition_updates_existing() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_READY.to_string(),
            status: CONDITION_STATUS_FALSE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "NotHealthy".to_string(),
            message: "Resource not ready".to_string(),
            observed_generation: None,
        }];

        let old_time = conditions[0].last_transition_time.clone();
        set_condition(
            &mut conditions,
            Condition::ready(true, "Healthy", "Resource is ready"),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_ne!(conditions[0].last_transition_time, old_time);
    }

    #[test]
    fn test_set_identical_condition_is_noop() {
        let mut conditions = vec![Condition::ready(false, "Waiting", "pending")];
        let time = conditions[0].last_transition_time.clone();
        assert!(!set_condition(
            &mut conditions,
            Condition::ready(false, "Waiting", "pending"),
        ));
        assert_eq!(conditions[0].last_transition_time, time);
    }

    #[test]
    fn test_is_condition_true_and_remove() {
        let mut conditions = vec![
            Condition::ready(true, "Healthy", "All good"),
            Condition::new("SecretNotFound", true, "Missing", "secret missing"),
        ];

        assert!(is_condition_true(&conditions, CONDITION_TYPE_READY));
        assert!(find_condition(&conditions, "SecretNotFound").is_some());
        assert!(remove_condition(&mut conditions, "SecretNotFound"));
        assert!(!remove_condition(&mut conditions, "SecretNotFound"));
        assert!(find_condition(&conditions, "SecretNotFound").is_none());
    }
}
