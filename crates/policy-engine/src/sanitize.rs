//! Strips restriction toggles the current hardware cannot survive.

use tracing::{debug, info};

use devicewarden_core::policy::PolicyDocument;
use devicewarden_core::profile::ProfileClassification;

#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub policy: PolicyDocument,
    pub removed: Vec<String>,
}

/// Copy of `policy` with every dangerous key for this profile removed from
/// `systemRestrictions`, whatever its value.
pub fn sanitize(policy: &PolicyDocument, classification: &ProfileClassification) -> Sanitized {
    let mut sanitized = policy.clone();
    let removed: Vec<String> = sanitized
        .system_restrictions
        .keys()
        .filter(|key| classification.is_dangerous(key))
        .cloned()
        .collect();
    for key in &removed {
        sanitized.system_restrictions.remove(key);
    }

    if removed.is_empty() {
        debug!(profile = classification.label(), "policy needed no sanitizing");
    } else {
        info!(
            profile = classification.label(),
            removed = removed.len(),
            keys = ?removed,
            "dangerous restrictions stripped from policy"
        );
    }

    Sanitized {
        policy: sanitized,
        removed,
    }
}

/// The first unsafe combination for this profile that `policy` enables in
/// full. Lone dangerous keys are the sanitizer's job and are not reported.
pub fn unsafe_reason(policy: &PolicyDocument, classification: &ProfileClassification) -> Option<String> {
    classification
        .unsafe_combinations
        .iter()
        .find(|combination| combination.iter().all(|key| policy.toggle(key) == Some(true)))
        .map(|combination| {
            let keys: Vec<&str> = combination.iter().map(String::as_str).collect();
            format!("{} enabled together on {}", keys.join(" + "), classification.label())
        })
}
