//! Hardware profile lookup. Every manufacturer/model decision in the agent
//! goes through [`DeviceProfileClassifier`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::restrictions::toggles;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub manufacturer: String,
    pub model: String,
}

/// One registry entry. Matching is a case-insensitive substring test on the
/// model, optionally narrowed by manufacturer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRule {
    pub label: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    pub model: String,
    #[serde(default)]
    pub dangerous_keys: Vec<String>,
    #[serde(default)]
    pub unsafe_combinations: Vec<Vec<String>>,
    #[serde(default)]
    pub automatic_filtering: bool,
}

/// What the rest of the agent needs to know about the running hardware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileClassification {
    pub labels: Vec<String>,
    pub dangerous_keys: BTreeSet<String>,
    pub unsafe_combinations: Vec<BTreeSet<String>>,
    pub automatic_filtering: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceProfileClassifier {
    rules: Vec<ProfileRule>,
}

impl DeviceProfile {
    pub fn new(manufacturer: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.manufacturer, self.model)
    }
}

impl ProfileRule {
    fn matches(&self, profile: &DeviceProfile) -> bool {
        let model = profile.model.to_lowercase();
        if !model.contains(&self.model.to_lowercase()) {
            return false;
        }
        match &self.manufacturer {
            Some(manufacturer) => profile
                .manufacturer
                .to_lowercase()
                .contains(&manufacturer.to_lowercase()),
            None => true,
        }
    }
}

impl ProfileClassification {
    /// Profiles with automatic filtering never enter safe mode.
    pub fn is_exempt(&self) -> bool {
        self.automatic_filtering
    }

    pub fn is_dangerous(&self, key: &str) -> bool {
        self.dangerous_keys.contains(key)
    }

    pub fn label(&self) -> &str {
        self.labels.first().map(String::as_str).unwrap_or("generic")
    }
}

impl DeviceProfileClassifier {
    pub fn builtin() -> Self {
        Self {
            rules: builtin_rules(),
        }
    }

    /// Built-in registry extended with operator-supplied rules.
    pub fn with_rules(extra: &[ProfileRule]) -> Self {
        let mut rules = builtin_rules();
        rules.extend(extra.iter().cloned());
        Self { rules }
    }

    pub fn classify(&self, profile: &DeviceProfile) -> ProfileClassification {
        let mut classification = ProfileClassification::default();
        for rule in self.rules.iter().filter(|rule| rule.matches(profile)) {
            if !classification.labels.contains(&rule.label) {
                classification.labels.push(rule.label.clone());
            }
            classification
                .dangerous_keys
                .extend(rule.dangerous_keys.iter().cloned());
            for combination in &rule.unsafe_combinations {
                let combination: BTreeSet<String> = combination.iter().cloned().collect();
                if !combination.is_empty()
                    && !classification.unsafe_combinations.contains(&combination)
                {
                    classification.unsafe_combinations.push(combination);
                }
            }
            classification.automatic_filtering |= rule.automatic_filtering;
        }
        classification
    }
}

fn builtin_rules() -> Vec<ProfileRule> {
    let dangerous_keys: Vec<String> = [
        toggles::FORCE_LOCATION_ON,
        toggles::PREVENT_LOCATION_TOGGLE,
        toggles::BLOCK_WIFI_CONFIG,
        toggles::BLOCK_BLUETOOTH_CONFIG,
        toggles::BLOCK_FACTORY_RESET,
        toggles::DISABLE_STATUS_BAR,
        toggles::BLOCK_AIRPLANE_MODE,
    ]
    .iter()
    .map(|key| key.to_string())
    .collect();
    let location_lock = vec![
        toggles::FORCE_LOCATION_ON.to_string(),
        toggles::PREVENT_LOCATION_TOGGLE.to_string(),
    ];

    // The g24 family bootloops when location or radio settings are pinned.
    vec![
        ProfileRule {
            label: "moto-g24".to_string(),
            manufacturer: None,
            model: "moto g24".to_string(),
            dangerous_keys: dangerous_keys.clone(),
            unsafe_combinations: vec![location_lock.clone()],
            automatic_filtering: true,
        },
        ProfileRule {
            label: "moto-g24".to_string(),
            manufacturer: Some("motorola".to_string()),
            model: "g24".to_string(),
            dangerous_keys,
            unsafe_combinations: vec![location_lock],
            automatic_filtering: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_g24_variants_are_classified() {
        let classifier = DeviceProfileClassifier::builtin();
        for (manufacturer, model) in [
            ("motorola", "moto g24"),
            ("Motorola", "moto g24 power"),
            ("motorola", "XT2423-G24"),
            ("lenovo", "Moto G24"),
        ] {
            let classification = classifier.classify(&DeviceProfile::new(manufacturer, model));
            assert!(classification.is_exempt(), "{manufacturer} {model}");
            assert!(classification.is_dangerous(toggles::FORCE_LOCATION_ON));
            assert_eq!(classification.label(), "moto-g24");
            assert_eq!(classification.unsafe_combinations.len(), 1);
        }
    }

    #[test]
    fn test_unknown_profile_is_generic() {
        let classifier = DeviceProfileClassifier::builtin();
        let classification = classifier.classify(&DeviceProfile::new("samsung", "SM-A155"));
        assert!(!classification.is_exempt());
        assert!(classification.dangerous_keys.is_empty());
        assert_eq!(classification.label(), "generic");
    }

    #[test]
    fn test_extra_rules_merge_with_builtin() {
        let extra = ProfileRule {
            label: "rugged-tablet".to_string(),
            manufacturer: Some("acme".to_string()),
            model: "rt-".to_string(),
            dangerous_keys: vec![toggles::BLOCK_USB.to_string()],
            unsafe_combinations: vec![vec![
                toggles::BLOCK_CAMERA.to_string(),
                toggles::DISABLE_STATUS_BAR.to_string(),
            ]],
            automatic_filtering: false,
        };
        let classifier = DeviceProfileClassifier::with_rules(&[extra]);
        let classification = classifier.classify(&DeviceProfile::new("ACME", "RT-8"));
        assert!(!classification.is_exempt());
        assert!(classification.is_dangerous(toggles::BLOCK_USB));
        assert_eq!(classification.unsafe_combinations.len(), 1);
    }
}
