use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::restrictions::PLAY_STORE;

/// Configuration payload issued by the backend. Never edited in place; a
/// new document replaces the old one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyDocument {
    pub name: String,
    pub system_restrictions: BTreeMap<String, bool>,
    pub blocked_apps: BlockedApps,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_policies: Option<BrowserPolicies>,
    pub delivery_apps: Vec<DeliveryApp>,
    pub dev: DevFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockedApps {
    pub social_media: AppCategory,
    pub streaming: AppCategory,
    pub google_apps: AppCategory,
    pub browsers: AppCategory,
    pub play_store: Toggle,
    pub custom: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppCategory {
    pub enabled: bool,
    pub apps: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggle {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserPolicies {
    #[serde(alias = "blockMode", skip_serializing_if = "Option::is_none")]
    pub mode: Option<BrowserMode>,
    pub block_all_urls: bool,
    pub allowed_urls: Vec<String>,
    pub blocked_urls: Vec<String>,
    pub force_safe_search: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BrowserMode {
    None,
    Blacklist,
    Whitelist,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryApp {
    pub package_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "enabled")]
    pub grant_overlay_permission: bool,
    #[serde(default = "enabled")]
    pub disable_battery_optimization: bool,
    #[serde(default = "enabled")]
    pub grant_all_permissions: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DevFlags {
    pub allow_usb_debugging: bool,
}

fn enabled() -> bool {
    true
}

impl PolicyDocument {
    pub fn from_json(contents: &str) -> Result<Self> {
        let policy = serde_json::from_str(contents).context("parse policy JSON")?;
        Ok(policy)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        let output = serde_json::to_string_pretty(self).context("render policy JSON")?;
        Ok(output)
    }

    /// Toggle value, `None` when the policy does not mention it.
    pub fn toggle(&self, name: &str) -> Option<bool> {
        self.system_restrictions.get(name).copied()
    }

    /// Every package the category toggles and the custom list ask to hide.
    pub fn blocked_packages(&self) -> BTreeSet<String> {
        let apps = &self.blocked_apps;
        let mut packages = BTreeSet::new();
        for category in [&apps.social_media, &apps.streaming, &apps.google_apps, &apps.browsers] {
            if category.enabled {
                packages.extend(category.apps.iter().filter(|app| !app.is_empty()).cloned());
            }
        }
        if apps.play_store.enabled {
            packages.insert(PLAY_STORE.to_string());
        }
        packages.extend(apps.custom.iter().filter(|app| !app.is_empty()).cloned());
        packages
    }
}

impl FromStr for BrowserMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "NONE" => Ok(BrowserMode::None),
            "BLACKLIST" => Ok(BrowserMode::Blacklist),
            "WHITELIST" => Ok(BrowserMode::Whitelist),
            _ => Err(format!("unknown browser mode: {value}")),
        }
    }
}

impl fmt::Display for BrowserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            BrowserMode::None => "NONE",
            BrowserMode::Blacklist => "BLACKLIST",
            BrowserMode::Whitelist => "WHITELIST",
        };
        write!(f, "{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "name": "field-staff",
        "systemRestrictions": {"blockHotspot": true, "blockCamera": false},
        "blockedApps": {
            "socialMedia": {"enabled": true, "apps": ["com.facebook.katana", ""]},
            "streaming": {"enabled": false, "apps": ["com.netflix.mediaclient"]},
            "playStore": {"enabled": true},
            "custom": ["com.example.game"]
        },
        "browserPolicies": {"blockMode": "WHITELIST", "allowedUrls": ["example.com"]},
        "deliveryApps": [{"packageName": "com.example.rider", "grantAllPermissions": false}],
        "unknownSection": {"ignored": true}
    }"#;

    #[test]
    fn test_parse_backend_document() {
        let policy = PolicyDocument::from_json(SAMPLE).unwrap();
        assert_eq!(policy.name, "field-staff");
        assert_eq!(policy.toggle("blockHotspot"), Some(true));
        assert_eq!(policy.toggle("blockUSB"), None);
        let browser = policy.browser_policies.as_ref().unwrap();
        assert_eq!(browser.mode, Some(BrowserMode::Whitelist));
        let delivery = &policy.delivery_apps[0];
        assert!(delivery.grant_overlay_permission);
        assert!(!delivery.grant_all_permissions);
        assert!(!policy.dev.allow_usb_debugging);
    }

    #[test]
    fn test_blocked_packages_follow_category_toggles() {
        let policy = PolicyDocument::from_json(SAMPLE).unwrap();
        let packages = policy.blocked_packages();
        assert!(packages.contains("com.facebook.katana"));
        assert!(packages.contains(PLAY_STORE));
        assert!(packages.contains("com.example.game"));
        assert!(!packages.contains("com.netflix.mediaclient"));
        assert!(!packages.contains(""));
    }

    #[test]
    fn test_browser_mode_from_str() {
        assert_eq!("whitelist".parse::<BrowserMode>().unwrap(), BrowserMode::Whitelist);
        assert!("allow-everything".parse::<BrowserMode>().is_err());
    }
}
