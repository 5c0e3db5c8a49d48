//! Managed browser configuration for URL allow and deny lists.

use devicewarden_core::policy::{BrowserMode, BrowserPolicies};
use devicewarden_core::provider::{ConfigBundle, ConfigValue};

pub const URL_BLOCKLIST: &str = "URLBlocklist";
pub const URL_ALLOWLIST: &str = "URLAllowlist";
pub const INCOGNITO_MODE_AVAILABILITY: &str = "IncognitoModeAvailability";
pub const DEVELOPER_TOOLS_DISABLED: &str = "DeveloperToolsDisabled";
pub const DOWNLOAD_RESTRICTIONS: &str = "DownloadRestrictions";
pub const FORCE_SAFE_SEARCH: &str = "ForceSafeSearch";

const INCOGNITO_DISABLED: i64 = 1;
const BLOCK_ALL_DOWNLOADS: i64 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct BrowserPlan {
    pub mode: BrowserMode,
    /// Empty bundle clears any previous configuration.
    pub bundle: ConfigBundle,
    pub hide_alternatives: bool,
}

/// Explicit mode wins; otherwise `blockAllUrls` means an allow-list and a
/// non-empty deny-list means a deny-list.
pub fn effective_mode(policies: Option<&BrowserPolicies>) -> BrowserMode {
    let Some(policies) = policies else {
        return BrowserMode::None;
    };
    if let Some(mode) = policies.mode {
        return mode;
    }
    if policies.block_all_urls {
        BrowserMode::Whitelist
    } else if cleaned(&policies.blocked_urls).next().is_some() {
        BrowserMode::Blacklist
    } else {
        BrowserMode::None
    }
}

/// Bare domain for an allow-list entry, without scheme, `www.` or wildcards.
pub fn normalize_domain(url: &str) -> Option<String> {
    let domain = url
        .trim()
        .replace("https://", "")
        .replace("http://", "")
        .replace("www.", "")
        .replace("/*", "")
        .replace('*', "");
    let domain = domain.trim().trim_start_matches('.').trim_end_matches('/');
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_string())
    }
}

/// Every URL pattern needed to reach `domain` under a catch-all block.
pub fn allowlist_variants(domain: &str) -> Vec<String> {
    let mut variants = Vec::with_capacity(12);
    for scheme in ["https", "http"] {
        for host in [domain.to_string(), format!("www.{domain}"), format!("*.{domain}")] {
            variants.push(format!("{scheme}://{host}"));
            variants.push(format!("{scheme}://{host}/*"));
        }
    }
    variants
}

pub fn normalized_allowlist(urls: &[String]) -> Vec<String> {
    let mut allowlist: Vec<String> = Vec::new();
    for domain in urls.iter().filter_map(|url| normalize_domain(url)) {
        for variant in allowlist_variants(&domain) {
            if !allowlist.contains(&variant) {
                allowlist.push(variant);
            }
        }
    }
    allowlist
}

pub fn plan(policies: Option<&BrowserPolicies>) -> BrowserPlan {
    let mode = effective_mode(policies);
    let mut bundle = ConfigBundle::new();
    let Some(policies) = policies else {
        return BrowserPlan {
            mode,
            bundle,
            hide_alternatives: false,
        };
    };

    match mode {
        BrowserMode::None => {}
        BrowserMode::Whitelist => {
            bundle.insert(URL_BLOCKLIST.to_string(), ConfigValue::List(vec!["*".to_string()]));
            let allowlist = normalized_allowlist(&policies.allowed_urls);
            if !allowlist.is_empty() {
                bundle.insert(URL_ALLOWLIST.to_string(), ConfigValue::List(allowlist));
            }
            bundle.insert(
                INCOGNITO_MODE_AVAILABILITY.to_string(),
                ConfigValue::Int(INCOGNITO_DISABLED),
            );
            bundle.insert(DEVELOPER_TOOLS_DISABLED.to_string(), ConfigValue::Bool(true));
            bundle.insert(
                DOWNLOAD_RESTRICTIONS.to_string(),
                ConfigValue::Int(BLOCK_ALL_DOWNLOADS),
            );
        }
        BrowserMode::Blacklist => {
            let blocked: Vec<String> = cleaned(&policies.blocked_urls).collect();
            if !blocked.is_empty() {
                bundle.insert(URL_BLOCKLIST.to_string(), ConfigValue::List(blocked));
            }
            let allowed: Vec<String> = cleaned(&policies.allowed_urls).collect();
            if !allowed.is_empty() {
                bundle.insert(URL_ALLOWLIST.to_string(), ConfigValue::List(allowed));
            }
        }
    }

    if mode != BrowserMode::None && policies.force_safe_search {
        bundle.insert(FORCE_SAFE_SEARCH.to_string(), ConfigValue::Bool(true));
    }

    BrowserPlan {
        mode,
        bundle,
        hide_alternatives: mode == BrowserMode::Whitelist,
    }
}

fn cleaned(urls: &[String]) -> impl Iterator<Item = String> + '_ {
    urls.iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}
