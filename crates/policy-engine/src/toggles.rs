use devicewarden_core::restrictions::{keys, toggles};

/// What one `systemRestrictions` toggle does to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleEffect {
    Restrictions(&'static [&'static str]),
    ScreenCaptureDisabled,
    CameraDisabled,
    LocationForcedOn,
    /// Locks the location setting, and debugging unless the policy allows it.
    LocationSettingLocked,
    StatusBarDisabled,
}

/// Toggles applied as enabled when the policy does not mention them.
pub const DEFAULT_ENABLED: &[&str] = &[toggles::BLOCK_FACTORY_RESET];

pub fn effect(toggle: &str) -> Option<ToggleEffect> {
    let effect = match toggle {
        toggles::BLOCK_HOTSPOT => ToggleEffect::Restrictions(&[keys::CONFIG_TETHERING]),
        toggles::BLOCK_AIRPLANE_MODE => ToggleEffect::Restrictions(&[keys::AIRPLANE_MODE]),
        toggles::BLOCK_INSTALLATION => {
            ToggleEffect::Restrictions(&[keys::INSTALL_APPS, keys::INSTALL_UNKNOWN_SOURCES])
        }
        toggles::BLOCK_USB => ToggleEffect::Restrictions(&[keys::USB_FILE_TRANSFER]),
        toggles::BLOCK_WIFI_CONFIG => ToggleEffect::Restrictions(&[keys::CONFIG_WIFI]),
        toggles::BLOCK_BLUETOOTH_CONFIG => ToggleEffect::Restrictions(&[keys::CONFIG_BLUETOOTH]),
        toggles::BLOCK_FACTORY_RESET => ToggleEffect::Restrictions(&[keys::FACTORY_RESET]),
        toggles::BLOCK_SCREEN_CAPTURE => ToggleEffect::ScreenCaptureDisabled,
        toggles::BLOCK_CAMERA => ToggleEffect::CameraDisabled,
        toggles::FORCE_LOCATION_ON => ToggleEffect::LocationForcedOn,
        toggles::PREVENT_LOCATION_TOGGLE => ToggleEffect::LocationSettingLocked,
        toggles::DISABLE_STATUS_BAR => ToggleEffect::StatusBarDisabled,
        _ => return None,
    };
    Some(effect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installation_toggle_covers_both_sources() {
        assert_eq!(
            effect(toggles::BLOCK_INSTALLATION),
            Some(ToggleEffect::Restrictions(&[
                keys::INSTALL_APPS,
                keys::INSTALL_UNKNOWN_SOURCES
            ]))
        );
        assert_eq!(effect("blockTimeTravel"), None);
    }
}
