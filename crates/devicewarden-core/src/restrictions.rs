//! Names shared between the policy document, the enforcement engine and the
//! restriction provider.

/// Device-level restriction keys understood by the restriction provider.
pub mod keys {
    pub const CONFIG_TETHERING: &str = "no_config_tethering";
    pub const AIRPLANE_MODE: &str = "no_airplane_mode";
    pub const INSTALL_APPS: &str = "no_install_apps";
    pub const INSTALL_UNKNOWN_SOURCES: &str = "no_install_unknown_sources";
    pub const INSTALL_UNKNOWN_SOURCES_GLOBALLY: &str = "no_install_unknown_sources_globally";
    pub const USB_FILE_TRANSFER: &str = "no_usb_file_transfer";
    pub const CONFIG_WIFI: &str = "no_config_wifi";
    pub const CONFIG_BLUETOOTH: &str = "no_config_bluetooth";
    pub const FACTORY_RESET: &str = "no_factory_reset";
    pub const ADD_USER: &str = "no_add_user";
    pub const REMOVE_USER: &str = "no_remove_user";
    pub const CONFIG_CREDENTIALS: &str = "no_config_credentials";
    pub const SHARE_LOCATION: &str = "no_share_location";
    pub const DEBUGGING_FEATURES: &str = "no_debugging_features";
    pub const CONFIG_DATE_TIME: &str = "no_config_date_time";
    pub const CONFIG_SCREEN_TIMEOUT: &str = "no_config_screen_timeout";
    pub const CONFIG_LOCATION: &str = "no_config_location";
}

/// Restrictions cleared by a full reset, in clearing order.
pub const KNOWN_RESTRICTIONS: &[&str] = &[
    keys::CONFIG_TETHERING,
    keys::INSTALL_APPS,
    keys::INSTALL_UNKNOWN_SOURCES,
    keys::INSTALL_UNKNOWN_SOURCES_GLOBALLY,
    keys::USB_FILE_TRANSFER,
    keys::CONFIG_WIFI,
    keys::CONFIG_BLUETOOTH,
    keys::FACTORY_RESET,
    keys::ADD_USER,
    keys::REMOVE_USER,
    keys::CONFIG_CREDENTIALS,
    keys::SHARE_LOCATION,
    keys::DEBUGGING_FEATURES,
    keys::CONFIG_DATE_TIME,
    keys::CONFIG_SCREEN_TIMEOUT,
    keys::CONFIG_LOCATION,
    keys::AIRPLANE_MODE,
];

/// Restrictions that stop a package from being installed.
pub const INSTALL_BLOCKING: &[&str] = &[
    keys::INSTALL_APPS,
    keys::INSTALL_UNKNOWN_SOURCES,
    keys::INSTALL_UNKNOWN_SOURCES_GLOBALLY,
];

/// Toggle names used in a policy's `systemRestrictions` map.
pub mod toggles {
    pub const BLOCK_HOTSPOT: &str = "blockHotspot";
    pub const BLOCK_AIRPLANE_MODE: &str = "blockAirplaneMode";
    pub const BLOCK_INSTALLATION: &str = "blockInstallation";
    pub const BLOCK_USB: &str = "blockUSB";
    pub const BLOCK_WIFI_CONFIG: &str = "blockWifiConfig";
    pub const BLOCK_BLUETOOTH_CONFIG: &str = "blockBluetoothConfig";
    pub const BLOCK_FACTORY_RESET: &str = "blockFactoryReset";
    pub const BLOCK_SCREEN_CAPTURE: &str = "blockScreenCapture";
    pub const BLOCK_CAMERA: &str = "blockCamera";
    pub const FORCE_LOCATION_ON: &str = "forceLocationOn";
    pub const PREVENT_LOCATION_TOGGLE: &str = "preventLocationToggle";
    pub const DISABLE_STATUS_BAR: &str = "disableStatusBar";
}

/// Primary managed browser plus its release channels.
pub const PRIMARY_BROWSERS: &[&str] = &["com.android.chrome", "com.chrome.beta", "com.chrome.dev"];

/// Browsers hidden while an allow-list is in force.
pub const ALTERNATIVE_BROWSERS: &[&str] = &[
    "com.brave.browser",
    "org.mozilla.firefox",
    "org.mozilla.focus",
    "com.opera.browser",
    "com.opera.mini.native",
    "com.microsoft.emmx",
    "com.duckduckgo.mobile.android",
    "com.sec.android.app.sbrowser",
    "com.kiwibrowser.browser",
];

pub const PLAY_STORE: &str = "com.android.vending";

/// Packages unhidden when no stored policy says which apps were blocked.
pub const COMMONLY_BLOCKED_APPS: &[&str] = &[
    "com.facebook.katana",
    "com.instagram.android",
    "com.twitter.android",
    "com.zhiliaoapp.musically",
    "com.snapchat.android",
    "com.whatsapp",
    "com.google.android.youtube",
    "com.netflix.mediaclient",
    "com.spotify.music",
    "com.amazon.avod.thirdpartyclient",
    "com.google.android.apps.photos",
    "com.google.android.apps.docs",
    "com.google.android.keep",
    "com.google.android.apps.maps",
    "org.mozilla.firefox",
    "com.opera.browser",
    "com.brave.browser",
    "com.UCMobile.intl",
    PLAY_STORE,
];

/// Runtime permissions granted to delivery-category applications.
pub const DELIVERY_PERMISSIONS: &[&str] = &[
    "android.permission.ACCESS_FINE_LOCATION",
    "android.permission.ACCESS_COARSE_LOCATION",
    "android.permission.ACCESS_BACKGROUND_LOCATION",
    "android.permission.CAMERA",
    "android.permission.READ_EXTERNAL_STORAGE",
    "android.permission.WRITE_EXTERNAL_STORAGE",
    "android.permission.RECORD_AUDIO",
    "android.permission.CALL_PHONE",
    "android.permission.READ_PHONE_STATE",
];

pub fn all_browsers() -> impl Iterator<Item = &'static str> {
    PRIMARY_BROWSERS.iter().chain(ALTERNATIVE_BROWSERS.iter()).copied()
}
