use serde::Serialize;

/// User-agent fragments of in-app browsers that block or mangle popups.
const EMBEDDED_SHELL_MARKERS: &[&str] = &[
    "fban",
    "fbav",
    "fb_iab",
    "instagram",
    "line/",
    "twitter",
    "linkedinapp",
    "gsa/",
    "snapchat",
    "micromessenger",
    "musical_ly",
    "bytedancewebview",
    "pinterest",
    "; wv)",
    "webview",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Android,
    Ios,
    Other,
}

/// What the host looks like for this attempt. Recomputed on every save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformProfile {
    pub os_family: OsFamily,
    pub is_embedded_shell: bool,
    pub can_use_popup: bool,
}

/// How a permission failure on the secondary store is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionRoute {
    /// Ask the identity provider for the missing scope.
    Escalate,
    /// Skip the API and hand a vCard to the native file opener.
    ExportDocument,
    /// Report a retryable failure.
    Upsell,
}

impl PlatformProfile {
    pub fn detect(user_agent: &str, window_available: bool) -> Self {
        let lowered = user_agent.to_ascii_lowercase();
        let os_family = if lowered.contains("android") {
            OsFamily::Android
        } else if ["iphone", "ipad", "ipod"]
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            OsFamily::Ios
        } else {
            OsFamily::Other
        };

        let marker_hit = EMBEDDED_SHELL_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker));
        // iOS shells built on WKWebView drop the Safari token.
        let ios_webview = os_family == OsFamily::Ios && !lowered.contains("safari/");
        let is_embedded_shell = marker_hit || ios_webview;

        Self {
            os_family,
            is_embedded_shell,
            can_use_popup: !is_embedded_shell && window_available,
        }
    }

    pub fn permission_route(&self) -> PermissionRoute {
        match (self.os_family, self.is_embedded_shell) {
            (OsFamily::Android, _) | (OsFamily::Ios, true) => PermissionRoute::Escalate,
            (OsFamily::Ios, false) => PermissionRoute::ExportDocument,
            (OsFamily::Other, _) => PermissionRoute::Upsell,
        }
    }
}
