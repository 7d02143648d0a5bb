use serde::{Deserialize, Serialize};

/// Contact captured from a peer exchange. Owned by the caller and only read here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub subject_id: String,
    pub display_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub socials: Vec<SocialEntry>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialEntry {
    pub platform: String,
    pub handle: String,
}

impl ContactRecord {
    /// Splits the display name into `(family, given)` using the last word as family name.
    pub fn name_parts(&self) -> (String, String) {
        let trimmed = self.display_name.trim();
        match trimmed.rsplit_once(char::is_whitespace) {
            Some((given, family)) => (family.trim().to_string(), given.trim().to_string()),
            None => (String::new(), trimmed.to_string()),
        }
    }
}

/// Result reported by a single store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl SaveOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            external_id: None,
        }
    }

    pub fn with_external_id(external_id: impl Into<String>) -> Self {
        Self {
            external_id: Some(external_id.into()),
            ..Self::ok()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            external_id: None,
        }
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryStatus {
    Saved,
    Pending,
    Skipped,
    Fail,
    NotAttempted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    PrimaryFailed,
    Permission,
    Other,
    Denied,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::PrimaryFailed => "primary_failed",
            FailureReason::Permission => "permission",
            FailureReason::Other => "other",
            FailureReason::Denied => "denied",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

/// Combined outcome of a save gesture. `Pending` secondaries are transitional;
/// every other status is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReport {
    pub success: bool,
    pub primary: SaveOutcome,
    pub secondary_status: SecondaryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary: Option<SaveOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub upsell: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exported_document: Option<String>,
}

impl SaveReport {
    pub fn primary_failed(primary: SaveOutcome) -> Self {
        Self {
            success: false,
            primary,
            secondary_status: SecondaryStatus::NotAttempted,
            secondary: None,
            reason: Some(FailureReason::PrimaryFailed),
            upsell: false,
            exported_document: None,
        }
    }

    pub fn secondary_saved(primary: SaveOutcome, secondary: SaveOutcome) -> Self {
        Self {
            success: true,
            primary,
            secondary_status: SecondaryStatus::Saved,
            secondary: Some(secondary),
            reason: None,
            upsell: false,
            exported_document: None,
        }
    }

    pub fn secondary_failed(
        primary: SaveOutcome,
        secondary: Option<SaveOutcome>,
        reason: FailureReason,
    ) -> Self {
        Self {
            success: true,
            primary,
            secondary_status: SecondaryStatus::Fail,
            secondary,
            reason: Some(reason),
            upsell: true,
            exported_document: None,
        }
    }

    pub fn pending(primary: SaveOutcome, secondary: SaveOutcome) -> Self {
        Self {
            success: true,
            primary,
            secondary_status: SecondaryStatus::Pending,
            secondary: Some(secondary),
            reason: Some(FailureReason::Permission),
            upsell: false,
            exported_document: None,
        }
    }

    pub fn skipped(
        primary: SaveOutcome,
        secondary: SaveOutcome,
        exported_document: Option<String>,
    ) -> Self {
        Self {
            success: true,
            primary,
            secondary_status: SecondaryStatus::Skipped,
            secondary: Some(secondary),
            reason: Some(FailureReason::Permission),
            upsell: false,
            exported_document,
        }
    }

    pub fn is_final(&self) -> bool {
        self.secondary_status != SecondaryStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ContactRecord {
        ContactRecord {
            subject_id: "user-1".into(),
            display_name: name.into(),
            phone: None,
            email: None,
            socials: Vec::new(),
            bio: None,
            photo_url: None,
        }
    }

    #[test]
    fn splits_family_name_from_last_word() {
        assert_eq!(
            record("Ada King Lovelace").name_parts(),
            ("Lovelace".to_string(), "Ada King".to_string())
        );
        assert_eq!(
            record("  Prince ").name_parts(),
            (String::new(), "Prince".to_string())
        );
    }

    #[test]
    fn report_serializes_with_camel_case_and_snake_case_statuses() {
        let report = SaveReport::secondary_failed(
            SaveOutcome::ok(),
            Some(SaveOutcome::failed("boom")),
            FailureReason::Denied,
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["secondaryStatus"], "fail");
        assert_eq!(value["reason"], "denied");
        assert_eq!(value["upsell"], true);
        assert_eq!(value["primary"]["success"], true);
        assert!(value.get("exportedDocument").is_none());
    }

    #[test]
    fn deserializes_record_with_missing_optional_fields() {
        let parsed: ContactRecord = serde_json::from_str(
            r#"{"subjectId":"u","displayName":"Sam","socials":[{"platform":"github","handle":"sam"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.socials.len(), 1);
        assert!(parsed.photo_url.is_none());
    }
}
