use serde::{Deserialize, Serialize};

use crate::error::{DeskError, FieldErrors};
use crate::ReferralType;

pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: usize = 5;
pub const MAX_REPORT_WINDOW_DAYS: i64 = 3650;
pub const MAX_RECENCY_WINDOW_HOURS: i64 = 8760;

/// Settings resolved once at startup and passed by reference into every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DeskConfig {
    pub attachments: AttachmentLimits,
    pub referrals: ReferralSettings,
    pub directory: DirectorySettings,
    pub threads: ThreadSettings,
    pub routing: RoutingSettings,
}

impl DeskConfig {
    /// # Errors
    /// Returns [`DeskError::ValidationFailed`] keyed by dotted setting path when a
    /// limit is zero, a time window is out of range, or an extension is malformed.
    pub fn validate(&self) -> Result<(), DeskError> {
        let mut errors = FieldErrors::new();
        if self.attachments.max_files == 0 {
            errors.insert("attachments.max_files".to_string(), "must be at least 1".to_string());
        }
        if self.attachments.max_file_bytes == 0 {
            errors
                .insert("attachments.max_file_bytes".to_string(), "must be at least 1".to_string());
        }
        if self.attachments.allowed_extensions.is_empty() {
            errors.insert(
                "attachments.allowed_extensions".to_string(),
                "at least one extension is required".to_string(),
            );
        }
        for ext in &self.attachments.allowed_extensions {
            if ext.is_empty() || ext.starts_with('.') || ext.chars().any(|c| c.is_ascii_uppercase())
            {
                errors.insert(
                    "attachments.allowed_extensions".to_string(),
                    format!("`{ext}` must be lowercase without a leading dot"),
                );
            }
        }
        if self.referrals.max_student_name_chars == 0 {
            errors.insert(
                "referrals.max_student_name_chars".to_string(),
                "must be at least 1".to_string(),
            );
        }
        if self.directory.related_cases_limit == 0 {
            errors.insert(
                "directory.related_cases_limit".to_string(),
                "must be at least 1".to_string(),
            );
        }
        if !(1..=MAX_REPORT_WINDOW_DAYS).contains(&self.directory.report_window_days) {
            errors.insert(
                "directory.report_window_days".to_string(),
                format!("must be between 1 and {MAX_REPORT_WINDOW_DAYS}"),
            );
        }
        if !(1..=MAX_RECENCY_WINDOW_HOURS).contains(&self.threads.recency_window_hours) {
            errors.insert(
                "threads.recency_window_hours".to_string(),
                format!("must be between 1 and {MAX_RECENCY_WINDOW_HOURS}"),
            );
        }
        if self.threads.max_subject_chars == 0 {
            errors.insert(
                "threads.max_subject_chars".to_string(),
                "must be at least 1".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DeskError::ValidationFailed(errors))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AttachmentLimits {
    /// Lowercase, without the leading dot.
    pub allowed_extensions: Vec<String>,
    pub max_file_bytes: u64,
    pub max_files: usize,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            allowed_extensions: ["pdf", "png", "jpg", "jpeg", "doc", "docx"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReferralSettings {
    pub min_details_chars: usize,
    pub max_student_name_chars: usize,
}

impl Default for ReferralSettings {
    fn default() -> Self {
        Self { min_details_chars: 10, max_student_name_chars: 120 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DirectorySettings {
    pub related_cases_limit: usize,
    /// When set, elevated principals see every referral under the `sent` scope.
    pub elevated_sent_is_all: bool,
    pub report_window_days: i64,
}

impl DirectorySettings {
    #[must_use]
    pub fn report_window(&self) -> time::Duration {
        time::Duration::seconds(self.report_window_days.saturating_mul(86_400))
    }
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self { related_cases_limit: 10, elevated_sent_is_all: false, report_window_days: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ThreadSettings {
    pub recency_window_hours: i64,
    pub allow_reply_when_closed: bool,
    pub max_subject_chars: usize,
}

impl ThreadSettings {
    #[must_use]
    pub fn recency_window(&self) -> time::Duration {
        time::Duration::seconds(self.recency_window_hours.saturating_mul(3600))
    }
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self { recency_window_hours: 72, allow_reply_when_closed: false, max_subject_chars: 140 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingSettings {
    pub enabled: bool,
    pub referral_types: Vec<ReferralType>,
}

impl RoutingSettings {
    #[must_use]
    pub fn routes(&self, referral_type: ReferralType) -> bool {
        self.enabled && self.referral_types.contains(&referral_type)
    }
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self { enabled: true, referral_types: ReferralType::ALL.to_vec() }
    }
}
