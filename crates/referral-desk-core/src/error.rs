use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::policy::{Operation, ResourceKind};
use crate::{ReferralStatus, UserId};

/// Field name to human-readable message, sorted by field.
pub type FieldErrors = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AttachmentRejection {
    TooManyFiles { count: usize, max: usize },
    DisallowedExtension { file_name: String },
    TooLarge { file_name: String, size_bytes: u64, max_bytes: u64 },
}

impl Display for AttachmentRejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooManyFiles { count, max } => {
                write!(f, "{count} files submitted, at most {max} allowed")
            }
            Self::DisallowedExtension { file_name } => {
                write!(f, "file type of `{file_name}` is not allowed")
            }
            Self::TooLarge { file_name, size_bytes, max_bytes } => {
                write!(f, "`{file_name}` is {size_bytes} bytes, limit is {max_bytes}")
            }
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DeskError {
    #[error("forbidden: {principal} may not {} this {}", .operation.as_str(), .resource.as_str())]
    Forbidden { principal: UserId, operation: Operation, resource: ResourceKind },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("validation failed: {}", render_fields(.0))]
    ValidationFailed(FieldErrors),
    #[error("`{target}` cannot receive this assignment")]
    InvalidAssignee { target: UserId },
    #[error("a reply needs text or at least one attachment")]
    EmptyReply,
    #[error("case cannot close before a reply or counselor recommendation exists")]
    NoActionYet,
    #[error("attachment batch rejected: {0}")]
    AttachmentRejected(AttachmentRejection),
    #[error("{entity} `{id}` changed concurrently; reload and retry")]
    Conflict { entity: &'static str, id: String },
    #[error("{entity} {reference} is closed")]
    Closed { entity: &'static str, reference: String },
    #[error("referral cannot move from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition { from: ReferralStatus, to: ReferralStatus },
}

impl DeskError {
    #[must_use]
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), message.into());
        Self::ValidationFailed(errors)
    }

    /// Stable machine-readable code for hosting layers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Forbidden { .. } => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::ValidationFailed(_) => "validation_failed",
            Self::InvalidAssignee { .. } => "invalid_assignee",
            Self::EmptyReply => "empty_reply",
            Self::NoActionYet => "no_action_yet",
            Self::AttachmentRejected(_) => "attachment_rejected",
            Self::Conflict { .. } => "conflict",
            Self::Closed { .. } => "closed",
            Self::InvalidTransition { .. } => "invalid_transition",
        }
    }
}

fn render_fields(errors: &FieldErrors) -> String {
    errors.iter().map(|(field, message)| format!("{field}: {message}")).collect::<Vec<_>>().join("; ")
}
