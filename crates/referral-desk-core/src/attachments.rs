use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::AttachmentLimits;
use crate::error::{AttachmentRejection, DeskError};
use crate::{Attachment, AttachmentId, AttachmentOwner, UserId};

pub const MAX_STEM_CHARS: usize = 60;

/// File metadata offered with a submission, before any blob is written.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IncomingFile {
    pub file_name: String,
    pub size_bytes: u64,
    pub content_hash: Option<String>,
}

impl IncomingFile {
    #[must_use]
    pub fn new(file_name: impl Into<String>, size_bytes: u64) -> Self {
        Self { file_name: file_name.into(), size_bytes, content_hash: None }
    }
}

/// Lowercased extension after the last dot, if any.
#[must_use]
pub fn extension_of(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Validates a whole batch; the first offending file rejects all of them.
///
/// # Errors
/// Returns [`DeskError::AttachmentRejected`] when the batch is too large, a file has
/// a disallowed extension, or a file exceeds the per-file size limit.
pub fn check_batch(limits: &AttachmentLimits, files: &[IncomingFile]) -> Result<(), DeskError> {
    if files.len() > limits.max_files {
        return Err(DeskError::AttachmentRejected(AttachmentRejection::TooManyFiles {
            count: files.len(),
            max: limits.max_files,
        }));
    }

    for file in files {
        let allowed = extension_of(&file.file_name)
            .is_some_and(|ext| limits.allowed_extensions.iter().any(|allowed| *allowed == ext));
        if !allowed {
            return Err(DeskError::AttachmentRejected(AttachmentRejection::DisallowedExtension {
                file_name: file.file_name.clone(),
            }));
        }
        if file.size_bytes > limits.max_file_bytes {
            return Err(DeskError::AttachmentRejected(AttachmentRejection::TooLarge {
                file_name: file.file_name.clone(),
                size_bytes: file.size_bytes,
                max_bytes: limits.max_file_bytes,
            }));
        }
    }

    Ok(())
}

/// Storage path hint for a blob, grouped by owner.
#[must_use]
pub fn suggested_path(owner: AttachmentOwner, file_name: &str) -> String {
    let base_name = file_name.rsplit(|ch: char| ch == '/' || ch == '\\').next().unwrap_or(file_name);
    let (stem, ext) = match base_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{}", ext.to_ascii_lowercase())),
        _ => (base_name, String::new()),
    };
    let safe_stem: String = stem
        .chars()
        .take(MAX_STEM_CHARS)
        .map(|ch| if ch.is_whitespace() { '_' } else { ch })
        .collect();
    let safe_stem = if safe_stem.is_empty() { "file".to_string() } else { safe_stem };

    match owner {
        AttachmentOwner::Referral(id) => format!("referrals/{id}/{safe_stem}{ext}"),
        AttachmentOwner::Action(id) => format!("referrals/actions/{id}/{safe_stem}{ext}"),
        AttachmentOwner::Message(id) => format!("messages/threads/{id}/{safe_stem}{ext}"),
    }
}

/// Binds validated files to their owner. `file_ref` starts as the suggested path and
/// is replaced by the blob store's reference once the bytes are written.
#[must_use]
pub fn bind(
    owner: AttachmentOwner,
    files: &[IncomingFile],
    uploaded_by: &UserId,
    now: OffsetDateTime,
) -> Vec<Attachment> {
    files
        .iter()
        .map(|file| Attachment {
            id: AttachmentId::new(),
            owner,
            file_name: file.file_name.clone(),
            file_ref: suggested_path(owner, &file.file_name),
            size_bytes: file.size_bytes,
            content_hash: file.content_hash.clone(),
            uploaded_by: uploaded_by.clone(),
            uploaded_at: now,
        })
        .collect()
}
