//! Internal message threads: scoping, ranking, read state, and guarded mutations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::attachments::{self, IncomingFile};
use crate::config::{DeskConfig, ThreadSettings};
use crate::directory::{Scope, ScopeCounts};
use crate::error::DeskError;
use crate::policy::{self, Operation, Resource, ResourceKind};
use crate::reference::{self, ReferencePrefix};
use crate::{
    Attachment, AttachmentOwner, Message, MessageId, Principal, Thread, ThreadId, ThreadStatus,
    UserId,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ThreadFile {
    pub thread: Thread,
    pub messages: Vec<Message>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ThreadChange {
    pub thread: Thread,
    pub expected_version: Option<u32>,
    pub messages: Vec<Message>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "user", rename_all = "snake_case")]
pub enum Recipient {
    User(UserId),
    Everyone,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StartThread {
    pub recipient: Recipient,
    pub subject: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Supervising,
    Incoming,
}

/// One row of a principal's thread inbox.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ThreadView {
    pub thread: Thread,
    pub last_message: Option<Message>,
    pub unread: bool,
    pub is_new: bool,
    pub direction: Direction,
}

/// Latest message by `(created_at, id)`.
#[must_use]
pub fn latest_message(messages: &[Message]) -> Option<&Message> {
    messages.iter().max_by(|lhs, rhs| Message::chronological(lhs, rhs))
}

/// Unread means someone else spoke last.
#[must_use]
pub fn is_unread(viewer: &UserId, latest: Option<&Message>) -> bool {
    latest.is_some_and(|message| message.author != *viewer)
}

#[must_use]
pub fn direction(viewer: &Principal, thread: &Thread) -> Direction {
    if thread.sender == viewer.id {
        Direction::Outgoing
    } else if thread.recipient != viewer.id && viewer.is_elevated() {
        Direction::Supervising
    } else {
        Direction::Incoming
    }
}

fn ranking(lhs: &ThreadView, rhs: &ThreadView) -> std::cmp::Ordering {
    let lhs_latest = lhs.last_message.as_ref().map(|message| (message.created_at, message.id));
    let rhs_latest = rhs.last_message.as_ref().map(|message| (message.created_at, message.id));
    rhs_latest
        .cmp(&lhs_latest)
        .then_with(|| rhs.thread.updated_at.cmp(&lhs.thread.updated_at))
        .then_with(|| rhs.thread.created_at.cmp(&lhs.thread.created_at))
        .then_with(|| rhs.thread.id.cmp(&lhs.thread.id))
}

pub struct ThreadDirectory<'a> {
    threads: &'a [Thread],
    latest: BTreeMap<ThreadId, &'a Message>,
    settings: &'a ThreadSettings,
}

impl<'a> ThreadDirectory<'a> {
    /// `messages` may hold every message or only the latest per thread.
    #[must_use]
    pub fn new(threads: &'a [Thread], messages: &'a [Message], settings: &'a ThreadSettings) -> Self {
        let mut latest: BTreeMap<ThreadId, &'a Message> = BTreeMap::new();
        for message in messages {
            latest
                .entry(message.thread_id)
                .and_modify(|current| {
                    if Message::chronological(current, message).is_lt() {
                        *current = message;
                    }
                })
                .or_insert(message);
        }
        Self { threads, latest, settings }
    }

    fn visible(principal: &Principal, thread: &Thread) -> bool {
        principal.active
            && (principal.is_elevated()
                || thread.sender == principal.id
                || thread.recipient == principal.id)
    }

    fn in_scope(principal: &Principal, thread: &Thread, scope: Scope) -> bool {
        if !Self::visible(principal, thread) {
            return false;
        }
        let sent = thread.sender == principal.id;
        match scope {
            Scope::All => true,
            Scope::Sent => sent,
            Scope::Inbox if principal.is_elevated() => !sent,
            Scope::Inbox => thread.recipient == principal.id,
        }
    }

    /// Ranked inbox rows for `principal`.
    #[must_use]
    pub fn list_for(&self, principal: &Principal, scope: Scope, now: OffsetDateTime) -> Vec<ThreadView> {
        let window_start = now.saturating_sub(self.settings.recency_window());
        let mut views = self
            .threads
            .iter()
            .filter(|thread| Self::in_scope(principal, thread, scope))
            .map(|thread| {
                let last_message = self.latest.get(&thread.id).map(|message| (*message).clone());
                let unread = is_unread(&principal.id, last_message.as_ref());
                let is_new = unread
                    && last_message.as_ref().is_some_and(|message| message.created_at >= window_start);
                ThreadView {
                    thread: thread.clone(),
                    last_message,
                    unread,
                    is_new,
                    direction: direction(principal, thread),
                }
            })
            .collect::<Vec<_>>();
        views.sort_by(ranking);
        views
    }

    #[must_use]
    pub fn counts(&self, principal: &Principal) -> ScopeCounts {
        let count = |scope| {
            self.threads.iter().filter(|thread| Self::in_scope(principal, thread, scope)).count()
        };
        ScopeCounts { all: count(Scope::All), sent: count(Scope::Sent), inbox: count(Scope::Inbox) }
    }

    /// Threads with a latest message the principal has not answered.
    #[must_use]
    pub fn unread_count(&self, principal: &Principal) -> usize {
        self.threads
            .iter()
            .filter(|thread| Self::in_scope(principal, thread, Scope::All))
            .filter(|thread| is_unread(&principal.id, self.latest.get(&thread.id).copied()))
            .count()
    }
}

fn check_body(content: &str, files: &[IncomingFile], config: &DeskConfig) -> Result<(), DeskError> {
    if content.trim().is_empty() && files.is_empty() {
        return Err(DeskError::EmptyReply);
    }
    attachments::check_batch(&config.attachments, files)
}

/// Opens one thread per recipient. `candidates` are the principals the recipient is
/// resolved against.
///
/// # Errors
/// Returns [`DeskError::Forbidden`] for inactive senders, [`DeskError::ValidationFailed`]
/// for a blank or long subject, [`DeskError::EmptyReply`] without a body,
/// [`DeskError::AttachmentRejected`] for a bad batch, and [`DeskError::InvalidAssignee`]
/// when no active recipient remains.
pub fn start_thread(
    principal: &Principal,
    input: &StartThread,
    candidates: &[Principal],
    files: &[IncomingFile],
    config: &DeskConfig,
    now: OffsetDateTime,
) -> Result<Vec<ThreadChange>, DeskError> {
    policy::authorize_create(principal, ResourceKind::Thread)?;

    let subject = input.subject.trim();
    if subject.is_empty() {
        return Err(DeskError::field("subject", "subject is required"));
    }
    if subject.chars().count() > config.threads.max_subject_chars {
        return Err(DeskError::field(
            "subject",
            format!("subject must be at most {} characters", config.threads.max_subject_chars),
        ));
    }
    check_body(&input.content, files, config)?;

    let recipients = match &input.recipient {
        Recipient::User(target) => {
            let found = candidates
                .iter()
                .find(|candidate| candidate.id == *target && candidate.active && candidate.id != principal.id);
            match found {
                Some(recipient) => vec![recipient],
                None => return Err(DeskError::InvalidAssignee { target: target.clone() }),
            }
        }
        Recipient::Everyone => {
            let mut everyone = candidates
                .iter()
                .filter(|candidate| candidate.active && candidate.id != principal.id)
                .collect::<Vec<_>>();
            everyone.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
            everyone.dedup_by(|lhs, rhs| lhs.id == rhs.id);
            if everyone.is_empty() {
                return Err(DeskError::InvalidAssignee { target: UserId::from("*") });
            }
            everyone
        }
    };

    let content = input.content.trim();
    Ok(recipients
        .into_iter()
        .map(|recipient| {
            let thread = Thread {
                id: ThreadId::new(),
                reference: reference::generate_reference(ReferencePrefix::Thread, now),
                subject: subject.to_string(),
                sender: principal.id.clone(),
                recipient: recipient.id.clone(),
                status: ThreadStatus::Open,
                created_at: now,
                updated_at: now,
                version: 1,
            };
            let message = Message {
                id: MessageId::new(),
                thread_id: thread.id,
                author: principal.id.clone(),
                content: content.to_string(),
                created_at: now,
            };
            let attachments =
                attachments::bind(AttachmentOwner::Message(message.id), files, &principal.id, now);
            ThreadChange { thread, expected_version: None, messages: vec![message], attachments }
        })
        .collect())
}

fn ensure_open(file: &ThreadFile) -> Result<(), DeskError> {
    if file.thread.status == ThreadStatus::Closed {
        return Err(DeskError::Closed { entity: "thread", reference: file.thread.reference.clone() });
    }
    Ok(())
}

/// # Errors
/// Returns [`DeskError::Forbidden`] without `view`, [`DeskError::Closed`] on a closed
/// thread unless replies there are allowed, [`DeskError::EmptyReply`] without a body,
/// and [`DeskError::AttachmentRejected`] for a bad batch.
pub fn reply(
    principal: &Principal,
    file: &ThreadFile,
    content: &str,
    files: &[IncomingFile],
    config: &DeskConfig,
    now: OffsetDateTime,
) -> Result<ThreadChange, DeskError> {
    policy::authorize(principal, Resource::Thread(&file.thread), Operation::View)?;
    if !config.threads.allow_reply_when_closed {
        ensure_open(file)?;
    }
    check_body(content, files, config)?;

    let created_at = match latest_message(&file.messages) {
        Some(latest) if latest.created_at > now => latest.created_at,
        _ => now,
    };
    let message = Message {
        id: MessageId::new(),
        thread_id: file.thread.id,
        author: principal.id.clone(),
        content: content.trim().to_string(),
        created_at,
    };
    let mut thread = file.thread.clone();
    thread.updated_at = created_at;
    thread.version = file.thread.version + 1;
    let attachments =
        attachments::bind(AttachmentOwner::Message(message.id), files, &principal.id, now);
    Ok(ThreadChange {
        thread,
        expected_version: Some(file.thread.version),
        messages: vec![message],
        attachments,
    })
}

/// # Errors
/// Returns [`DeskError::Forbidden`] without `close` and [`DeskError::Closed`] when the
/// thread is already closed.
pub fn close_thread(
    principal: &Principal,
    file: &ThreadFile,
    now: OffsetDateTime,
) -> Result<ThreadChange, DeskError> {
    policy::authorize(principal, Resource::Thread(&file.thread), Operation::Close)?;
    ensure_open(file)?;
    let mut thread = file.thread.clone();
    thread.status = ThreadStatus::Closed;
    thread.updated_at = now;
    thread.version = file.thread.version + 1;
    Ok(ThreadChange {
        thread,
        expected_version: Some(file.thread.version),
        messages: Vec::new(),
        attachments: Vec::new(),
    })
}

/// Messages in conversation order.
///
/// # Errors
/// Returns [`DeskError::Forbidden`] without `view`.
pub fn thread_messages<'a>(
    principal: &Principal,
    file: &'a ThreadFile,
) -> Result<Vec<&'a Message>, DeskError> {
    policy::authorize(principal, Resource::Thread(&file.thread), Operation::View)?;
    let mut messages = file.messages.iter().collect::<Vec<_>>();
    messages.sort_by(|lhs, rhs| Message::chronological(lhs, rhs));
    Ok(messages)
}
