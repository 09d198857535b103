use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod action_log;
pub mod attachments;
pub mod config;
pub mod directory;
pub mod error;
pub mod intake;
pub mod lifecycle;
pub mod name_key;
pub mod policy;
pub mod reference;
pub mod threads;

pub use action_log::{ActionLog, ActionSummary};
pub use attachments::IncomingFile;
pub use config::DeskConfig;
pub use directory::{CaseDirectory, ReportTotals, Scope, ScopeCounts, StudentGroup};
pub use error::{AttachmentRejection, DeskError, FieldErrors};
pub use intake::{CounselorIntake, IntakeAccess, IntakeForm};
pub use lifecycle::{AutoRouter, CaseChange, CaseFile, CounselorRouter, SubmitReferral};
pub use policy::{Operation, Resource, ResourceKind};
pub use threads::{Recipient, StartThread, ThreadChange, ThreadDirectory, ThreadFile, ThreadView};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReferralId(pub Ulid);

impl ReferralId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ulid::DecodeError`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ulid::DecodeError> {
        Ulid::from_string(value).map(Self)
    }
}

impl Default for ReferralId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReferralId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActionId(pub Ulid);

impl ActionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ulid::DecodeError`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ulid::DecodeError> {
        Ulid::from_string(value).map(Self)
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ActionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AttachmentId(pub Ulid);

impl AttachmentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ulid::DecodeError`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ulid::DecodeError> {
        Ulid::from_string(value).map(Self)
    }
}

impl Default for AttachmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AttachmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(pub Ulid);

impl ThreadId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ulid::DecodeError`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ulid::DecodeError> {
        Ulid::from_string(value).map(Self)
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub Ulid);

impl MessageId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ulid::DecodeError`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ulid::DecodeError> {
        Ulid::from_string(value).map(Self)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IntakeId(pub Ulid);

impl IntakeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ulid::DecodeError`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ulid::DecodeError> {
        Ulid::from_string(value).map(Self)
    }
}

impl Default for IntakeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for IntakeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque account identifier owned by the hosting layer.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Staff roles known to the school. Exactly one per principal, or none.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Manager,
    Counselor,
    StudentAffairsDeputy,
    SchoolAffairsDeputy,
    EducationalAffairsDeputy,
    Administrative,
    Teacher,
}

impl Role {
    pub const ALL: [Self; 7] = [
        Self::Manager,
        Self::Counselor,
        Self::StudentAffairsDeputy,
        Self::SchoolAffairsDeputy,
        Self::EducationalAffairsDeputy,
        Self::Administrative,
        Self::Teacher,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Counselor => "counselor",
            Self::StudentAffairsDeputy => "student_affairs_deputy",
            Self::SchoolAffairsDeputy => "school_affairs_deputy",
            Self::EducationalAffairsDeputy => "educational_affairs_deputy",
            Self::Administrative => "administrative",
            Self::Teacher => "teacher",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.as_str() == value)
    }

    #[must_use]
    pub fn is_deputy(self) -> bool {
        matches!(
            self,
            Self::StudentAffairsDeputy | Self::SchoolAffairsDeputy | Self::EducationalAffairsDeputy
        )
    }
}

/// Authorization tier derived from a [`Principal`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Standing {
    Elevated,
    Specialist,
    Member,
}

impl Standing {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Elevated => "elevated",
            Self::Specialist => "specialist",
            Self::Member => "member",
        }
    }
}

/// Authenticated actor as resolved by the hosting layer.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Principal {
    pub id: UserId,
    pub display_name: String,
    pub active: bool,
    pub role: Option<Role>,
    /// Staff flag granted outside the role table.
    pub elevated: bool,
}

impl Principal {
    #[must_use]
    pub fn standing(&self) -> Standing {
        if self.elevated || self.role == Some(Role::Manager) {
            Standing::Elevated
        } else if self.role == Some(Role::Counselor) {
            Standing::Specialist
        } else {
            Standing::Member
        }
    }

    #[must_use]
    pub fn is_elevated(&self) -> bool {
        self.standing() == Standing::Elevated
    }

    /// Specialist rights hold for counselors even when they are also staff.
    #[must_use]
    pub fn is_specialist(&self) -> bool {
        self.role == Some(Role::Counselor)
    }

    #[must_use]
    pub fn is_deputy(&self) -> bool {
        self.role.is_some_and(Role::is_deputy)
    }

    #[must_use]
    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            self.id.as_str()
        } else {
            &self.display_name
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferralStatus {
    New,
    UnderReview,
    SentToDeputy,
    Closed,
}

impl ReferralStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::UnderReview => "UNDER_REVIEW",
            Self::SentToDeputy => "SENT_TO_DEPUTY",
            Self::Closed => "CLOSED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(Self::New),
            "UNDER_REVIEW" => Some(Self::UnderReview),
            "SENT_TO_DEPUTY" => Some(Self::SentToDeputy),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    /// Edges of the referral state graph. Self-loops are not edges.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::UnderReview)
                | (Self::UnderReview, Self::SentToDeputy | Self::Closed)
                | (Self::SentToDeputy, Self::Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReferralType {
    Behavior,
    Academic,
    Health,
    Other,
}

impl ReferralType {
    pub const ALL: [Self; 4] = [Self::Behavior, Self::Academic, Self::Health, Self::Other];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Behavior => "behavior",
            Self::Academic => "academic",
            Self::Health => "health",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

/// School grade, 1 through 12.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub struct Grade(u8);

impl Grade {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 12;

    #[must_use]
    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Grade {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("grade {value} is outside 1..=12"))
    }
}

impl From<Grade> for u8 {
    fn from(value: Grade) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Referral {
    pub id: ReferralId,
    pub reference: String,
    pub student_name: String,
    pub civil_id: Option<String>,
    pub student_key: Option<String>,
    pub grade: Grade,
    pub referral_type: ReferralType,
    pub details: String,
    pub status: ReferralStatus,
    pub created_by: UserId,
    pub assignee: Option<UserId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub version: u32,
}

impl Referral {
    #[must_use]
    pub fn is_assigned_to(&self, user: &UserId) -> bool {
        self.assignee.as_ref() == Some(user)
    }

    /// Newest first, ties broken by id.
    #[must_use]
    pub fn recency_order(lhs: &Self, rhs: &Self) -> std::cmp::Ordering {
        rhs.created_at.cmp(&lhs.created_at).then_with(|| rhs.id.cmp(&lhs.id))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Reply,
    Note,
    Decision,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reply => "REPLY",
            Self::Note => "NOTE",
            Self::Decision => "DECISION",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "REPLY" => Some(Self::Reply),
            "NOTE" => Some(Self::Note),
            "DECISION" => Some(Self::Decision),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub referral_id: ReferralId,
    pub author: UserId,
    pub kind: ActionKind,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AttachmentOwner {
    Referral(ReferralId),
    Action(ActionId),
    Message(MessageId),
}

impl AttachmentOwner {
    #[must_use]
    pub fn kind_str(self) -> &'static str {
        match self {
            Self::Referral(_) => "referral",
            Self::Action(_) => "action",
            Self::Message(_) => "message",
        }
    }

    #[must_use]
    pub fn id_string(self) -> String {
        match self {
            Self::Referral(id) => id.to_string(),
            Self::Action(id) => id.to_string(),
            Self::Message(id) => id.to_string(),
        }
    }

    /// Rebuilds an owner from its stored `(kind, id)` pair.
    #[must_use]
    pub fn from_parts(kind: &str, id: &str) -> Option<Self> {
        match kind {
            "referral" => ReferralId::parse(id).ok().map(Self::Referral),
            "action" => ActionId::parse(id).ok().map(Self::Action),
            "message" => MessageId::parse(id).ok().map(Self::Message),
            _ => None,
        }
    }
}

/// Metadata pointer to a stored blob.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Attachment {
    pub id: AttachmentId,
    pub owner: AttachmentOwner,
    pub file_name: String,
    pub file_ref: String,
    pub size_bytes: u64,
    pub content_hash: Option<String>,
    pub uploaded_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadStatus {
    Open,
    Closed,
}

impl ThreadStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Thread {
    pub id: ThreadId,
    pub reference: String,
    pub subject: String,
    pub sender: UserId,
    pub recipient: UserId,
    pub status: ThreadStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub author: UserId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Message {
    /// Chronological order, ties broken by id.
    #[must_use]
    pub fn chronological(lhs: &Self, rhs: &Self) -> std::cmp::Ordering {
        lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
    }
}

/// Source of principals for assignment targets and routing.
pub trait PrincipalDirectory {
    type Error;

    /// # Errors
    /// Returns the directory's error when the lookup itself fails.
    fn principal(&self, id: &UserId) -> Result<Option<Principal>, Self::Error>;

    /// # Errors
    /// Returns the directory's error when the listing fails.
    fn active_principals(&self) -> Result<Vec<Principal>, Self::Error>;
}
