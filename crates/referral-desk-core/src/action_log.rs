use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{Action, ActionId, ActionKind, ReferralId, UserId};

/// Append-only, creation-ordered history of a referral.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct ActionLog {
    entries: Vec<Action>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActionSummary {
    pub replies: usize,
    pub notes: usize,
    pub decisions: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_action_at: Option<OffsetDateTime>,
}

impl ActionLog {
    /// Builds a log from stored rows in any order.
    #[must_use]
    pub fn from_entries(mut entries: Vec<Action>) -> Self {
        entries.sort_by(|lhs, rhs| {
            lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
        });
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[Action] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&Action> {
        self.entries.last()
    }

    #[must_use]
    pub fn has_kind(&self, kind: ActionKind) -> bool {
        self.entries.iter().any(|action| action.kind == kind)
    }

    /// Builds the next entry without appending it.
    ///
    /// The timestamp never goes backwards relative to the latest entry, so a clock
    /// step between requests cannot reorder history.
    #[must_use]
    pub fn draft(
        &self,
        referral_id: ReferralId,
        author: &UserId,
        kind: ActionKind,
        content: impl Into<String>,
        now: OffsetDateTime,
    ) -> Action {
        let created_at = match self.latest() {
            Some(latest) if latest.created_at > now => latest.created_at,
            _ => now,
        };
        Action {
            id: ActionId::new(),
            referral_id,
            author: author.clone(),
            kind,
            content: content.into(),
            created_at,
        }
    }

    pub fn push(&mut self, action: Action) {
        self.entries.push(action);
    }

    #[must_use]
    pub fn summary(&self) -> ActionSummary {
        let mut summary = ActionSummary::default();
        for action in &self.entries {
            match action.kind {
                ActionKind::Reply => summary.replies += 1,
                ActionKind::Note => summary.notes += 1,
                ActionKind::Decision => summary.decisions += 1,
            }
        }
        summary.last_action_at = self.latest().map(|action| action.created_at);
        summary
    }
}
