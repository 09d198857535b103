//! Scoped views over referrals for a single principal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::action_log::{ActionLog, ActionSummary};
use crate::config::DirectorySettings;
use crate::name_key;
use crate::policy::{self, Operation, Resource};
use crate::{Principal, Referral, ReferralId, ReferralStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    All,
    Sent,
    Inbox,
}

impl Scope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Sent => "sent",
            Self::Inbox => "inbox",
        }
    }

    /// Unknown scopes fall back to `all`.
    #[must_use]
    pub fn parse_or_all(value: &str) -> Self {
        match value {
            "sent" => Self::Sent,
            "inbox" => Self::Inbox,
            _ => Self::All,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScopeCounts {
    pub all: usize,
    pub sent: usize,
    pub inbox: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReportTotals {
    pub all: usize,
    pub open: usize,
    pub closed: usize,
    pub sent: usize,
    pub inbox: usize,
    pub recent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GroupKey {
    Student(String),
    /// Referral whose name folded to nothing; it never merges with others.
    Referral(ReferralId),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StudentGroup {
    pub key: GroupKey,
    pub display_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub latest_activity: OffsetDateTime,
    pub referrals: Vec<Referral>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StudentGrouping {
    pub groups: Vec<StudentGroup>,
    /// Keys computed during grouping, to be written back by the caller.
    pub assigned_keys: Vec<(ReferralId, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CaseSummary {
    pub referral_id: ReferralId,
    pub reference: String,
    pub status: ReferralStatus,
    pub actions: ActionSummary,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
}

#[must_use]
pub fn summarize(referral: &Referral, actions: &ActionLog) -> CaseSummary {
    let actions = actions.summary();
    let last_activity = actions
        .last_action_at
        .map_or(referral.updated_at, |at| at.max(referral.updated_at));
    CaseSummary {
        referral_id: referral.id,
        reference: referral.reference.clone(),
        status: referral.status,
        actions,
        last_activity,
    }
}

pub struct CaseDirectory<'a> {
    referrals: &'a [Referral],
    settings: &'a DirectorySettings,
}

impl<'a> CaseDirectory<'a> {
    #[must_use]
    pub fn new(referrals: &'a [Referral], settings: &'a DirectorySettings) -> Self {
        Self { referrals, settings }
    }

    fn in_scope(&self, principal: &Principal, referral: &Referral, scope: Scope) -> bool {
        let created = referral.created_by == principal.id;
        if principal.is_elevated() {
            return match scope {
                Scope::All => true,
                Scope::Sent => created || self.settings.elevated_sent_is_all,
                Scope::Inbox => !created,
            };
        }
        let assigned = referral.is_assigned_to(&principal.id);
        match scope {
            Scope::All => created || assigned,
            Scope::Sent => created,
            Scope::Inbox => assigned,
        }
    }

    /// Newest first, ties broken by id.
    #[must_use]
    pub fn list_for(&self, principal: &Principal, scope: Scope) -> Vec<&'a Referral> {
        if !principal.active {
            return Vec::new();
        }
        let mut listed = self
            .referrals
            .iter()
            .filter(|referral| self.in_scope(principal, referral, scope))
            .collect::<Vec<_>>();
        listed.sort_by(|lhs, rhs| Referral::recency_order(lhs, rhs));
        listed
    }

    #[must_use]
    pub fn counts(&self, principal: &Principal) -> ScopeCounts {
        ScopeCounts {
            all: self.list_for(principal, Scope::All).len(),
            sent: self.list_for(principal, Scope::Sent).len(),
            inbox: self.list_for(principal, Scope::Inbox).len(),
        }
    }

    /// Every referral the principal may view, newest first.
    fn visible_to(&self, principal: &Principal) -> Vec<&'a Referral> {
        let mut visible = self
            .referrals
            .iter()
            .filter(|referral| policy::can(principal, Resource::Referral(referral), Operation::View))
            .collect::<Vec<_>>();
        visible.sort_by(|lhs, rhs| Referral::recency_order(lhs, rhs));
        visible
    }

    /// Groups every referral the principal may view by student key. Groups come out
    /// ordered by their newest member.
    #[must_use]
    pub fn group_by_student(&self, principal: &Principal) -> StudentGrouping {
        let mut grouping = StudentGrouping::default();
        let mut index: BTreeMap<GroupKey, usize> = BTreeMap::new();

        for referral in self.visible_to(principal) {
            let mut member = referral.clone();
            if let Some(key) = name_key::ensure_student_key(&mut member) {
                grouping.assigned_keys.push((member.id, key));
            }
            let key = match member.student_key.as_deref() {
                Some(key) if !key.is_empty() => GroupKey::Student(key.to_string()),
                _ => GroupKey::Referral(member.id),
            };

            if let Some(&slot) = index.get(&key) {
                let group = &mut grouping.groups[slot];
                group.latest_activity = group.latest_activity.max(member.updated_at);
                group.referrals.push(member);
            } else {
                index.insert(key.clone(), grouping.groups.len());
                grouping.groups.push(StudentGroup {
                    key,
                    display_name: member.student_name.clone(),
                    latest_activity: member.updated_at,
                    referrals: vec![member],
                });
            }
        }

        grouping
    }

    /// Other referrals for the same student the principal may view.
    #[must_use]
    pub fn related_cases(&self, referral: &Referral, principal: &Principal) -> Vec<&'a Referral> {
        let key = name_key::effective_key(referral);
        if key.is_empty() {
            return Vec::new();
        }
        let mut related = self
            .visible_to(principal)
            .into_iter()
            .filter(|candidate| candidate.id != referral.id)
            .filter(|candidate| name_key::effective_key(candidate) == key)
            .collect::<Vec<_>>();
        related.truncate(self.settings.related_cases_limit);
        related
    }

    /// Totals over referrals the principal created or holds.
    #[must_use]
    pub fn report_totals(&self, principal: &Principal, now: OffsetDateTime) -> ReportTotals {
        let window_start = now.saturating_sub(self.settings.report_window());
        let mut totals = ReportTotals::default();
        for referral in self.referrals {
            let sent = referral.created_by == principal.id;
            let inbox = referral.is_assigned_to(&principal.id);
            if !sent && !inbox {
                continue;
            }
            totals.all += 1;
            if referral.status == ReferralStatus::Closed {
                totals.closed += 1;
            } else {
                totals.open += 1;
            }
            if sent {
                totals.sent += 1;
            }
            if inbox {
                totals.inbox += 1;
            }
            if referral.created_at >= window_start {
                totals.recent += 1;
            }
        }
        totals
    }
}
