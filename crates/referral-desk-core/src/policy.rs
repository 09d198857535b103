//! Capability matrix over principal, resource, and operation.
//!
//! Rules only ever grant, so the union of every matching rule equals the
//! first-match reading of the role table: no later rule can take away a right an
//! earlier one gave. The order below follows that table.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::DeskError;
use crate::{Principal, Referral, Thread, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    View,
    Assign,
    Reply,
    Close,
    EditIntake,
    Create,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Assign => "assign",
            Self::Reply => "reply",
            Self::Close => "close",
            Self::EditIntake => "edit_intake",
            Self::Create => "create",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Referral,
    Thread,
    Intake,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Referral => "referral",
            Self::Thread => "thread",
            Self::Intake => "intake",
        }
    }
}

/// The thing an operation targets. An intake is addressed through its referral.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    Referral(&'a Referral),
    Thread(&'a Thread),
    Intake(&'a Referral),
}

impl Resource<'_> {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Referral(_) => ResourceKind::Referral,
            Self::Thread(_) => ResourceKind::Thread,
            Self::Intake(_) => ResourceKind::Intake,
        }
    }

    fn creator(&self) -> &UserId {
        match self {
            Self::Referral(referral) | Self::Intake(referral) => &referral.created_by,
            Self::Thread(thread) => &thread.sender,
        }
    }

    fn holder(&self) -> Option<&UserId> {
        match self {
            Self::Referral(referral) | Self::Intake(referral) => referral.assignee.as_ref(),
            Self::Thread(thread) => Some(&thread.recipient),
        }
    }
}

use Operation::{Assign, Close, EditIntake, Reply, View};

const STAFF_CASE: &[Operation] = &[View, Assign, Close];
const INTAKE_EDITOR: &[Operation] = &[View, EditIntake];
const PARTICIPANT: &[Operation] = &[View, Reply, Close];
const CASE_HOLDER: &[Operation] = &[View, Reply, Close, Assign];
const SPECIALIST_CASE: &[Operation] = &[Assign, View];

/// Operations granted to `principal` on `resource`.
#[must_use]
pub fn allowed_operations(principal: &Principal, resource: Resource<'_>) -> BTreeSet<Operation> {
    let mut granted = BTreeSet::new();
    if !principal.active {
        return granted;
    }

    let is_creator = resource.creator() == &principal.id;
    let is_holder = resource.holder() == Some(&principal.id);

    if principal.is_elevated() {
        granted.extend(match resource {
            Resource::Intake(_) => INTAKE_EDITOR,
            Resource::Referral(_) | Resource::Thread(_) => STAFF_CASE,
        });
    }

    match resource {
        Resource::Referral(_) => {
            if is_creator {
                granted.extend(PARTICIPANT);
            }
            if is_holder {
                granted.extend(CASE_HOLDER);
            }
            if principal.is_specialist() {
                granted.extend(SPECIALIST_CASE);
            }
        }
        Resource::Thread(_) => {
            if is_creator || is_holder {
                granted.extend(PARTICIPANT);
            }
        }
        Resource::Intake(_) => {
            if principal.is_specialist() {
                granted.extend(INTAKE_EDITOR);
            }
        }
    }

    granted
}

#[must_use]
pub fn can(principal: &Principal, resource: Resource<'_>, operation: Operation) -> bool {
    allowed_operations(principal, resource).contains(&operation)
}

/// Opening a referral or thread needs an active account with a role or staff flag.
#[must_use]
pub fn can_create(principal: &Principal) -> bool {
    principal.active && (principal.role.is_some() || principal.elevated)
}

/// # Errors
/// Returns [`DeskError::Forbidden`] when [`can`] denies the operation.
pub fn authorize(
    principal: &Principal,
    resource: Resource<'_>,
    operation: Operation,
) -> Result<(), DeskError> {
    if can(principal, resource, operation) {
        Ok(())
    } else {
        Err(DeskError::Forbidden {
            principal: principal.id.clone(),
            operation,
            resource: resource.kind(),
        })
    }
}

/// # Errors
/// Returns [`DeskError::Forbidden`] when the principal is inactive or has no role.
pub fn authorize_create(principal: &Principal, resource: ResourceKind) -> Result<(), DeskError> {
    if can_create(principal) {
        Ok(())
    } else {
        Err(DeskError::Forbidden {
            principal: principal.id.clone(),
            operation: Operation::Create,
            resource,
        })
    }
}
