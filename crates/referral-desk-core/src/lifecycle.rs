//! Guarded referral transitions.
//!
//! Every function here is pure: it reads a [`CaseFile`] snapshot and returns a
//! [`CaseChange`] for the store to persist under an optimistic version check.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::action_log::ActionLog;
use crate::attachments::{self, IncomingFile};
use crate::config::{DeskConfig, RoutingSettings};
use crate::error::{DeskError, FieldErrors};
use crate::intake::CounselorIntake;
use crate::name_key;
use crate::policy::{self, Operation, Resource, ResourceKind};
use crate::reference::{self, ReferencePrefix};
use crate::{
    Action, ActionKind, Attachment, AttachmentOwner, Grade, Principal, Referral, ReferralId,
    ReferralStatus, ReferralType, Role, UserId,
};

/// Consistent snapshot of a referral and everything hanging off it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CaseFile {
    pub referral: Referral,
    pub actions: ActionLog,
    pub attachments: Vec<Attachment>,
    pub intake: Option<CounselorIntake>,
}

/// New referral state plus rows to append.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CaseChange {
    pub referral: Referral,
    /// `None` when the referral is being created.
    pub expected_version: Option<u32>,
    pub actions: Vec<Action>,
    pub attachments: Vec<Attachment>,
}

impl CaseChange {
    fn update(case: &CaseFile, mut referral: Referral, now: OffsetDateTime) -> Self {
        referral.updated_at = now;
        referral.version = case.referral.version + 1;
        Self {
            referral,
            expected_version: Some(case.referral.version),
            actions: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

/// Hosting-layer input for a new referral. Fields arrive unvalidated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SubmitReferral {
    pub student_name: String,
    pub civil_id: Option<String>,
    pub grade: u8,
    pub referral_type: String,
    pub details: String,
}

/// Picks an initial assignee for a freshly submitted referral.
pub trait AutoRouter {
    fn route(&self, referral: &Referral, submitter: &Principal) -> Option<Principal>;
}

/// Leaves every referral unassigned.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRouting;

impl AutoRouter for NoRouting {
    fn route(&self, _referral: &Referral, _submitter: &Principal) -> Option<Principal> {
        None
    }
}

/// Routes configured referral types to the first active counselor by id.
#[derive(Debug, Clone)]
pub struct CounselorRouter<'a> {
    candidates: &'a [Principal],
    settings: &'a RoutingSettings,
}

impl<'a> CounselorRouter<'a> {
    #[must_use]
    pub fn new(candidates: &'a [Principal], settings: &'a RoutingSettings) -> Self {
        Self { candidates, settings }
    }
}

impl AutoRouter for CounselorRouter<'_> {
    fn route(&self, referral: &Referral, submitter: &Principal) -> Option<Principal> {
        if !self.settings.routes(referral.referral_type) {
            return None;
        }
        self.candidates
            .iter()
            .filter(|candidate| {
                candidate.active
                    && candidate.role == Some(Role::Counselor)
                    && candidate.id != submitter.id
            })
            .min_by(|lhs, rhs| lhs.id.cmp(&rhs.id))
            .cloned()
    }
}

struct ValidSubmission {
    student_name: String,
    grade: Grade,
    referral_type: ReferralType,
    details: String,
}

fn validate_submission(
    input: &SubmitReferral,
    config: &DeskConfig,
) -> Result<ValidSubmission, DeskError> {
    let mut errors = FieldErrors::new();

    let student_name = input.student_name.trim();
    if student_name.is_empty() {
        errors.insert("student_name".to_string(), "student name is required".to_string());
    } else if student_name.chars().count() > config.referrals.max_student_name_chars {
        errors.insert(
            "student_name".to_string(),
            format!(
                "student name must be at most {} characters",
                config.referrals.max_student_name_chars
            ),
        );
    }

    let grade = Grade::new(input.grade);
    if grade.is_none() {
        errors.insert(
            "grade".to_string(),
            format!("grade must be between {} and {}", Grade::MIN, Grade::MAX),
        );
    }

    let referral_type = ReferralType::parse(input.referral_type.trim());
    if referral_type.is_none() {
        errors.insert("referral_type".to_string(), "unknown referral type".to_string());
    }

    let details = input.details.trim();
    if details.chars().count() < config.referrals.min_details_chars {
        errors.insert(
            "details".to_string(),
            format!("details must be at least {} characters", config.referrals.min_details_chars),
        );
    }

    match (grade, referral_type) {
        (Some(grade), Some(referral_type)) if errors.is_empty() => Ok(ValidSubmission {
            student_name: student_name.to_string(),
            grade,
            referral_type,
            details: details.to_string(),
        }),
        _ => Err(DeskError::ValidationFailed(errors)),
    }
}

/// Creates a referral in `NEW`, or `UNDER_REVIEW` when the router picks an assignee.
///
/// # Errors
/// Returns [`DeskError::Forbidden`] for inactive principals,
/// [`DeskError::ValidationFailed`] for bad fields, and
/// [`DeskError::AttachmentRejected`] when the attachment batch is refused.
pub fn submit(
    principal: &Principal,
    input: &SubmitReferral,
    files: &[IncomingFile],
    router: &dyn AutoRouter,
    config: &DeskConfig,
    now: OffsetDateTime,
) -> Result<CaseChange, DeskError> {
    policy::authorize_create(principal, ResourceKind::Referral)?;
    let ValidSubmission { student_name, grade, referral_type, details } =
        validate_submission(input, config)?;
    attachments::check_batch(&config.attachments, files)?;

    let civil_id =
        input.civil_id.as_deref().map(str::trim).filter(|value| !value.is_empty()).map(String::from);
    let student_key = name_key::derive_key(&student_name, civil_id.as_deref());
    let mut referral = Referral {
        id: ReferralId::new(),
        reference: reference::generate_reference(ReferencePrefix::Referral, now),
        student_name,
        civil_id,
        student_key: Some(student_key),
        grade,
        referral_type,
        details,
        status: ReferralStatus::New,
        created_by: principal.id.clone(),
        assignee: None,
        created_at: now,
        updated_at: now,
        version: 1,
    };

    let mut actions = Vec::new();
    if let Some(target) = router.route(&referral, principal) {
        referral.assignee = Some(target.id.clone());
        referral.status = ReferralStatus::UnderReview;
        actions.push(ActionLog::default().draft(
            referral.id,
            &principal.id,
            ActionKind::Note,
            format!("auto-routed to {}", target.label()),
            now,
        ));
    }

    let attachments =
        attachments::bind(AttachmentOwner::Referral(referral.id), files, &principal.id, now);
    Ok(CaseChange { referral, expected_version: None, actions, attachments })
}

fn ensure_open(case: &CaseFile) -> Result<(), DeskError> {
    if case.referral.status.is_terminal() {
        return Err(DeskError::Closed {
            entity: "referral",
            reference: case.referral.reference.clone(),
        });
    }
    Ok(())
}

fn active_target<'a>(
    target_id: &UserId,
    target: Option<&'a Principal>,
) -> Result<&'a Principal, DeskError> {
    match target {
        Some(principal) if principal.active && principal.id == *target_id => Ok(principal),
        _ => Err(DeskError::InvalidAssignee { target: target_id.clone() }),
    }
}

/// Re-routes a referral. `target` is the directory lookup for `target_id`.
///
/// # Errors
/// Returns [`DeskError::Forbidden`] without `assign`, [`DeskError::Closed`] on a closed
/// referral, and [`DeskError::InvalidAssignee`] when the target is unknown or inactive.
pub fn assign(
    principal: &Principal,
    case: &CaseFile,
    target_id: &UserId,
    target: Option<&Principal>,
    now: OffsetDateTime,
) -> Result<CaseChange, DeskError> {
    policy::authorize(principal, Resource::Referral(&case.referral), Operation::Assign)?;
    ensure_open(case)?;
    let target = active_target(target_id, target)?;

    let mut referral = case.referral.clone();
    referral.assignee = Some(target.id.clone());
    if referral.status == ReferralStatus::New {
        referral.status = ReferralStatus::UnderReview;
    }
    let mut change = CaseChange::update(case, referral, now);
    change.actions.push(case.actions.draft(
        case.referral.id,
        &principal.id,
        ActionKind::Note,
        format!("reassigned to {}", target.label()),
        now,
    ));
    Ok(change)
}

/// Hands an under-review referral to a deputy.
///
/// # Errors
/// Returns [`DeskError::Forbidden`] without `assign`, [`DeskError::Closed`] on a closed
/// referral, [`DeskError::InvalidTransition`] unless the referral is under review, and
/// [`DeskError::InvalidAssignee`] when the target is not an active deputy.
pub fn escalate_to_deputy(
    principal: &Principal,
    case: &CaseFile,
    deputy_id: &UserId,
    deputy: Option<&Principal>,
    now: OffsetDateTime,
) -> Result<CaseChange, DeskError> {
    policy::authorize(principal, Resource::Referral(&case.referral), Operation::Assign)?;
    ensure_open(case)?;
    let from = case.referral.status;
    if !from.can_transition_to(ReferralStatus::SentToDeputy) {
        return Err(DeskError::InvalidTransition { from, to: ReferralStatus::SentToDeputy });
    }
    let deputy = active_target(deputy_id, deputy)?;
    if !deputy.is_deputy() {
        return Err(DeskError::InvalidAssignee { target: deputy_id.clone() });
    }

    let mut referral = case.referral.clone();
    referral.assignee = Some(deputy.id.clone());
    referral.status = ReferralStatus::SentToDeputy;
    let mut change = CaseChange::update(case, referral, now);
    change.actions.push(case.actions.draft(
        case.referral.id,
        &principal.id,
        ActionKind::Note,
        format!("sent to deputy {}", deputy.label()),
        now,
    ));
    Ok(change)
}

/// Appends a reply. Replies on closed referrals are accepted and do not reopen them.
///
/// # Errors
/// Returns [`DeskError::Forbidden`] without `view`, [`DeskError::EmptyReply`] when
/// there is neither text nor a file, and [`DeskError::AttachmentRejected`] for a bad
/// batch.
pub fn reply(
    principal: &Principal,
    case: &CaseFile,
    content: &str,
    files: &[IncomingFile],
    config: &DeskConfig,
    now: OffsetDateTime,
) -> Result<CaseChange, DeskError> {
    policy::authorize(principal, Resource::Referral(&case.referral), Operation::View)?;
    let content = content.trim();
    if content.is_empty() && files.is_empty() {
        return Err(DeskError::EmptyReply);
    }
    attachments::check_batch(&config.attachments, files)?;

    let mut referral = case.referral.clone();
    if referral.status == ReferralStatus::New {
        referral.status = ReferralStatus::UnderReview;
    }
    let action =
        case.actions.draft(case.referral.id, &principal.id, ActionKind::Reply, content, now);
    let mut change = CaseChange::update(case, referral, now);
    change.attachments =
        attachments::bind(AttachmentOwner::Action(action.id), files, &principal.id, now);
    change.actions.push(action);
    Ok(change)
}

/// # Errors
/// Returns [`DeskError::Forbidden`] without `close`, [`DeskError::Closed`] when already
/// closed, [`DeskError::NoActionYet`] before any reply or recommendation, and
/// [`DeskError::InvalidTransition`] from `NEW`.
pub fn close(
    principal: &Principal,
    case: &CaseFile,
    now: OffsetDateTime,
) -> Result<CaseChange, DeskError> {
    policy::authorize(principal, Resource::Referral(&case.referral), Operation::Close)?;
    ensure_open(case)?;

    let recommended = case.intake.as_ref().is_some_and(CounselorIntake::has_recommendations);
    if !case.actions.has_kind(ActionKind::Reply) && !recommended {
        return Err(DeskError::NoActionYet);
    }
    let from = case.referral.status;
    if !from.can_transition_to(ReferralStatus::Closed) {
        return Err(DeskError::InvalidTransition { from, to: ReferralStatus::Closed });
    }

    let mut referral = case.referral.clone();
    referral.status = ReferralStatus::Closed;
    let mut change = CaseChange::update(case, referral, now);
    change.actions.push(case.actions.draft(
        case.referral.id,
        &principal.id,
        ActionKind::Decision,
        "closed",
        now,
    ));
    Ok(change)
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::intake::IntakeForm;

    fn principal(id: &str, role: Option<Role>) -> Principal {
        Principal {
            id: UserId::from(id),
            display_name: format!("{id} display"),
            active: true,
            role,
            elevated: false,
        }
    }

    fn input() -> SubmitReferral {
        SubmitReferral {
            student_name: "  Salem Nasser ".to_string(),
            civil_id: None,
            grade: 8,
            referral_type: "behavior".to_string(),
            details: "Repeated conflicts during recess".to_string(),
        }
    }

    fn submitted(config: &DeskConfig) -> CaseFile {
        let teacher = principal("teacher", Some(Role::Teacher));
        match submit(&teacher, &input(), &[], &NoRouting, config, OffsetDateTime::UNIX_EPOCH) {
            Ok(change) => CaseFile {
                referral: change.referral,
                actions: ActionLog::from_entries(change.actions),
                attachments: change.attachments,
                intake: None,
            },
            Err(err) => panic!("submit should succeed: {err}"),
        }
    }

    fn apply(case: &CaseFile, change: CaseChange) -> CaseFile {
        let mut actions = case.actions.clone();
        for action in change.actions {
            actions.push(action);
        }
        let mut attachments = case.attachments.clone();
        attachments.extend(change.attachments);
        CaseFile { referral: change.referral, actions, attachments, intake: case.intake.clone() }
    }

    // Test IDs: LC-001
    #[test]
    fn submit_creates_new_referral_with_key_and_reference() {
        let case = submitted(&DeskConfig::default());
        assert_eq!(case.referral.status, ReferralStatus::New);
        assert_eq!(case.referral.student_name, "Salem Nasser");
        assert_eq!(case.referral.student_key.as_deref(), Some("Salem-Nasser"));
        assert!(reference::is_reference(&case.referral.reference));
        assert_eq!(case.referral.version, 1);
        assert!(case.actions.is_empty());
    }

    // Test IDs: LC-002
    #[test]
    fn submit_reports_all_bad_fields() {
        let teacher = principal("teacher", Some(Role::Teacher));
        let bad = SubmitReferral {
            student_name: " ".to_string(),
            civil_id: None,
            grade: 13,
            referral_type: "attendance".to_string(),
            details: "short".to_string(),
        };
        match submit(&teacher, &bad, &[], &NoRouting, &DeskConfig::default(), OffsetDateTime::UNIX_EPOCH)
        {
            Err(DeskError::ValidationFailed(errors)) => {
                assert_eq!(errors.len(), 4);
                assert!(errors.contains_key("referral_type"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn submit_rejects_bad_attachments_before_creating_anything() {
        let teacher = principal("teacher", Some(Role::Teacher));
        let files = vec![IncomingFile::new("notes.pdf", 5), IncomingFile::new("virus.exe", 5)];
        assert!(matches!(
            submit(&teacher, &input(), &files, &NoRouting, &DeskConfig::default(), OffsetDateTime::UNIX_EPOCH),
            Err(DeskError::AttachmentRejected(_))
        ));
    }

    // Test IDs: LC-003
    #[test]
    fn counselor_router_assigns_first_active_counselor() {
        let config = DeskConfig::default();
        let teacher = principal("teacher", Some(Role::Teacher));
        let mut retired = principal("a-counselor", Some(Role::Counselor));
        retired.active = false;
        let candidates = vec![
            principal("z-counselor", Some(Role::Counselor)),
            retired,
            principal("m-counselor", Some(Role::Counselor)),
            principal("b-teacher", Some(Role::Teacher)),
        ];
        let router = CounselorRouter::new(&candidates, &config.routing);
        match submit(&teacher, &input(), &[], &router, &config, OffsetDateTime::UNIX_EPOCH) {
            Ok(change) => {
                assert_eq!(change.referral.assignee, Some(UserId::from("m-counselor")));
                assert_eq!(change.referral.status, ReferralStatus::UnderReview);
                assert_eq!(change.actions.len(), 1);
                assert_eq!(change.actions[0].kind, ActionKind::Note);
            }
            Err(err) => panic!("submit should succeed: {err}"),
        }
    }

    #[test]
    fn router_respects_configured_types() {
        let mut settings = RoutingSettings::default();
        settings.referral_types = vec![ReferralType::Health];
        let candidates = vec![principal("c1", Some(Role::Counselor))];
        let router = CounselorRouter::new(&candidates, &settings);
        let case = submitted(&DeskConfig::default());
        assert!(router.route(&case.referral, &principal("teacher", None)).is_none());
    }

    // Test IDs: LC-004
    #[test]
    fn close_requires_a_reply() {
        let manager = principal("manager", Some(Role::Manager));
        let case = submitted(&DeskConfig::default());
        assert_eq!(close(&manager, &case, OffsetDateTime::UNIX_EPOCH), Err(DeskError::NoActionYet));
    }

    // Test IDs: LC-005
    #[test]
    fn reply_then_close_then_second_close_fails() {
        let config = DeskConfig::default();
        let teacher = principal("teacher", Some(Role::Teacher));
        let case = submitted(&config);
        let later = OffsetDateTime::UNIX_EPOCH + Duration::minutes(1);

        let replied = match reply(&teacher, &case, "Parents contacted", &[], &config, later) {
            Ok(change) => apply(&case, change),
            Err(err) => panic!("reply should succeed: {err}"),
        };
        assert_eq!(replied.referral.status, ReferralStatus::UnderReview);
        assert_eq!(replied.referral.version, 2);

        let closed = match close(&teacher, &replied, later) {
            Ok(change) => {
                assert_eq!(change.expected_version, Some(2));
                apply(&replied, change)
            }
            Err(err) => panic!("close should succeed: {err}"),
        };
        assert_eq!(closed.referral.status, ReferralStatus::Closed);
        assert_eq!(closed.actions.latest().map(|a| a.kind), Some(ActionKind::Decision));

        assert!(matches!(close(&teacher, &closed, later), Err(DeskError::Closed { .. })));
    }

    #[test]
    fn recommendations_satisfy_the_close_guard() {
        let counselor = principal("counselor", Some(Role::Counselor));
        let config = DeskConfig::default();
        let mut case = submitted(&config);
        case.referral.status = ReferralStatus::UnderReview;
        case.referral.assignee = Some(counselor.id.clone());
        let mut intake = CounselorIntake::blank(case.referral.id, &counselor, OffsetDateTime::UNIX_EPOCH);
        intake.form = IntakeForm { counselor_name: "C".to_string(), ..IntakeForm::default() };
        intake.form.notes.recommendations = "Refer to clinic".to_string();
        case.intake = Some(intake);
        assert!(close(&counselor, &case, OffsetDateTime::UNIX_EPOCH).is_ok());
    }

    #[test]
    fn empty_reply_is_rejected() {
        let config = DeskConfig::default();
        let case = submitted(&config);
        let teacher = principal("teacher", Some(Role::Teacher));
        assert_eq!(
            reply(&teacher, &case, "   ", &[], &config, OffsetDateTime::UNIX_EPOCH),
            Err(DeskError::EmptyReply)
        );
        let files = vec![IncomingFile::new("scan.png", 10)];
        match reply(&teacher, &case, "", &files, &config, OffsetDateTime::UNIX_EPOCH) {
            Ok(change) => {
                assert_eq!(change.attachments.len(), 1);
                assert_eq!(change.attachments[0].owner, AttachmentOwner::Action(change.actions[0].id));
            }
            Err(err) => panic!("attachment-only reply should succeed: {err}"),
        }
    }

    // Test IDs: LC-006
    #[test]
    fn assign_moves_new_to_review_and_logs_note() {
        let config = DeskConfig::default();
        let case = submitted(&config);
        let manager = principal("manager", Some(Role::Manager));
        let counselor = principal("counselor", Some(Role::Counselor));
        match assign(&manager, &case, &counselor.id, Some(&counselor), OffsetDateTime::UNIX_EPOCH) {
            Ok(change) => {
                assert_eq!(change.referral.status, ReferralStatus::UnderReview);
                assert_eq!(change.referral.assignee, Some(counselor.id.clone()));
                assert_eq!(change.actions[0].content, "reassigned to counselor display");
            }
            Err(err) => panic!("assign should succeed: {err}"),
        }

        let mut gone = counselor.clone();
        gone.active = false;
        assert_eq!(
            assign(&manager, &case, &gone.id, Some(&gone), OffsetDateTime::UNIX_EPOCH),
            Err(DeskError::InvalidAssignee { target: gone.id.clone() })
        );
        assert!(matches!(
            assign(&manager, &case, &UserId::from("ghost"), None, OffsetDateTime::UNIX_EPOCH),
            Err(DeskError::InvalidAssignee { .. })
        ));
    }

    #[test]
    fn teacher_cannot_assign_own_referral() {
        let config = DeskConfig::default();
        let case = submitted(&config);
        let teacher = principal("teacher", Some(Role::Teacher));
        let counselor = principal("counselor", Some(Role::Counselor));
        assert!(matches!(
            assign(&teacher, &case, &counselor.id, Some(&counselor), OffsetDateTime::UNIX_EPOCH),
            Err(DeskError::Forbidden { .. })
        ));
    }

    // Test IDs: LC-007
    #[test]
    fn escalation_requires_review_and_a_deputy() {
        let config = DeskConfig::default();
        let manager = principal("manager", Some(Role::Manager));
        let deputy = principal("deputy", Some(Role::StudentAffairsDeputy));
        let teacher = principal("other-teacher", Some(Role::Teacher));
        let mut case = submitted(&config);

        assert_eq!(
            escalate_to_deputy(&manager, &case, &deputy.id, Some(&deputy), OffsetDateTime::UNIX_EPOCH),
            Err(DeskError::InvalidTransition {
                from: ReferralStatus::New,
                to: ReferralStatus::SentToDeputy
            })
        );

        case.referral.status = ReferralStatus::UnderReview;
        assert!(matches!(
            escalate_to_deputy(&manager, &case, &teacher.id, Some(&teacher), OffsetDateTime::UNIX_EPOCH),
            Err(DeskError::InvalidAssignee { .. })
        ));
        match escalate_to_deputy(&manager, &case, &deputy.id, Some(&deputy), OffsetDateTime::UNIX_EPOCH) {
            Ok(change) => {
                assert_eq!(change.referral.status, ReferralStatus::SentToDeputy);
                assert_eq!(change.referral.assignee, Some(deputy.id.clone()));
            }
            Err(err) => panic!("escalation should succeed: {err}"),
        }
    }

    #[test]
    fn reply_on_closed_referral_is_accepted_without_reopening() {
        let config = DeskConfig::default();
        let teacher = principal("teacher", Some(Role::Teacher));
        let mut case = submitted(&config);
        case.referral.status = ReferralStatus::Closed;
        match reply(&teacher, &case, "Follow-up note", &[], &config, OffsetDateTime::UNIX_EPOCH) {
            Ok(change) => assert_eq!(change.referral.status, ReferralStatus::Closed),
            Err(err) => panic!("reply should succeed: {err}"),
        }
    }
}
