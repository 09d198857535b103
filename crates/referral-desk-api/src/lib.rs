use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use referral_desk_core::directory::{self, CaseSummary};
use referral_desk_core::lifecycle::{self, NoRouting};
use referral_desk_core::policy::{self, Operation, Resource};
use referral_desk_core::reference::{generate_reference, ReferencePrefix};
use referral_desk_core::{attachments, intake, threads};
use referral_desk_core::{
    Action, Attachment, AutoRouter, CaseChange, CaseDirectory, CounselorIntake, CounselorRouter,
    DeskConfig, DeskError, IncomingFile, IntakeAccess, IntakeForm, Message, Principal,
    PrincipalDirectory, Referral, ReferralId, ReportTotals, Scope, ScopeCounts, StartThread,
    StudentGroup, SubmitReferral, Thread, ThreadChange, ThreadDirectory, ThreadId, ThreadView, UserId,
};
use referral_desk_store_sqlite::{KeyRebuildSummary, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

const REFERENCE_ATTEMPTS: usize = 5;

/// Failure surfaced to the hosting layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Desk(#[from] DeskError),
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl ApiError {
    /// Recovers domain errors raised inside a store transaction.
    #[must_use]
    pub fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<DeskError>() {
            Ok(desk) => Self::Desk(desk),
            Err(other) => Self::Storage(other),
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Desk(err) => err.code(),
            Self::Storage(_) => "storage",
        }
    }

    #[must_use]
    pub fn desk(&self) -> Option<&DeskError> {
        match self {
            Self::Desk(err) => Some(err),
            Self::Storage(_) => None,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_store(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Destination for attachment bytes.
pub trait BlobStore {
    /// Persists `bytes` and returns the reference recorded on the attachment row.
    ///
    /// # Errors
    /// Returns an error when the bytes cannot be written.
    fn store(&self, bytes: &[u8], suggested_path: &str) -> anyhow::Result<String>;
}

/// Refuses every upload. Used when no blob backend is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedBlobStore;

impl BlobStore for DetachedBlobStore {
    fn store(&self, _bytes: &[u8], suggested_path: &str) -> anyhow::Result<String> {
        Err(anyhow!("no blob store configured; cannot store {suggested_path}"))
    }
}

/// Writes blobs below a root directory using the suggested relative path.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl BlobStore for FsBlobStore {
    fn store(&self, bytes: &[u8], suggested_path: &str) -> anyhow::Result<String> {
        let target = self.root.join(suggested_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create blob directory {}", parent.display())
            })?;
        }
        fs::write(&target, bytes)
            .with_context(|| format!("failed to write blob {}", target.display()))?;
        Ok(suggested_path.to_string())
    }
}

/// One uploaded file as received from the hosting layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    #[must_use]
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { file_name: file_name.into(), bytes }
    }

    fn incoming(&self) -> IncomingFile {
        let digest = Sha256::digest(&self.bytes);
        IncomingFile {
            file_name: self.file_name.clone(),
            size_bytes: u64::try_from(self.bytes.len()).unwrap_or(u64::MAX),
            content_hash: Some(format!("sha256:{}", hex::encode(digest))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralDetail {
    pub referral: Referral,
    pub actions: Vec<Action>,
    pub attachments: Vec<Attachment>,
    pub summary: CaseSummary,
    pub related: Vec<Referral>,
    pub allowed_operations: Vec<Operation>,
    pub has_intake: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralListing {
    pub scope: Scope,
    pub items: Vec<Referral>,
    pub counts: ScopeCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadListing {
    pub scope: Scope,
    pub items: Vec<ThreadView>,
    pub counts: ScopeCounts,
    pub unread: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadDetail {
    pub thread: Thread,
    pub messages: Vec<Message>,
    pub attachments: Vec<Attachment>,
    pub allowed_operations: Vec<Operation>,
}

/// Load and validate a YAML configuration file.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<DeskConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: DeskConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate().with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

fn refused(operation: &'static str, principal: &Principal, err: impl Into<ApiError>) -> ApiError {
    let err = err.into();
    if matches!(err, ApiError::Desk(DeskError::Forbidden { .. } | DeskError::Conflict { .. })) {
        warn!(operation, principal = %principal.id, code = err.code(), "operation refused");
    }
    err
}

fn is_reference_collision(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<DeskError>(), Some(DeskError::Conflict { entity: "reference", .. }))
}

#[derive(Debug, Clone)]
pub struct ReferralDeskApi<B = DetachedBlobStore> {
    db_path: PathBuf,
    config: DeskConfig,
    blobs: B,
}

impl ReferralDeskApi<DetachedBlobStore> {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, config: DeskConfig::default(), blobs: DetachedBlobStore }
    }
}

impl<B: BlobStore> ReferralDeskApi<B> {
    #[must_use]
    pub fn with_parts(db_path: PathBuf, config: DeskConfig, blobs: B) -> Self {
        Self { db_path, config, blobs }
    }

    #[must_use]
    pub fn config(&self) -> &DeskConfig {
        &self.config
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn store_blobs(&self, attachments: &mut [Attachment], uploads: &[Upload]) -> anyhow::Result<()> {
        if attachments.len() != uploads.len() {
            return Err(anyhow!(
                "bound {} attachments for {} uploads",
                attachments.len(),
                uploads.len()
            ));
        }
        for (attachment, upload) in attachments.iter_mut().zip(uploads) {
            attachment.file_ref = self.blobs.store(&upload.bytes, &attachment.file_ref)?;
        }
        Ok(())
    }

    fn check_uploads(&self, uploads: &[Upload]) -> Result<Vec<IncomingFile>, DeskError> {
        let files = uploads.iter().map(Upload::incoming).collect::<Vec<_>>();
        attachments::check_batch(&self.config.attachments, &files)?;
        Ok(files)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> ApiResult<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> ApiResult<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the registry write fails.
    pub fn upsert_principal(&self, principal: &Principal) -> ApiResult<()> {
        let mut store = self.open_store()?;
        store.upsert_principal(principal)?;
        info!(principal = %principal.id, active = principal.active, "principal registered");
        Ok(())
    }

    /// # Errors
    /// Returns an error when the registry cannot be read.
    pub fn list_principals(&self) -> ApiResult<Vec<Principal>> {
        Ok(self.open_store()?.list_principals()?)
    }

    /// Resolve a registered principal by id.
    ///
    /// # Errors
    /// Returns [`DeskError::NotFound`] for an unknown id.
    pub fn principal(&self, id: &UserId) -> ApiResult<Principal> {
        self.open_store()?
            .find_principal(id)?
            .ok_or_else(|| DeskError::NotFound { entity: "principal", id: id.to_string() }.into())
    }

    /// Submit a new referral, storing its attachments and auto-routing when enabled.
    ///
    /// # Errors
    /// Returns [`ApiError::Desk`] for authorization, validation, or attachment failures,
    /// and [`ApiError::Storage`] when persistence or blob storage fails.
    pub fn submit_referral(
        &self,
        principal: &Principal,
        input: &SubmitReferral,
        uploads: &[Upload],
    ) -> ApiResult<CaseChange> {
        let files = self.check_uploads(uploads)?;
        let mut store = self.open_store()?;
        let candidates = if self.config.routing.enabled {
            PrincipalDirectory::active_principals(&store)?
        } else {
            Vec::new()
        };
        let counselor_router = CounselorRouter::new(&candidates, &self.config.routing);
        let router: &dyn AutoRouter =
            if self.config.routing.enabled { &counselor_router } else { &NoRouting };

        let now = OffsetDateTime::now_utc();
        let mut change = lifecycle::submit(principal, input, &files, router, &self.config, now)
            .map_err(|err| refused("submit_referral", principal, err))?;
        self.store_blobs(&mut change.attachments, uploads)?;

        let mut attempts = 1;
        while let Err(err) = store.create_case(&change) {
            if !is_reference_collision(&err) || attempts >= REFERENCE_ATTEMPTS {
                return Err(refused("submit_referral", principal, err));
            }
            attempts += 1;
            change.referral.reference = generate_reference(ReferencePrefix::Referral, now);
        }

        info!(
            referral = %change.referral.id,
            reference = %change.referral.reference,
            principal = %principal.id,
            status = change.referral.status.as_str(),
            "referral submitted"
        );
        Ok(change)
    }

    /// # Errors
    /// Returns [`ApiError::Desk`] when the assignment is refused, and
    /// [`ApiError::Storage`] when persistence fails.
    pub fn assign_referral(
        &self,
        principal: &Principal,
        referral_id: ReferralId,
        target_id: &UserId,
    ) -> ApiResult<CaseChange> {
        let mut store = self.open_store()?;
        let target = store.find_principal(target_id)?;
        let now = OffsetDateTime::now_utc();
        let change = store
            .update_case(referral_id, |case| {
                Ok(lifecycle::assign(principal, case, target_id, target.as_ref(), now)?)
            })
            .map_err(|err| refused("assign_referral", principal, err))?;
        info!(referral = %referral_id, principal = %principal.id, assignee = %target_id, "referral assigned");
        Ok(change)
    }

    /// # Errors
    /// Returns [`ApiError::Desk`] when the escalation is refused, and
    /// [`ApiError::Storage`] when persistence fails.
    pub fn escalate_referral(
        &self,
        principal: &Principal,
        referral_id: ReferralId,
        deputy_id: &UserId,
    ) -> ApiResult<CaseChange> {
        let mut store = self.open_store()?;
        let deputy = store.find_principal(deputy_id)?;
        let now = OffsetDateTime::now_utc();
        let change = store
            .update_case(referral_id, |case| {
                Ok(lifecycle::escalate_to_deputy(principal, case, deputy_id, deputy.as_ref(), now)?)
            })
            .map_err(|err| refused("escalate_referral", principal, err))?;
        info!(referral = %referral_id, principal = %principal.id, deputy = %deputy_id, "referral sent to deputy");
        Ok(change)
    }

    /// Append a reply with optional attachments. The batch is validated before anything
    /// is stored; a rejected batch writes nothing.
    ///
    /// # Errors
    /// Returns [`ApiError::Desk`] when the reply is refused, and [`ApiError::Storage`]
    /// when persistence or blob storage fails.
    pub fn reply_referral(
        &self,
        principal: &Principal,
        referral_id: ReferralId,
        content: &str,
        uploads: &[Upload],
    ) -> ApiResult<CaseChange> {
        let files = self.check_uploads(uploads)?;
        let mut store = self.open_store()?;
        let now = OffsetDateTime::now_utc();
        let change = store
            .update_case(referral_id, |case| {
                let mut change =
                    lifecycle::reply(principal, case, content, &files, &self.config, now)?;
                self.store_blobs(&mut change.attachments, uploads)?;
                Ok(change)
            })
            .map_err(|err| refused("reply_referral", principal, err))?;
        info!(
            referral = %referral_id,
            principal = %principal.id,
            attachments = change.attachments.len(),
            "referral reply recorded"
        );
        Ok(change)
    }

    /// # Errors
    /// Returns [`ApiError::Desk`] when closing is refused, and [`ApiError::Storage`]
    /// when persistence fails.
    pub fn close_referral(
        &self,
        principal: &Principal,
        referral_id: ReferralId,
    ) -> ApiResult<CaseChange> {
        let mut store = self.open_store()?;
        let now = OffsetDateTime::now_utc();
        let change = store
            .update_case(referral_id, |case| Ok(lifecycle::close(principal, case, now)?))
            .map_err(|err| refused("close_referral", principal, err))?;
        info!(referral = %referral_id, principal = %principal.id, "referral closed");
        Ok(change)
    }

    /// Full case view for a principal allowed to see it.
    ///
    /// # Errors
    /// Returns [`DeskError::NotFound`] or [`DeskError::Forbidden`] as [`ApiError::Desk`].
    pub fn referral_detail(
        &self,
        principal: &Principal,
        referral_id: ReferralId,
    ) -> ApiResult<ReferralDetail> {
        let store = self.open_store()?;
        let case = store.load_case(referral_id)?.ok_or_else(|| DeskError::NotFound {
            entity: "referral",
            id: referral_id.to_string(),
        })?;
        policy::authorize(principal, Resource::Referral(&case.referral), Operation::View)
            .map_err(|err| refused("referral_detail", principal, err))?;

        let referrals = store.list_referrals()?;
        let related = CaseDirectory::new(&referrals, &self.config.directory)
            .related_cases(&case.referral, principal)
            .into_iter()
            .cloned()
            .collect();
        let summary = directory::summarize(&case.referral, &case.actions);
        let allowed_operations =
            policy::allowed_operations(principal, Resource::Referral(&case.referral))
                .into_iter()
                .collect();

        Ok(ReferralDetail {
            has_intake: case.intake.is_some(),
            actions: case.actions.entries().to_vec(),
            attachments: case.attachments,
            referral: case.referral,
            summary,
            related,
            allowed_operations,
        })
    }

    /// # Errors
    /// Returns an error when referrals cannot be loaded.
    pub fn list_referrals(&self, principal: &Principal, scope: Scope) -> ApiResult<ReferralListing> {
        let store = self.open_store()?;
        let referrals = store.list_referrals()?;
        let directory = CaseDirectory::new(&referrals, &self.config.directory);
        Ok(ReferralListing {
            scope,
            items: directory.list_for(principal, scope).into_iter().cloned().collect(),
            counts: directory.counts(principal),
        })
    }

    /// Group visible referrals by student, persisting keys computed on the way.
    ///
    /// # Errors
    /// Returns an error when referrals cannot be loaded or keys cannot be written.
    pub fn group_by_student(&self, principal: &Principal) -> ApiResult<Vec<StudentGroup>> {
        let mut store = self.open_store()?;
        let referrals = store.list_referrals()?;
        let grouping =
            CaseDirectory::new(&referrals, &self.config.directory).group_by_student(principal);
        let written = store.set_student_keys(&grouping.assigned_keys)?;
        if written > 0 {
            debug!(written, "persisted lazily computed student keys");
        }
        Ok(grouping.groups)
    }

    /// # Errors
    /// Returns [`DeskError::NotFound`] or [`DeskError::Forbidden`] as [`ApiError::Desk`].
    pub fn related_cases(
        &self,
        principal: &Principal,
        referral_id: ReferralId,
    ) -> ApiResult<Vec<Referral>> {
        Ok(self.referral_detail(principal, referral_id)?.related)
    }

    /// # Errors
    /// Returns an error when referrals cannot be loaded.
    pub fn report_totals(&self, principal: &Principal) -> ApiResult<ReportTotals> {
        let store = self.open_store()?;
        let referrals = store.list_referrals()?;
        Ok(CaseDirectory::new(&referrals, &self.config.directory)
            .report_totals(principal, OffsetDateTime::now_utc()))
    }

    /// # Errors
    /// Returns an error when the rebuild transaction fails.
    pub fn rebuild_student_keys(&self) -> ApiResult<KeyRebuildSummary> {
        let mut store = self.open_store()?;
        let summary = store.rebuild_student_keys()?;
        info!(scanned = summary.scanned, updated = summary.updated, "student keys rebuilt");
        Ok(summary)
    }

    /// Open the counselor intake, creating a blank one for a counselor on first access.
    ///
    /// # Errors
    /// Returns [`DeskError::Forbidden`] or [`DeskError::NotFound`] as [`ApiError::Desk`].
    pub fn open_intake(
        &self,
        principal: &Principal,
        referral_id: ReferralId,
    ) -> ApiResult<CounselorIntake> {
        let mut store = self.open_store()?;
        let now = OffsetDateTime::now_utc();
        let access = store
            .resolve_intake(referral_id, |case| Ok(intake::open_intake(principal, case, now)?))
            .map_err(|err| refused("open_intake", principal, err))?;
        if matches!(access, IntakeAccess::Created(_)) {
            info!(referral = %referral_id, principal = %principal.id, "counselor intake created");
        }
        Ok(access.into_intake())
    }

    /// # Errors
    /// Returns [`DeskError::Forbidden`] or [`DeskError::ValidationFailed`] as
    /// [`ApiError::Desk`], and [`ApiError::Storage`] when persistence fails.
    pub fn update_intake(
        &self,
        principal: &Principal,
        referral_id: ReferralId,
        form: IntakeForm,
    ) -> ApiResult<CounselorIntake> {
        let mut store = self.open_store()?;
        let now = OffsetDateTime::now_utc();
        let access = store
            .resolve_intake(referral_id, |case| {
                Ok(intake::update_intake(principal, case, form, now)?)
            })
            .map_err(|err| refused("update_intake", principal, err))?;
        info!(referral = %referral_id, principal = %principal.id, "counselor intake updated");
        Ok(access.into_intake())
    }

    /// Start one thread, or one per active colleague for a broadcast.
    ///
    /// # Errors
    /// Returns [`ApiError::Desk`] when the thread is refused, and [`ApiError::Storage`]
    /// when persistence or blob storage fails.
    pub fn start_thread(
        &self,
        principal: &Principal,
        input: &StartThread,
        uploads: &[Upload],
    ) -> ApiResult<Vec<Thread>> {
        let files = self.check_uploads(uploads)?;
        let mut store = self.open_store()?;
        let candidates = PrincipalDirectory::active_principals(&store)?;
        let now = OffsetDateTime::now_utc();
        let mut changes =
            threads::start_thread(principal, input, &candidates, &files, &self.config, now)
                .map_err(|err| refused("start_thread", principal, err))?;
        for change in &mut changes {
            self.store_blobs(&mut change.attachments, uploads)?;
        }

        let mut attempts = 1;
        while let Err(err) = store.create_threads(&changes) {
            if !is_reference_collision(&err) || attempts >= REFERENCE_ATTEMPTS {
                return Err(refused("start_thread", principal, err));
            }
            attempts += 1;
            for change in &mut changes {
                change.thread.reference = generate_reference(ReferencePrefix::Thread, now);
            }
        }

        info!(principal = %principal.id, threads = changes.len(), "thread started");
        Ok(changes.into_iter().map(|change: ThreadChange| change.thread).collect())
    }

    /// # Errors
    /// Returns an error when threads or messages cannot be loaded.
    pub fn list_threads(&self, principal: &Principal, scope: Scope) -> ApiResult<ThreadListing> {
        let store = self.open_store()?;
        let threads = store.list_threads()?;
        let messages = store.list_messages()?;
        let directory = ThreadDirectory::new(&threads, &messages, &self.config.threads);
        Ok(ThreadListing {
            scope,
            items: directory.list_for(principal, scope, OffsetDateTime::now_utc()),
            counts: directory.counts(principal),
            unread: directory.unread_count(principal),
        })
    }

    /// # Errors
    /// Returns [`DeskError::NotFound`] or [`DeskError::Forbidden`] as [`ApiError::Desk`].
    pub fn thread_detail(&self, principal: &Principal, thread_id: ThreadId) -> ApiResult<ThreadDetail> {
        let store = self.open_store()?;
        let file = store
            .load_thread(thread_id)?
            .ok_or_else(|| DeskError::NotFound { entity: "thread", id: thread_id.to_string() })?;
        let messages = threads::thread_messages(principal, &file)
            .map_err(|err| refused("thread_detail", principal, err))?
            .into_iter()
            .cloned()
            .collect();
        let allowed_operations = policy::allowed_operations(principal, Resource::Thread(&file.thread))
            .into_iter()
            .collect();
        Ok(ThreadDetail { messages, allowed_operations, attachments: file.attachments, thread: file.thread })
    }

    /// # Errors
    /// Returns [`ApiError::Desk`] when the reply is refused, and [`ApiError::Storage`]
    /// when persistence or blob storage fails.
    pub fn reply_thread(
        &self,
        principal: &Principal,
        thread_id: ThreadId,
        content: &str,
        uploads: &[Upload],
    ) -> ApiResult<Message> {
        let files = self.check_uploads(uploads)?;
        let mut store = self.open_store()?;
        let now = OffsetDateTime::now_utc();
        let change = store
            .update_thread(thread_id, |file| {
                let mut change = threads::reply(principal, file, content, &files, &self.config, now)?;
                self.store_blobs(&mut change.attachments, uploads)?;
                Ok(change)
            })
            .map_err(|err| refused("reply_thread", principal, err))?;
        info!(thread = %thread_id, principal = %principal.id, "thread reply recorded");
        change
            .messages
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::Storage(anyhow!("thread reply produced no message")))
    }

    /// # Errors
    /// Returns [`ApiError::Desk`] when closing is refused, and [`ApiError::Storage`]
    /// when persistence fails.
    pub fn close_thread(&self, principal: &Principal, thread_id: ThreadId) -> ApiResult<Thread> {
        let mut store = self.open_store()?;
        let now = OffsetDateTime::now_utc();
        let change = store
            .update_thread(thread_id, |file| Ok(threads::close_thread(principal, file, now)?))
            .map_err(|err| refused("close_thread", principal, err))?;
        info!(thread = %thread_id, principal = %principal.id, "thread closed");
        Ok(change.thread)
    }
}

#[cfg(test)]
mod tests {
    use referral_desk_core::name_key::derive_key;
    use referral_desk_core::{Recipient, ReferralStatus, Role};
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct RecordingBlobStore {
        stored: RefCell<Vec<String>>,
    }

    impl BlobStore for &RecordingBlobStore {
        fn store(&self, _bytes: &[u8], suggested_path: &str) -> anyhow::Result<String> {
            self.stored.borrow_mut().push(suggested_path.to_string());
            Ok(format!("blob://{suggested_path}"))
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("referral-desk-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn principal(id: &str, role: Role) -> Principal {
        Principal {
            id: UserId::from(id),
            display_name: format!("{id} name"),
            active: true,
            role: Some(role),
            elevated: false,
        }
    }

    fn submission(name: &str) -> SubmitReferral {
        SubmitReferral {
            student_name: name.to_string(),
            civil_id: None,
            grade: 5,
            referral_type: "academic".to_string(),
            details: "Needs help.!".to_string(),
        }
    }

    fn register<B: BlobStore>(api: &ReferralDeskApi<B>, principals: &[&Principal]) -> ApiResult<()> {
        for principal in principals {
            api.upsert_principal(principal)?;
        }
        Ok(())
    }

    fn without_routing() -> DeskConfig {
        let mut config = DeskConfig::default();
        config.routing.enabled = false;
        config
    }

    // Test IDs: API-001
    #[test]
    fn scenario_a_submission_routes_and_keys_the_student() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ReferralDeskApi::new(db_path.clone());
        let teacher = principal("u1", Role::Teacher);
        let counselor = principal("u2", Role::Counselor);
        register(&api, &[&teacher, &counselor])?;

        let change = api.submit_referral(&teacher, &submission("Ahmad Al-Faisal"), &[])?;
        assert_eq!(change.referral.status, ReferralStatus::UnderReview);
        assert_eq!(change.referral.assignee, Some(counselor.id.clone()));
        assert_eq!(
            change.referral.student_key.as_deref(),
            Some(derive_key("Ahmad Al-Faisal", None).as_str())
        );
        assert_eq!(change.actions.len(), 1);

        let unrouted = ReferralDeskApi::with_parts(db_path.clone(), without_routing(), DetachedBlobStore);
        let plain = unrouted.submit_referral(&teacher, &submission("Ahmad Al-Faisal"), &[])?;
        assert_eq!(plain.referral.status, ReferralStatus::New);
        assert_eq!(plain.referral.student_key, change.referral.student_key);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: API-002
    #[test]
    fn scenario_b_empty_reply_fails_then_reply_moves_new_case() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ReferralDeskApi::with_parts(db_path.clone(), without_routing(), DetachedBlobStore);
        let teacher = principal("u1", Role::Teacher);
        let counselor = principal("u2", Role::Counselor);
        let manager = principal("u3", Role::Manager);
        register(&api, &[&teacher, &counselor, &manager])?;

        let created = api.submit_referral(&teacher, &submission("Sara Ahmed"), &[])?;
        let referral_id = created.referral.id;
        assert_eq!(created.referral.status, ReferralStatus::New);

        match api.reply_referral(&teacher, referral_id, "", &[]) {
            Err(ApiError::Desk(DeskError::EmptyReply)) => {}
            other => panic!("expected EmptyReply, got {other:?}"),
        }
        let replied = api.reply_referral(&teacher, referral_id, "ok", &[])?;
        assert_eq!(replied.referral.status, ReferralStatus::UnderReview);

        let other = api.submit_referral(&teacher, &submission("Omar Khalid"), &[])?;
        api.assign_referral(&manager, other.referral.id, &counselor.id)?;
        let by_assignee = api.reply_referral(&counselor, other.referral.id, "ok", &[])?;
        assert_eq!(by_assignee.referral.status, ReferralStatus::UnderReview);
        assert_eq!(by_assignee.referral.version, 3);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: API-003
    #[test]
    fn scenario_c_unrelated_principal_is_forbidden() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ReferralDeskApi::with_parts(db_path.clone(), without_routing(), DetachedBlobStore);
        let teacher = principal("u1", Role::Teacher);
        let stranger = principal("u9", Role::Teacher);
        register(&api, &[&teacher, &stranger])?;

        let created = api.submit_referral(&teacher, &submission("Sara Ahmed"), &[])?;
        match api.referral_detail(&stranger, created.referral.id) {
            Err(err) => assert_eq!(err.code(), "forbidden"),
            Ok(_) => panic!("stranger must not view the referral"),
        }
        let detail = api.referral_detail(&teacher, created.referral.id)?;
        assert!(detail.allowed_operations.contains(&Operation::Reply));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: API-004
    #[test]
    fn scenario_d_diacritic_variants_share_one_group() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ReferralDeskApi::with_parts(db_path.clone(), without_routing(), DetachedBlobStore);
        let teacher = principal("u1", Role::Teacher);
        register(&api, &[&teacher])?;

        let first = api.submit_referral(&teacher, &submission("Fatimah"), &[])?;
        let second = api.submit_referral(&teacher, &submission("Fātimah"), &[])?;
        assert_eq!(first.referral.student_key, second.referral.student_key);

        let groups = api.group_by_student(&teacher)?;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].referrals.len(), 2);

        let related = api.related_cases(&teacher, first.referral.id)?;
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, second.referral.id);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: API-005
    #[test]
    fn rejected_attachment_batch_persists_nothing() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let blobs = RecordingBlobStore::default();
        let api = ReferralDeskApi::with_parts(db_path.clone(), without_routing(), &blobs);
        let teacher = principal("u1", Role::Teacher);
        register(&api, &[&teacher])?;

        let uploads = vec![Upload::new("report.pdf", vec![1, 2, 3]), Upload::new("run.exe", vec![4])];
        match api.submit_referral(&teacher, &submission("Sara Ahmed"), &uploads) {
            Err(err) => assert_eq!(err.code(), "attachment_rejected"),
            Ok(_) => panic!("batch with an executable must be rejected"),
        }
        assert!(blobs.stored.borrow().is_empty());
        assert!(api.list_referrals(&teacher, Scope::All)?.items.is_empty());

        let created =
            api.submit_referral(&teacher, &submission("Sara Ahmed"), &uploads[..1])?;
        assert_eq!(blobs.stored.borrow().len(), 1);
        let detail = api.referral_detail(&teacher, created.referral.id)?;
        assert_eq!(detail.attachments.len(), 1);
        assert!(detail.attachments[0].file_ref.starts_with("blob://referrals/"));
        assert!(detail.attachments[0]
            .content_hash
            .as_deref()
            .is_some_and(|hash| hash.starts_with("sha256:")));

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: API-006
    #[test]
    fn close_requires_a_reply_and_happens_once() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ReferralDeskApi::new(db_path.clone());
        let teacher = principal("u1", Role::Teacher);
        let counselor = principal("u2", Role::Counselor);
        register(&api, &[&teacher, &counselor])?;

        let created = api.submit_referral(&teacher, &submission("Sara Ahmed"), &[])?;
        let referral_id = created.referral.id;
        match api.close_referral(&counselor, referral_id) {
            Err(ApiError::Desk(DeskError::NoActionYet)) => {}
            other => panic!("expected NoActionYet, got {other:?}"),
        }
        api.reply_referral(&counselor, referral_id, "Met with the student", &[])?;
        let closed = api.close_referral(&counselor, referral_id)?;
        assert_eq!(closed.referral.status, ReferralStatus::Closed);
        match api.close_referral(&counselor, referral_id) {
            Err(err) => assert_eq!(err.code(), "closed"),
            Ok(_) => panic!("second close must fail"),
        }

        let totals = api.report_totals(&teacher)?;
        assert_eq!(totals.all, 1);
        assert_eq!(totals.closed, 1);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: API-007
    #[test]
    fn counselor_intake_lifecycle() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ReferralDeskApi::new(db_path.clone());
        let teacher = principal("u1", Role::Teacher);
        let counselor = principal("u2", Role::Counselor);
        register(&api, &[&teacher, &counselor])?;

        let created = api.submit_referral(&teacher, &submission("Sara Ahmed"), &[])?;
        let referral_id = created.referral.id;
        match api.open_intake(&teacher, referral_id) {
            Err(err) => assert_eq!(err.code(), "forbidden"),
            Ok(_) => panic!("teachers cannot open the intake"),
        }

        let blank = api.open_intake(&counselor, referral_id)?;
        let blank_id = blank.id;
        let mut form = blank.form;
        form.counselor_name = "Huda".to_string();
        form.notes.recommendations = "Weekly check-in".to_string();
        let updated = api.update_intake(&counselor, referral_id, form)?;
        assert_eq!(updated.id, blank_id);

        let closed = api.close_referral(&counselor, referral_id)?;
        assert_eq!(closed.referral.status, ReferralStatus::Closed);
        assert!(api.referral_detail(&counselor, referral_id)?.has_intake);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: API-008
    #[test]
    fn threads_round_trip_with_unread_state() -> ApiResult<()> {
        let db_path = unique_temp_db_path();
        let api = ReferralDeskApi::new(db_path.clone());
        let teacher = principal("u1", Role::Teacher);
        let counselor = principal("u2", Role::Counselor);
        let admin = principal("u3", Role::Administrative);
        register(&api, &[&teacher, &counselor, &admin])?;

        let started = api.start_thread(
            &teacher,
            &StartThread {
                recipient: Recipient::User(counselor.id.clone()),
                subject: "Seating".to_string(),
                content: "Front row for Sara?".to_string(),
            },
            &[],
        )?;
        assert_eq!(started.len(), 1);
        let thread_id = started[0].id;

        let inbox = api.list_threads(&counselor, Scope::Inbox)?;
        assert_eq!(inbox.items.len(), 1);
        assert_eq!(inbox.unread, 1);

        api.reply_thread(&counselor, thread_id, "Done", &[])?;
        assert_eq!(api.list_threads(&counselor, Scope::All)?.unread, 0);
        assert_eq!(api.list_threads(&teacher, Scope::All)?.unread, 1);

        match api.thread_detail(&admin, thread_id) {
            Err(err) => assert_eq!(err.code(), "forbidden"),
            Ok(_) => panic!("outsider must not read the thread"),
        }
        api.close_thread(&teacher, thread_id)?;
        match api.reply_thread(&counselor, thread_id, "late", &[]) {
            Err(err) => assert_eq!(err.code(), "closed"),
            Ok(_) => panic!("closed thread must refuse replies"),
        }

        let broadcast = api.start_thread(
            &admin,
            &StartThread {
                recipient: Recipient::Everyone,
                subject: "Staff meeting".to_string(),
                content: "Thursday at noon".to_string(),
            },
            &[],
        )?;
        assert_eq!(broadcast.len(), 2);
        assert_eq!(api.thread_detail(&teacher, broadcast[0].id)?.messages.len(), 1);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: API-009
    #[test]
    fn config_file_loads_and_validates() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("referral-desk-config-{}", ulid::Ulid::new()));
        fs::create_dir_all(&dir)?;
        let good = dir.join("desk.yaml");
        fs::write(&good, "attachments:\n  max_files: 2\nthreads:\n  allow_reply_when_closed: true\n")?;
        let config = load_config(&good)?;
        assert_eq!(config.attachments.max_files, 2);
        assert!(config.threads.allow_reply_when_closed);
        assert_eq!(config.referrals, DeskConfig::default().referrals);

        let bad = dir.join("bad.yaml");
        fs::write(&bad, "attachments:\n  max_files: 0\n")?;
        assert!(load_config(&bad).is_err());
        let unknown = dir.join("unknown.yaml");
        fs::write(&unknown, "attachment:\n  max_files: 3\n")?;
        assert!(load_config(&unknown).is_err());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
