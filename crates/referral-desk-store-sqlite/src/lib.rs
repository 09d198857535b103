use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use referral_desk_core::intake::IntakeAccess;
use referral_desk_core::name_key::derive_key;
use referral_desk_core::{
    Action, ActionId, ActionKind, ActionLog, Attachment, AttachmentId, AttachmentOwner, CaseChange,
    CaseFile, CounselorIntake, DeskError, Grade, IntakeId, Message, MessageId, Principal,
    PrincipalDirectory, Referral, ReferralId, ReferralStatus, ReferralType, Role, Thread,
    ThreadChange, ThreadFile, ThreadId, ThreadStatus, UserId,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS principals (
  user_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  active INTEGER NOT NULL CHECK (active IN (0,1)),
  role TEXT CHECK (role IS NULL OR role IN (
    'manager','counselor','student_affairs_deputy','school_affairs_deputy',
    'educational_affairs_deputy','administrative','teacher'
  )),
  elevated INTEGER NOT NULL CHECK (elevated IN (0,1)),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS referrals (
  referral_id TEXT PRIMARY KEY,
  reference TEXT NOT NULL UNIQUE,
  student_name TEXT NOT NULL,
  student_key TEXT,
  grade INTEGER NOT NULL CHECK (grade BETWEEN 1 AND 12),
  referral_type TEXT NOT NULL CHECK (referral_type IN ('behavior','academic','health','other')),
  details TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('NEW','UNDER_REVIEW','SENT_TO_DEPUTY','CLOSED')),
  created_by TEXT NOT NULL,
  assignee TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1)
);

CREATE TABLE IF NOT EXISTS referral_actions (
  action_id TEXT PRIMARY KEY,
  referral_id TEXT NOT NULL,
  author TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('REPLY','NOTE','DECISION')),
  content TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (referral_id) REFERENCES referrals(referral_id)
);

CREATE INDEX IF NOT EXISTS idx_referral_actions_referral ON referral_actions(referral_id);

CREATE TABLE IF NOT EXISTS attachments (
  attachment_id TEXT PRIMARY KEY,
  owner_kind TEXT NOT NULL CHECK (owner_kind IN ('referral','action','message')),
  owner_id TEXT NOT NULL,
  file_name TEXT NOT NULL,
  file_ref TEXT NOT NULL,
  size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
  content_hash TEXT,
  uploaded_by TEXT NOT NULL,
  uploaded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attachments_owner ON attachments(owner_kind, owner_id);

CREATE TABLE IF NOT EXISTS counselor_intakes (
  intake_id TEXT PRIMARY KEY,
  referral_id TEXT NOT NULL UNIQUE,
  form_json TEXT NOT NULL,
  created_by TEXT NOT NULL,
  updated_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (referral_id) REFERENCES referrals(referral_id)
);

CREATE TABLE IF NOT EXISTS threads (
  thread_id TEXT PRIMARY KEY,
  reference TEXT NOT NULL UNIQUE,
  subject TEXT NOT NULL,
  sender TEXT NOT NULL,
  recipient TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('OPEN','CLOSED')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1)
);

CREATE TABLE IF NOT EXISTS messages (
  message_id TEXT PRIMARY KEY,
  thread_id TEXT NOT NULL,
  author TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (thread_id) REFERENCES threads(thread_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
";

const ORPHAN_ATTACHMENTS_SQL: &str = r"
SELECT a.attachment_id FROM attachments a
WHERE NOT (
  (a.owner_kind = 'referral' AND EXISTS (SELECT 1 FROM referrals r WHERE r.referral_id = a.owner_id))
  OR (a.owner_kind = 'action' AND EXISTS (SELECT 1 FROM referral_actions x WHERE x.action_id = a.owner_id))
  OR (a.owner_kind = 'message' AND EXISTS (SELECT 1 FROM messages m WHERE m.message_id = a.owner_id))
)
ORDER BY a.attachment_id
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE referrals ADD COLUMN civil_id TEXT;
CREATE INDEX IF NOT EXISTS idx_referrals_student_key ON referrals(student_key);
";

const REFERRAL_COLUMNS: &str = "referral_id, reference, student_name, civil_id, student_key, grade,
    referral_type, details, status, created_by, assignee, created_at, updated_at, version";

const ATTACHMENT_COLUMNS: &str = "attachment_id, owner_kind, owner_id, file_name, file_ref,
    size_bytes, content_hash, uploaded_by, uploaded_at";

const THREAD_COLUMNS: &str =
    "thread_id, reference, subject, sender, recipient, status, created_at, updated_at, version";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Attachment rows whose owner referral, action, or message no longer exists.
    pub orphan_attachments: Vec<String>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRebuildSummary {
    pub scanned: usize,
    pub updated: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed referral store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "referrals")? {
            let tx = self.conn.unchecked_transaction().context("failed to start transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            debug!(version = 1, "applied schema migration");
            return Ok(1);
        }

        if table_has_column(&self.conn, "referrals", "civil_id")? {
            // Tables already in v2 shape but the migration ledger is missing.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        if table_has_column(&self.conn, "referrals", "student_name")? {
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: referrals has no student_name column"))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "referrals", "civil_id")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        debug!(version = 2, "applied schema migration");
        Ok(())
    }

    /// Insert or refresh a principal in the registry the hosting layer keeps in sync.
    ///
    /// # Errors
    /// Returns an error when the principal id is blank or the write fails.
    pub fn upsert_principal(&mut self, principal: &Principal) -> Result<()> {
        if principal.id.as_str().trim().is_empty() {
            return Err(anyhow!("principal id must be provided"));
        }
        self.conn
            .execute(
                "INSERT INTO principals(user_id, display_name, active, role, elevated, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   active = excluded.active,
                   role = excluded.role,
                   elevated = excluded.elevated,
                   updated_at = excluded.updated_at",
                params![
                    principal.id.as_str(),
                    principal.display_name,
                    principal.active,
                    principal.role.map(Role::as_str),
                    principal.elevated,
                    now_rfc3339()?,
                ],
            )
            .with_context(|| format!("failed to upsert principal {}", principal.id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the registry cannot be read.
    pub fn find_principal(&self, id: &UserId) -> Result<Option<Principal>> {
        self.conn
            .query_row(
                "SELECT user_id, display_name, active, role, elevated
                 FROM principals WHERE user_id = ?1",
                params![id.as_str()],
                |row| Ok(PrincipalRow::read(row)),
            )
            .optional()
            .with_context(|| format!("failed to load principal {id}"))?
            .transpose()?
            .map(PrincipalRow::into_principal)
            .transpose()
    }

    /// All registered principals ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_principals(&self) -> Result<Vec<Principal>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, display_name, active, role, elevated
             FROM principals ORDER BY user_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut principals = Vec::new();
        while let Some(row) = rows.next()? {
            principals.push(PrincipalRow::read(row)?.into_principal()?);
        }
        Ok(principals)
    }

    /// Persist a newly submitted referral with its initial actions and attachments.
    ///
    /// # Errors
    /// Returns [`DeskError::Conflict`] (inside `anyhow`) when the reference is taken,
    /// or an error when any write fails.
    pub fn create_case(&mut self, change: &CaseChange) -> Result<()> {
        if change.expected_version.is_some() {
            return Err(anyhow!("create_case expects a new referral"));
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        if reference_taken(&tx, "referrals", &change.referral.reference)? {
            return Err(DeskError::Conflict {
                entity: "reference",
                id: change.referral.reference.clone(),
            }
            .into());
        }

        let referral = &change.referral;
        tx.execute(
            &format!(
                "INSERT INTO referrals({REFERRAL_COLUMNS}) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
                )"
            ),
            params![
                referral.id.to_string(),
                referral.reference,
                referral.student_name,
                referral.civil_id,
                referral.student_key,
                i64::from(referral.grade.get()),
                referral.referral_type.as_str(),
                referral.details,
                referral.status.as_str(),
                referral.created_by.as_str(),
                referral.assignee.as_ref().map(UserId::as_str),
                rfc3339(referral.created_at)?,
                rfc3339(referral.updated_at)?,
                i64::from(referral.version),
            ],
        )
        .context("failed to insert referral")?;

        insert_actions(&tx, &change.actions)?;
        insert_attachments(&tx, &change.attachments)?;
        tx.commit().context("failed to commit referral creation")?;
        Ok(())
    }

    /// Read-modify-write one referral inside an immediate transaction.
    ///
    /// `apply` sees a snapshot read under the write lock; its change is written with an
    /// optimistic version check.
    ///
    /// # Errors
    /// Returns [`DeskError::NotFound`] or [`DeskError::Conflict`] (inside `anyhow`), any
    /// error from `apply`, or an error when persistence fails.
    pub fn update_case<F>(&mut self, referral_id: ReferralId, apply: F) -> Result<CaseChange>
    where
        F: FnOnce(&CaseFile) -> Result<CaseChange>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        let Some(case) = load_case(&tx, referral_id)? else {
            return Err(referral_not_found(referral_id));
        };
        let change = apply(&case)?;
        if change.referral.id != referral_id {
            return Err(anyhow!("case change targets a different referral"));
        }
        let Some(expected_version) = change.expected_version else {
            return Err(anyhow!("case change is missing the expected version"));
        };

        let referral = &change.referral;
        let updated = tx
            .execute(
                "UPDATE referrals SET
                   student_key = ?2, status = ?3, assignee = ?4, updated_at = ?5, version = ?6
                 WHERE referral_id = ?1 AND version = ?7",
                params![
                    referral.id.to_string(),
                    referral.student_key,
                    referral.status.as_str(),
                    referral.assignee.as_ref().map(UserId::as_str),
                    rfc3339(referral.updated_at)?,
                    i64::from(referral.version),
                    i64::from(expected_version),
                ],
            )
            .context("failed to update referral")?;
        if updated == 0 {
            warn!(referral = %referral_id, expected_version, "referral version conflict");
            return Err(DeskError::Conflict { entity: "referral", id: referral_id.to_string() }.into());
        }

        insert_actions(&tx, &change.actions)?;
        insert_attachments(&tx, &change.attachments)?;
        tx.commit().context("failed to commit referral update")?;
        Ok(change)
    }

    /// Resolve and, when needed, persist the counselor intake for a referral.
    ///
    /// # Errors
    /// Returns [`DeskError::NotFound`] (inside `anyhow`) for an unknown referral, any
    /// error from `resolve`, or an error when persistence fails.
    pub fn resolve_intake<F>(&mut self, referral_id: ReferralId, resolve: F) -> Result<IntakeAccess>
    where
        F: FnOnce(&CaseFile) -> Result<IntakeAccess>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let Some(case) = load_case(&tx, referral_id)? else {
            return Err(referral_not_found(referral_id));
        };
        let access = resolve(&case)?;
        if access.needs_write() {
            let intake = access.intake();
            tx.execute(
                "INSERT INTO counselor_intakes(
                    intake_id, referral_id, form_json, created_by, updated_by, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(referral_id) DO UPDATE SET
                   form_json = excluded.form_json,
                   updated_by = excluded.updated_by,
                   updated_at = excluded.updated_at",
                params![
                    intake.id.to_string(),
                    intake.referral_id.to_string(),
                    serde_json::to_string(&intake.form).context("failed to serialize intake form")?,
                    intake.created_by.as_str(),
                    intake.updated_by.as_str(),
                    rfc3339(intake.created_at)?,
                    rfc3339(intake.updated_at)?,
                ],
            )
            .context("failed to write counselor intake")?;
        }
        tx.commit().context("failed to commit intake transaction")?;
        Ok(access)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_case(&self, referral_id: ReferralId) -> Result<Option<CaseFile>> {
        load_case(&self.conn, referral_id)
    }

    /// Every referral, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_referrals(&self) -> Result<Vec<Referral>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals ORDER BY created_at DESC, referral_id DESC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut referrals = Vec::new();
        while let Some(row) = rows.next()? {
            referrals.push(read_referral(row)?);
        }
        referrals.sort_by(Referral::recency_order);
        Ok(referrals)
    }

    /// Write back keys computed lazily during grouping. Stored keys are never replaced.
    ///
    /// # Errors
    /// Returns an error when the update transaction fails.
    pub fn set_student_keys(&mut self, keys: &[(ReferralId, String)]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut written = 0;
        for (referral_id, key) in keys {
            written += tx
                .execute(
                    "UPDATE referrals SET student_key = ?2
                     WHERE referral_id = ?1 AND student_key IS NULL",
                    params![referral_id.to_string(), key],
                )
                .with_context(|| format!("failed to set student key for {referral_id}"))?;
        }
        tx.commit().context("failed to commit student keys")?;
        Ok(written)
    }

    /// Recompute every student key from the current name and civil id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or updated.
    pub fn rebuild_student_keys(&mut self) -> Result<KeyRebuildSummary> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let mut pending = Vec::new();
        let mut scanned = 0;
        {
            let mut stmt =
                tx.prepare("SELECT referral_id, student_name, civil_id, student_key FROM referrals")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                scanned += 1;
                let referral_id: String = row.get(0)?;
                let student_name: String = row.get(1)?;
                let civil_id: Option<String> = row.get(2)?;
                let stored: Option<String> = row.get(3)?;
                let key = derive_key(&student_name, civil_id.as_deref());
                if stored.as_deref() != Some(key.as_str()) {
                    pending.push((referral_id, key));
                }
            }
        }
        for (referral_id, key) in &pending {
            tx.execute(
                "UPDATE referrals SET student_key = ?2 WHERE referral_id = ?1",
                params![referral_id, key],
            )
            .with_context(|| format!("failed to rebuild student key for {referral_id}"))?;
        }
        tx.commit().context("failed to commit student key rebuild")?;
        debug!(scanned, updated = pending.len(), "rebuilt student keys");
        Ok(KeyRebuildSummary { scanned, updated: pending.len() })
    }

    /// Persist freshly started threads with their opening messages.
    ///
    /// # Errors
    /// Returns [`DeskError::Conflict`] (inside `anyhow`) when a reference is taken, or an
    /// error when any write fails. Nothing is written on error.
    pub fn create_threads(&mut self, changes: &[ThreadChange]) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        for change in changes {
            if change.expected_version.is_some() {
                return Err(anyhow!("create_threads expects new threads"));
            }
            let thread = &change.thread;
            if reference_taken(&tx, "threads", &thread.reference)? {
                return Err(DeskError::Conflict { entity: "reference", id: thread.reference.clone() }
                    .into());
            }
            tx.execute(
                &format!(
                    "INSERT INTO threads({THREAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    thread.id.to_string(),
                    thread.reference,
                    thread.subject,
                    thread.sender.as_str(),
                    thread.recipient.as_str(),
                    thread.status.as_str(),
                    rfc3339(thread.created_at)?,
                    rfc3339(thread.updated_at)?,
                    i64::from(thread.version),
                ],
            )
            .context("failed to insert thread")?;
            insert_messages(&tx, &change.messages)?;
            insert_attachments(&tx, &change.attachments)?;
        }
        tx.commit().context("failed to commit thread creation")?;
        Ok(())
    }

    /// Read-modify-write one thread inside an immediate transaction.
    ///
    /// # Errors
    /// Returns [`DeskError::NotFound`] or [`DeskError::Conflict`] (inside `anyhow`), any
    /// error from `apply`, or an error when persistence fails.
    pub fn update_thread<F>(&mut self, thread_id: ThreadId, apply: F) -> Result<ThreadChange>
    where
        F: FnOnce(&ThreadFile) -> Result<ThreadChange>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let Some(file) = load_thread(&tx, thread_id)? else {
            return Err(DeskError::NotFound { entity: "thread", id: thread_id.to_string() }.into());
        };
        let change = apply(&file)?;
        if change.thread.id != thread_id {
            return Err(anyhow!("thread change targets a different thread"));
        }
        let Some(expected_version) = change.expected_version else {
            return Err(anyhow!("thread change is missing the expected version"));
        };

        let updated = tx
            .execute(
                "UPDATE threads SET status = ?2, updated_at = ?3, version = ?4
                 WHERE thread_id = ?1 AND version = ?5",
                params![
                    thread_id.to_string(),
                    change.thread.status.as_str(),
                    rfc3339(change.thread.updated_at)?,
                    i64::from(change.thread.version),
                    i64::from(expected_version),
                ],
            )
            .context("failed to update thread")?;
        if updated == 0 {
            warn!(thread = %thread_id, expected_version, "thread version conflict");
            return Err(DeskError::Conflict { entity: "thread", id: thread_id.to_string() }.into());
        }

        insert_messages(&tx, &change.messages)?;
        insert_attachments(&tx, &change.attachments)?;
        tx.commit().context("failed to commit thread update")?;
        Ok(change)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_thread(&self, thread_id: ThreadId) -> Result<Option<ThreadFile>> {
        load_thread(&self.conn, thread_id)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_threads(&self) -> Result<Vec<Thread>> {
        let mut stmt =
            self.conn.prepare(&format!("SELECT {THREAD_COLUMNS} FROM threads ORDER BY thread_id"))?;
        let mut rows = stmt.query([])?;
        let mut threads = Vec::new();
        while let Some(row) = rows.next()? {
            threads.push(read_thread(row)?);
        }
        Ok(threads)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_messages(&self) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, thread_id, author, content, created_at
             FROM messages ORDER BY thread_id, message_id",
        )?;
        let mut rows = stmt.query([])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(read_message(row)?);
        }
        Ok(messages)
    }

    /// Copy the desk database (cases, threads, intakes, and attachment metadata) to
    /// `out_file`. Blob contents live outside the database and are not included.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Health report for the desk database. Attachments reference their owner by
    /// kind and id rather than a foreign key, so dangling owners are listed separately.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let orphan_attachments = if table_exists(&self.conn, "attachments")? {
            let mut stmt = self
                .conn
                .prepare(ORPHAN_ATTACHMENTS_SQL)
                .context("failed to prepare orphan attachment scan")?;
            let mut rows = stmt.query([])?;
            let mut orphans = Vec::new();
            while let Some(row) = rows.next()? {
                orphans.push(row.get::<_, String>(0)?);
            }
            orphans
        } else {
            Vec::new()
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            orphan_attachments,
            schema_status,
        })
    }
}

impl PrincipalDirectory for SqliteStore {
    type Error = anyhow::Error;

    fn principal(&self, id: &UserId) -> Result<Option<Principal>> {
        self.find_principal(id)
    }

    fn active_principals(&self) -> Result<Vec<Principal>> {
        Ok(self.list_principals()?.into_iter().filter(|principal| principal.active).collect())
    }
}

struct PrincipalRow {
    user_id: String,
    display_name: String,
    active: bool,
    role: Option<String>,
    elevated: bool,
}

impl PrincipalRow {
    fn read(row: &Row<'_>) -> Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            display_name: row.get(1)?,
            active: row.get(2)?,
            role: row.get(3)?,
            elevated: row.get(4)?,
        })
    }

    fn into_principal(self) -> Result<Principal> {
        let role = match self.role {
            Some(raw) => Some(Role::parse(&raw).ok_or_else(|| anyhow!("unknown role: {raw}"))?),
            None => None,
        };
        Ok(Principal {
            id: UserId(self.user_id),
            display_name: self.display_name,
            active: self.active,
            role,
            elevated: self.elevated,
        })
    }
}

fn referral_not_found(referral_id: ReferralId) -> anyhow::Error {
    DeskError::NotFound { entity: "referral", id: referral_id.to_string() }.into()
}

fn reference_taken(conn: &Connection, table: &str, reference: &str) -> Result<bool> {
    let taken = conn
        .query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE reference = ?1)"),
            params![reference],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check reference {reference}"))?;
    Ok(taken == 1)
}

fn load_case(conn: &Connection, referral_id: ReferralId) -> Result<Option<CaseFile>> {
    let id = referral_id.to_string();
    let mut stmt =
        conn.prepare(&format!("SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referral_id = ?1"))?;
    let mut rows = stmt.query(params![id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let referral = read_referral(row)?;

    let mut stmt = conn.prepare(
        "SELECT action_id, referral_id, author, kind, content, created_at
         FROM referral_actions WHERE referral_id = ?1",
    )?;
    let mut rows = stmt.query(params![id])?;
    let mut actions = Vec::new();
    while let Some(row) = rows.next()? {
        actions.push(read_action(row)?);
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments
         WHERE (owner_kind = 'referral' AND owner_id = ?1)
            OR (owner_kind = 'action' AND owner_id IN (
                  SELECT action_id FROM referral_actions WHERE referral_id = ?1))
         ORDER BY uploaded_at, attachment_id"
    ))?;
    let mut rows = stmt.query(params![id])?;
    let mut attachments = Vec::new();
    while let Some(row) = rows.next()? {
        attachments.push(read_attachment(row)?);
    }

    let intake = conn
        .query_row(
            "SELECT intake_id, form_json, created_by, updated_by, created_at, updated_at
             FROM counselor_intakes WHERE referral_id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .context("failed to load counselor intake")?
        .map(|(intake_id, form_json, created_by, updated_by, created_at, updated_at)| {
            Ok::<_, anyhow::Error>(CounselorIntake {
                id: IntakeId(parse_ulid(&intake_id)?),
                referral_id,
                form: serde_json::from_str(&form_json)
                    .context("failed to deserialize intake form")?,
                created_by: UserId(created_by),
                updated_by: UserId(updated_by),
                created_at: parse_rfc3339(&created_at)?,
                updated_at: parse_rfc3339(&updated_at)?,
            })
        })
        .transpose()?;

    Ok(Some(CaseFile { referral, actions: ActionLog::from_entries(actions), attachments, intake }))
}

fn load_thread(conn: &Connection, thread_id: ThreadId) -> Result<Option<ThreadFile>> {
    let id = thread_id.to_string();
    let mut stmt =
        conn.prepare(&format!("SELECT {THREAD_COLUMNS} FROM threads WHERE thread_id = ?1"))?;
    let mut rows = stmt.query(params![id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let thread = read_thread(row)?;

    let mut stmt = conn.prepare(
        "SELECT message_id, thread_id, author, content, created_at
         FROM messages WHERE thread_id = ?1",
    )?;
    let mut rows = stmt.query(params![id])?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next()? {
        messages.push(read_message(row)?);
    }
    messages.sort_by(Message::chronological);

    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments
         WHERE owner_kind = 'message' AND owner_id IN (
               SELECT message_id FROM messages WHERE thread_id = ?1)
         ORDER BY uploaded_at, attachment_id"
    ))?;
    let mut rows = stmt.query(params![id])?;
    let mut attachments = Vec::new();
    while let Some(row) = rows.next()? {
        attachments.push(read_attachment(row)?);
    }

    Ok(Some(ThreadFile { thread, messages, attachments }))
}

fn insert_actions(conn: &Connection, actions: &[Action]) -> Result<()> {
    for action in actions {
        conn.execute(
            "INSERT INTO referral_actions(action_id, referral_id, author, kind, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                action.id.to_string(),
                action.referral_id.to_string(),
                action.author.as_str(),
                action.kind.as_str(),
                action.content,
                rfc3339(action.created_at)?,
            ],
        )
        .context("failed to insert referral action")?;
    }
    Ok(())
}

fn insert_messages(conn: &Connection, messages: &[Message]) -> Result<()> {
    for message in messages {
        conn.execute(
            "INSERT INTO messages(message_id, thread_id, author, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id.to_string(),
                message.thread_id.to_string(),
                message.author.as_str(),
                message.content,
                rfc3339(message.created_at)?,
            ],
        )
        .context("failed to insert message")?;
    }
    Ok(())
}

fn insert_attachments(conn: &Connection, attachments: &[Attachment]) -> Result<()> {
    for attachment in attachments {
        conn.execute(
            &format!(
                "INSERT INTO attachments({ATTACHMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                attachment.id.to_string(),
                attachment.owner.kind_str(),
                attachment.owner.id_string(),
                attachment.file_name,
                attachment.file_ref,
                i64::try_from(attachment.size_bytes).context("attachment size exceeds i64")?,
                attachment.content_hash,
                attachment.uploaded_by.as_str(),
                rfc3339(attachment.uploaded_at)?,
            ],
        )
        .context("failed to insert attachment")?;
    }
    Ok(())
}

fn read_referral(row: &Row<'_>) -> Result<Referral> {
    let grade_raw: i64 = row.get(5)?;
    let referral_type_raw: String = row.get(6)?;
    let status_raw: String = row.get(8)?;
    let grade = u8::try_from(grade_raw)
        .ok()
        .and_then(Grade::new)
        .ok_or_else(|| anyhow!("invalid grade: {grade_raw}"))?;

    Ok(Referral {
        id: ReferralId(parse_ulid(&row.get::<_, String>(0)?)?),
        reference: row.get(1)?,
        student_name: row.get(2)?,
        civil_id: row.get(3)?,
        student_key: row.get(4)?,
        grade,
        referral_type: ReferralType::parse(&referral_type_raw)
            .ok_or_else(|| anyhow!("unknown referral_type: {referral_type_raw}"))?,
        details: row.get(7)?,
        status: ReferralStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown referral status: {status_raw}"))?,
        created_by: UserId(row.get(9)?),
        assignee: row.get::<_, Option<String>>(10)?.map(UserId),
        created_at: parse_rfc3339(&row.get::<_, String>(11)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(12)?)?,
        version: u32::try_from(row.get::<_, i64>(13)?).context("invalid referral version")?,
    })
}

fn read_action(row: &Row<'_>) -> Result<Action> {
    let kind_raw: String = row.get(3)?;
    Ok(Action {
        id: ActionId(parse_ulid(&row.get::<_, String>(0)?)?),
        referral_id: ReferralId(parse_ulid(&row.get::<_, String>(1)?)?),
        author: UserId(row.get(2)?),
        kind: ActionKind::parse(&kind_raw).ok_or_else(|| anyhow!("unknown action kind: {kind_raw}"))?,
        content: row.get(4)?,
        created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
    })
}

fn read_attachment(row: &Row<'_>) -> Result<Attachment> {
    let owner_kind: String = row.get(1)?;
    let owner_id: String = row.get(2)?;
    Ok(Attachment {
        id: AttachmentId(parse_ulid(&row.get::<_, String>(0)?)?),
        owner: AttachmentOwner::from_parts(&owner_kind, &owner_id)
            .ok_or_else(|| anyhow!("invalid attachment owner: {owner_kind}/{owner_id}"))?,
        file_name: row.get(3)?,
        file_ref: row.get(4)?,
        size_bytes: u64::try_from(row.get::<_, i64>(5)?).context("negative attachment size")?,
        content_hash: row.get(6)?,
        uploaded_by: UserId(row.get(7)?),
        uploaded_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
    })
}

fn read_thread(row: &Row<'_>) -> Result<Thread> {
    let status_raw: String = row.get(5)?;
    Ok(Thread {
        id: ThreadId(parse_ulid(&row.get::<_, String>(0)?)?),
        reference: row.get(1)?,
        subject: row.get(2)?,
        sender: UserId(row.get(3)?),
        recipient: UserId(row.get(4)?),
        status: ThreadStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown thread status: {status_raw}"))?,
        created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
        version: u32::try_from(row.get::<_, i64>(8)?).context("invalid thread version")?,
    })
}

fn read_message(row: &Row<'_>) -> Result<Message> {
    Ok(Message {
        id: MessageId(parse_ulid(&row.get::<_, String>(0)?)?),
        thread_id: ThreadId(parse_ulid(&row.get::<_, String>(1)?)?),
        author: UserId(row.get(2)?),
        content: row.get(3)?,
        created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
    })
}

/// Used to recognise desk databases created before `schema_migrations` existed.
fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

/// Recorded version, or one inferred from the shape of `referrals`: `civil_id`
/// arrived in v2 and `student_name` marks a v1 table.
fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "referrals")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "referrals", "civil_id")? {
        return Ok((2, true));
    }

    if table_has_column(conn, "referrals", "student_name")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: referrals has no student_name column"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<ulid::Ulid> {
    ulid::Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use referral_desk_core::intake;
    use referral_desk_core::lifecycle::{self, NoRouting};
    use referral_desk_core::threads as desk_threads;
    use referral_desk_core::{DeskConfig, IncomingFile, Recipient, StartThread, SubmitReferral};
    use ulid::Ulid;

    use super::*;

    fn principal(id: &str, role: Option<Role>, elevated: bool) -> Principal {
        Principal {
            id: UserId::from(id),
            display_name: format!("{id} name"),
            active: true,
            role,
            elevated,
        }
    }

    fn teacher() -> Principal {
        principal("t-100", Some(Role::Teacher), false)
    }

    fn counselor() -> Principal {
        principal("c-200", Some(Role::Counselor), false)
    }

    fn open_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn submission(name: &str) -> SubmitReferral {
        SubmitReferral {
            student_name: name.to_string(),
            civil_id: None,
            grade: 7,
            referral_type: "behavior".to_string(),
            details: "Repeated disruption during morning lessons".to_string(),
        }
    }

    fn submit_case(store: &mut SqliteStore, name: &str) -> Result<CaseChange> {
        let change = lifecycle::submit(
            &teacher(),
            &submission(name),
            &[IncomingFile::new("note.pdf", 2048)],
            &NoRouting,
            &DeskConfig::default(),
            OffsetDateTime::now_utc(),
        )?;
        store.create_case(&change)?;
        Ok(change)
    }

    fn desk_error(err: &anyhow::Error) -> Option<&DeskError> {
        err.downcast_ref::<DeskError>()
    }

    // Test IDs: STO-001
    #[test]
    fn migrate_reaches_latest_version_and_is_idempotent() -> Result<()> {
        let mut store = open_store()?;
        store.migrate()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        assert!(!status.inferred_from_legacy);
        assert!(table_has_column(&store.conn, "referrals", "civil_id")?);
        Ok(())
    }

    // Test IDs: STO-002
    #[test]
    fn legacy_schema_is_inferred_and_upgraded() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(MIGRATION_001_SQL)?;
        let mut store = SqliteStore { conn };

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 2);
        assert!(!status.inferred_from_legacy);
        assert!(table_has_column(&store.conn, "referrals", "civil_id")?);
        Ok(())
    }

    // Test IDs: STO-003
    #[test]
    fn created_case_round_trips_with_attachments() -> Result<()> {
        let mut store = open_store()?;
        let change = submit_case(&mut store, "Sara Ahmed")?;

        let Some(case) = store.load_case(change.referral.id)? else {
            return Err(anyhow!("referral should exist"));
        };
        assert_eq!(case.referral, change.referral);
        assert!(case.actions.is_empty());
        assert_eq!(case.attachments.len(), 1);
        assert_eq!(case.attachments[0].owner, AttachmentOwner::Referral(change.referral.id));
        assert!(case.intake.is_none());

        let listed = store.list_referrals()?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reference, change.referral.reference);
        Ok(())
    }

    // Test IDs: STO-004
    #[test]
    fn duplicate_reference_is_a_conflict() -> Result<()> {
        let mut store = open_store()?;
        let first = submit_case(&mut store, "Sara Ahmed")?;

        let mut second = lifecycle::submit(
            &teacher(),
            &submission("Omar Khalid"),
            &[],
            &NoRouting,
            &DeskConfig::default(),
            OffsetDateTime::now_utc(),
        )?;
        second.referral.reference = first.referral.reference.clone();

        let Err(err) = store.create_case(&second) else {
            return Err(anyhow!("duplicate reference should be rejected"));
        };
        assert!(matches!(desk_error(&err), Some(DeskError::Conflict { entity: "reference", .. })));
        assert_eq!(store.list_referrals()?.len(), 1);
        Ok(())
    }

    // Test IDs: STO-005
    #[test]
    fn update_case_appends_actions_and_bumps_version() -> Result<()> {
        let mut store = open_store()?;
        let created = submit_case(&mut store, "Sara Ahmed")?;
        let config = DeskConfig::default();

        let change = store.update_case(created.referral.id, |case| {
            Ok(lifecycle::reply(
                &teacher(),
                case,
                "Parents were contacted",
                &[IncomingFile::new("letter.docx", 4096)],
                &config,
                OffsetDateTime::now_utc(),
            )?)
        })?;
        assert_eq!(change.referral.version, 2);

        let Some(case) = store.load_case(created.referral.id)? else {
            return Err(anyhow!("referral should exist"));
        };
        assert_eq!(case.referral.status, ReferralStatus::UnderReview);
        assert_eq!(case.referral.version, 2);
        assert_eq!(case.actions.len(), 1);
        assert_eq!(case.attachments.len(), 2);
        Ok(())
    }

    // Test IDs: STO-006
    #[test]
    fn stale_version_is_rejected_without_partial_writes() -> Result<()> {
        let mut store = open_store()?;
        let created = submit_case(&mut store, "Sara Ahmed")?;
        let config = DeskConfig::default();

        let result = store.update_case(created.referral.id, |case| {
            let mut change = lifecycle::reply(
                &teacher(),
                case,
                "late write",
                &[],
                &config,
                OffsetDateTime::now_utc(),
            )?;
            change.expected_version = Some(case.referral.version + 7);
            Ok(change)
        });
        let Err(err) = result else {
            return Err(anyhow!("stale version should conflict"));
        };
        assert!(matches!(desk_error(&err), Some(DeskError::Conflict { entity: "referral", .. })));

        let Some(case) = store.load_case(created.referral.id)? else {
            return Err(anyhow!("referral should exist"));
        };
        assert_eq!(case.referral.version, 1);
        assert!(case.actions.is_empty());
        Ok(())
    }

    // Test IDs: STO-007
    #[test]
    fn unknown_referral_is_not_found() -> Result<()> {
        let mut store = open_store()?;
        let result = store.update_case(ReferralId::new(), |_| Err(anyhow!("must not be called")));
        let Err(err) = result else {
            return Err(anyhow!("unknown referral should fail"));
        };
        assert!(matches!(desk_error(&err), Some(DeskError::NotFound { entity: "referral", .. })));
        Ok(())
    }

    // Test IDs: STO-008
    #[test]
    fn student_keys_fill_gaps_and_rebuild() -> Result<()> {
        let mut store = open_store()?;
        let created = submit_case(&mut store, "Sara Ahmed")?;
        store.conn.execute("UPDATE referrals SET student_key = NULL", [])?;

        let written = store.set_student_keys(&[(created.referral.id, "sara-ahmed".to_string())])?;
        assert_eq!(written, 1);
        let rewritten = store.set_student_keys(&[(created.referral.id, "other".to_string())])?;
        assert_eq!(rewritten, 0);

        store.conn.execute("UPDATE referrals SET student_key = 'stale'", [])?;
        let summary = store.rebuild_student_keys()?;
        assert_eq!(summary, KeyRebuildSummary { scanned: 1, updated: 1 });
        let again = store.rebuild_student_keys()?;
        assert_eq!(again.updated, 0);

        let listed = store.list_referrals()?;
        assert_eq!(listed[0].student_key.as_deref(), Some(derive_key("Sara Ahmed", None).as_str()));
        Ok(())
    }

    // Test IDs: STO-009
    #[test]
    fn principals_upsert_and_filter_active() -> Result<()> {
        let mut store = open_store()?;
        store.upsert_principal(&teacher())?;
        store.upsert_principal(&counselor())?;
        let mut retired = principal("c-100", Some(Role::Counselor), false);
        retired.active = false;
        store.upsert_principal(&retired)?;

        let mut renamed = teacher();
        renamed.display_name = "Renamed".to_string();
        store.upsert_principal(&renamed)?;

        assert_eq!(store.list_principals()?.len(), 3);
        assert_eq!(store.find_principal(&UserId::from("t-100"))?, Some(renamed));
        assert_eq!(store.find_principal(&UserId::from("nobody"))?, None);

        let active = PrincipalDirectory::active_principals(&store)?;
        let ids = active.iter().map(|p| p.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["c-200", "t-100"]);
        Ok(())
    }

    // Test IDs: STO-010
    #[test]
    fn threads_persist_messages_and_replies() -> Result<()> {
        let mut store = open_store()?;
        let config = DeskConfig::default();
        let candidates = vec![teacher(), counselor()];
        let changes = desk_threads::start_thread(
            &teacher(),
            &StartThread {
                recipient: Recipient::User(UserId::from("c-200")),
                subject: "Seating plan".to_string(),
                content: "Can we move Sara to the front row?".to_string(),
            },
            &candidates,
            &[IncomingFile::new("plan.png", 1024)],
            &config,
            OffsetDateTime::now_utc(),
        )?;
        store.create_threads(&changes)?;
        let thread_id = changes[0].thread.id;

        store.update_thread(thread_id, |file| {
            Ok(desk_threads::reply(
                &counselor(),
                file,
                "Done",
                &[],
                &config,
                OffsetDateTime::now_utc(),
            )?)
        })?;

        let Some(file) = store.load_thread(thread_id)? else {
            return Err(anyhow!("thread should exist"));
        };
        assert_eq!(file.thread.version, 2);
        assert_eq!(file.messages.len(), 2);
        assert_eq!(file.messages[1].author, UserId::from("c-200"));
        assert_eq!(file.attachments.len(), 1);
        assert_eq!(store.list_threads()?.len(), 1);
        assert_eq!(store.list_messages()?.len(), 2);
        Ok(())
    }

    // Test IDs: STO-011
    #[test]
    fn intake_is_created_once_and_updated_in_place() -> Result<()> {
        let mut store = open_store()?;
        let created = submit_case(&mut store, "Sara Ahmed")?;

        let opened = store.resolve_intake(created.referral.id, |case| {
            Ok(intake::open_intake(&counselor(), case, OffsetDateTime::now_utc())?)
        })?;
        assert!(matches!(opened, IntakeAccess::Created(_)));
        let intake_id = opened.intake().id;

        let reopened = store.resolve_intake(created.referral.id, |case| {
            Ok(intake::open_intake(&counselor(), case, OffsetDateTime::now_utc())?)
        })?;
        assert!(matches!(reopened, IntakeAccess::Existing(_)));
        assert_eq!(reopened.intake().id, intake_id);

        let mut form = reopened.into_intake().form;
        form.counselor_name = "Huda".to_string();
        form.notes.recommendations = "Weekly check-in".to_string();
        store.resolve_intake(created.referral.id, |case| {
            Ok(intake::update_intake(&counselor(), case, form, OffsetDateTime::now_utc())?)
        })?;

        let Some(case) = store.load_case(created.referral.id)? else {
            return Err(anyhow!("referral should exist"));
        };
        let Some(stored) = case.intake else {
            return Err(anyhow!("intake should be stored"));
        };
        assert_eq!(stored.id, intake_id);
        assert_eq!(stored.form.counselor_name, "Huda");
        assert!(stored.has_recommendations());
        Ok(())
    }

    // Test IDs: STO-012
    #[test]
    fn integrity_check_and_backup_succeed() -> Result<()> {
        let mut store = open_store()?;
        submit_case(&mut store, "Sara Ahmed")?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.orphan_attachments.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);

        store.conn.execute(
            "INSERT INTO attachments(attachment_id, owner_kind, owner_id, file_name, file_ref,
               size_bytes, content_hash, uploaded_by, uploaded_at)
             VALUES ('stray', 'action', 'missing-action', 'x.pdf', 'x.pdf', 1, NULL, 't-100',
               '2026-01-01T00:00:00Z')",
            [],
        )?;
        let report = store.integrity_check()?;
        assert_eq!(report.orphan_attachments, vec!["stray".to_string()]);
        store.conn.execute("DELETE FROM attachments WHERE attachment_id = 'stray'", [])?;

        let backup_file =
            std::env::temp_dir().join(format!("referral-desk-backup-{}.sqlite3", Ulid::new()));
        store.backup_database(&backup_file)?;
        let restored = SqliteStore::open(&backup_file)?;
        assert_eq!(restored.list_referrals()?.len(), 1);
        drop(restored);
        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup backup file {}", backup_file.display())
        })?;
        Ok(())
    }

    // Test IDs: STO-013
    #[test]
    fn concurrent_replies_serialize_on_version() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("referral-desk-concurrency-{}.sqlite3", Ulid::new()));
        let referral_id = {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            submit_case(&mut init, "Sara Ahmed")?.referral.id
        };

        let writer_threads = 4;
        let replies_per_thread = 10;
        let mut handles = Vec::new();

        for writer in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = SqliteStore::open(&writer_path)?;
                store.migrate()?;
                let config = DeskConfig::default();
                for reply in 0..replies_per_thread {
                    store.update_case(referral_id, |case| {
                        Ok(lifecycle::reply(
                            &teacher(),
                            case,
                            &format!("writer {writer} reply {reply}"),
                            &[],
                            &config,
                            OffsetDateTime::now_utc(),
                        )?)
                    })?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let Some(case) = store.load_case(referral_id)? else {
            return Err(anyhow!("referral should exist"));
        };
        assert_eq!(case.actions.len(), writer_threads * replies_per_thread);
        assert_eq!(case.referral.version, 41);
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        drop(store);

        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.clone()
            } else {
                std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }

        Ok(())
    }
}
