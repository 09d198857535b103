use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use referral_desk_api::{load_config, ApiError, ApiResult, FsBlobStore, ReferralDeskApi, Upload};
use referral_desk_core::{
    DeskConfig, IntakeForm, Principal, Recipient, ReferralId, Role, Scope, StartThread,
    SubmitReferral, ThreadId, UserId,
};
use referral_desk_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rd")]
#[command(about = "Referral Desk CLI")]
struct Cli {
    #[arg(long, default_value = "./referral_desk.sqlite3")]
    db: PathBuf,

    /// Optional YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "./referral_blobs")]
    blob_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Principal {
        #[command(subcommand)]
        command: PrincipalCommand,
    },
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
    Referral {
        #[command(subcommand)]
        command: Box<ReferralCommand>,
    },
    Intake {
        #[command(subcommand)]
        command: IntakeCommand,
    },
    Thread {
        #[command(subcommand)]
        command: Box<ThreadCommand>,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum PrincipalCommand {
    Upsert(PrincipalUpsertArgs),
    List,
}

#[derive(Debug, Args)]
struct PrincipalUpsertArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: String,
    #[arg(long, value_enum)]
    role: Option<RoleArg>,
    #[arg(long, default_value_t = false)]
    elevated: bool,
    #[arg(long, default_value_t = false)]
    inactive: bool,
}

#[derive(Debug, Subcommand)]
enum KeysCommand {
    Rebuild,
}

#[derive(Debug, Args)]
struct ActorArgs {
    /// Registered principal the command acts as.
    #[arg(long = "as")]
    actor: String,
}

#[derive(Debug, Subcommand)]
enum ReferralCommand {
    Submit(ReferralSubmitArgs),
    Assign(ReferralTargetArgs),
    Escalate(ReferralTargetArgs),
    Reply(ReferralReplyArgs),
    Close(ReferralIdArgs),
    Show(ReferralIdArgs),
    List(ScopedArgs),
    Groups(ActorArgs),
    Report(ActorArgs),
}

#[derive(Debug, Args)]
struct ReferralSubmitArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    student_name: String,
    #[arg(long)]
    civil_id: Option<String>,
    #[arg(long)]
    grade: u8,
    #[arg(long = "type")]
    referral_type: String,
    #[arg(long)]
    details: String,
    #[arg(long = "file")]
    files: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct ReferralIdArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct ReferralTargetArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    id: String,
    #[arg(long)]
    to: String,
}

#[derive(Debug, Args)]
struct ReferralReplyArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    id: String,
    #[arg(long, default_value = "")]
    content: String,
    #[arg(long = "file")]
    files: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct ScopedArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long, value_enum, default_value_t = ScopeArg::All)]
    scope: ScopeArg,
}

#[derive(Debug, Subcommand)]
enum IntakeCommand {
    Show(IntakeShowArgs),
    Update(IntakeUpdateArgs),
}

#[derive(Debug, Args)]
struct IntakeShowArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    referral: String,
}

#[derive(Debug, Args)]
struct IntakeUpdateArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    referral: String,
    /// JSON file holding the full intake form.
    #[arg(long)]
    form: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ThreadCommand {
    Start(ThreadStartArgs),
    List(ScopedArgs),
    Show(ThreadIdArgs),
    Reply(ThreadReplyArgs),
    Close(ThreadIdArgs),
}

#[derive(Debug, Args)]
struct ThreadStartArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long, conflicts_with = "everyone", required_unless_present = "everyone")]
    to: Option<String>,
    #[arg(long, default_value_t = false)]
    everyone: bool,
    #[arg(long)]
    subject: String,
    #[arg(long)]
    content: String,
    #[arg(long = "file")]
    files: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct ThreadIdArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct ThreadReplyArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    id: String,
    #[arg(long, default_value = "")]
    content: String,
    #[arg(long = "file")]
    files: Vec<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Manager,
    Counselor,
    StudentAffairsDeputy,
    SchoolAffairsDeputy,
    EducationalAffairsDeputy,
    Administrative,
    Teacher,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Manager => Self::Manager,
            RoleArg::Counselor => Self::Counselor,
            RoleArg::StudentAffairsDeputy => Self::StudentAffairsDeputy,
            RoleArg::SchoolAffairsDeputy => Self::SchoolAffairsDeputy,
            RoleArg::EducationalAffairsDeputy => Self::EducationalAffairsDeputy,
            RoleArg::Administrative => Self::Administrative,
            RoleArg::Teacher => Self::Teacher,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    All,
    Sent,
    Inbox,
}

impl From<ScopeArg> for Scope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::All => Self::All,
            ScopeArg::Sent => Self::Sent,
            ScopeArg::Inbox => Self::Inbox,
        }
    }
}

type DeskApi = ReferralDeskApi<FsBlobStore>;

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

/// Keeps the stable error code at the top of the reported chain.
fn settle<T>(result: ApiResult<T>) -> Result<T> {
    result.map_err(|err: ApiError| {
        let code = err.code();
        anyhow::Error::new(err).context(format!("error code: {code}"))
    })
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => load_config(path)?,
        None => DeskConfig::default(),
    };
    tracing::debug!(db = %cli.db.display(), config = ?cli.config, "starting rd");

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Config { command: ConfigCommand::Show } => emit(&config),
        command => {
            let api = ReferralDeskApi::with_parts(cli.db, config, FsBlobStore::new(cli.blob_dir));
            run_desk(command, &api)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit(&report)
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_desk(command: Command, api: &DeskApi) -> Result<()> {
    match command {
        Command::Principal { command } => run_principal(command, api),
        Command::Keys { command: KeysCommand::Rebuild } => {
            emit(&settle(api.rebuild_student_keys())?)
        }
        Command::Referral { command } => run_referral(*command, api),
        Command::Intake { command } => run_intake(command, api),
        Command::Thread { command } => run_thread(*command, api),
        Command::Db { .. } | Command::Config { .. } => {
            Err(anyhow!("command is handled before the desk api is opened"))
        }
    }
}

fn run_principal(command: PrincipalCommand, api: &DeskApi) -> Result<()> {
    match command {
        PrincipalCommand::Upsert(args) => {
            let principal = Principal {
                id: UserId::new(args.id),
                display_name: args.name,
                active: !args.inactive,
                role: args.role.map(Role::from),
                elevated: args.elevated,
            };
            settle(api.upsert_principal(&principal))?;
            emit(&principal)
        }
        PrincipalCommand::List => {
            let principals = settle(api.list_principals())?;
            emit_json(serde_json::json!({ "principals": principals }))
        }
    }
}

fn actor(api: &DeskApi, args: &ActorArgs) -> Result<Principal> {
    settle(api.principal(&UserId::new(args.actor.as_str())))
}

fn referral_id(raw: &str) -> Result<ReferralId> {
    ReferralId::parse(raw).map_err(|err| anyhow!("invalid referral id `{raw}`: {err}"))
}

fn thread_id(raw: &str) -> Result<ThreadId> {
    ThreadId::parse(raw).map_err(|err| anyhow!("invalid thread id `{raw}`: {err}"))
}

fn read_uploads(paths: &[PathBuf]) -> Result<Vec<Upload>> {
    paths
        .iter()
        .map(|path| {
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("attachment path has no file name: {}", path.display()))?;
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read attachment {}", path.display()))?;
            Ok(Upload::new(file_name, bytes))
        })
        .collect()
}

fn run_referral(command: ReferralCommand, api: &DeskApi) -> Result<()> {
    match command {
        ReferralCommand::Submit(args) => {
            let principal = actor(api, &args.actor)?;
            let uploads = read_uploads(&args.files)?;
            let input = SubmitReferral {
                student_name: args.student_name,
                civil_id: args.civil_id,
                grade: args.grade,
                referral_type: args.referral_type,
                details: args.details,
            };
            emit(&settle(api.submit_referral(&principal, &input, &uploads))?)
        }
        ReferralCommand::Assign(args) => {
            let principal = actor(api, &args.actor)?;
            let target = UserId::new(args.to);
            emit(&settle(api.assign_referral(&principal, referral_id(&args.id)?, &target))?)
        }
        ReferralCommand::Escalate(args) => {
            let principal = actor(api, &args.actor)?;
            let deputy = UserId::new(args.to);
            emit(&settle(api.escalate_referral(&principal, referral_id(&args.id)?, &deputy))?)
        }
        ReferralCommand::Reply(args) => {
            let principal = actor(api, &args.actor)?;
            let uploads = read_uploads(&args.files)?;
            emit(&settle(api.reply_referral(
                &principal,
                referral_id(&args.id)?,
                &args.content,
                &uploads,
            ))?)
        }
        ReferralCommand::Close(args) => {
            let principal = actor(api, &args.actor)?;
            emit(&settle(api.close_referral(&principal, referral_id(&args.id)?))?)
        }
        ReferralCommand::Show(args) => {
            let principal = actor(api, &args.actor)?;
            emit(&settle(api.referral_detail(&principal, referral_id(&args.id)?))?)
        }
        ReferralCommand::List(args) => {
            let principal = actor(api, &args.actor)?;
            emit(&settle(api.list_referrals(&principal, args.scope.into()))?)
        }
        ReferralCommand::Groups(args) => {
            let principal = actor(api, &args)?;
            let groups = settle(api.group_by_student(&principal))?;
            emit_json(serde_json::json!({ "groups": groups }))
        }
        ReferralCommand::Report(args) => {
            let principal = actor(api, &args)?;
            emit(&settle(api.report_totals(&principal))?)
        }
    }
}

fn read_form(path: &Path) -> Result<IntakeForm> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read intake form {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse intake form {}", path.display()))
}

fn run_intake(command: IntakeCommand, api: &DeskApi) -> Result<()> {
    match command {
        IntakeCommand::Show(args) => {
            let principal = actor(api, &args.actor)?;
            emit(&settle(api.open_intake(&principal, referral_id(&args.referral)?))?)
        }
        IntakeCommand::Update(args) => {
            let principal = actor(api, &args.actor)?;
            let form = read_form(&args.form)?;
            emit(&settle(api.update_intake(&principal, referral_id(&args.referral)?, form))?)
        }
    }
}

fn run_thread(command: ThreadCommand, api: &DeskApi) -> Result<()> {
    match command {
        ThreadCommand::Start(args) => {
            let principal = actor(api, &args.actor)?;
            let recipient = match args.to {
                Some(to) if !args.everyone => Recipient::User(UserId::new(to)),
                _ => Recipient::Everyone,
            };
            let uploads = read_uploads(&args.files)?;
            let input = StartThread { recipient, subject: args.subject, content: args.content };
            let threads = settle(api.start_thread(&principal, &input, &uploads))?;
            emit_json(serde_json::json!({ "threads": threads }))
        }
        ThreadCommand::List(args) => {
            let principal = actor(api, &args.actor)?;
            emit(&settle(api.list_threads(&principal, args.scope.into()))?)
        }
        ThreadCommand::Show(args) => {
            let principal = actor(api, &args.actor)?;
            emit(&settle(api.thread_detail(&principal, thread_id(&args.id)?))?)
        }
        ThreadCommand::Reply(args) => {
            let principal = actor(api, &args.actor)?;
            let uploads = read_uploads(&args.files)?;
            emit(&settle(api.reply_thread(
                &principal,
                thread_id(&args.id)?,
                &args.content,
                &uploads,
            ))?)
        }
        ThreadCommand::Close(args) => {
            let principal = actor(api, &args.actor)?;
            emit(&settle(api.close_thread(&principal, thread_id(&args.id)?))?)
        }
    }
}
