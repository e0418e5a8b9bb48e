//! `safekeep`: operator CLI for the `SafeKeep` safe authorization engine.
//!
//! Runs the core in-process against a local store (in-memory or redb) and
//! prints every result as JSON on stdout. Failures are printed as a JSON
//! object with the error kind on stderr and exit with status 1. Logs are
//! JSON lines on stderr.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use safekeep_core::SafeKeep;
use safekeep_core::approle::{AppRolePatch, AppRoleSpec};
use safekeep_core::audit::AuditLog;
use safekeep_core::audit_file::FileAuditSink;
use safekeep_core::aws::{AwsRolePatch, Ec2RoleSpec, IamRoleSpec};
use safekeep_core::binding::{Ec2Bounds, IamBounds};
use safekeep_core::policy::PermissionLevel;
use safekeep_core::principal::{OpenDirectory, Principal, PrincipalKey};
use safekeep_core::safe::{SafeMetadata, SafePatch};
use safekeep_core::store::KvSecretStore;
use safekeep_storage::{MemoryBackend, RedbBackend, StorageBackend};

use crate::config::{CliConfig, StorageBackendType};

// ── CLI structure ────────────────────────────────────────────────────

/// SafeKeep: safes, grants and machine identities for a secrets store.
#[derive(Parser)]
#[command(
    name = "safekeep",
    version,
    about = "SafeKeep CLI: manage safes, grants, AppRoles and AWS roles",
    long_about = None,
    after_help = "Environment variables:\n  \
         SAFEKEEP_STORAGE        memory | redb (default: memory)\n  \
         SAFEKEEP_STORAGE_PATH   redb file (default: ./safekeep.redb)\n  \
         SAFEKEEP_AUDIT_FILE     JSON lines audit log\n  \
         SAFEKEEP_ADMINS         comma-separated kind:id administrators\n\n\
         Examples:\n  \
         safekeep --as user:alice safe create shared/team --description 'team secrets'\n  \
         safekeep --as user:alice safe grant shared/team group:devs read\n  \
         safekeep --as user:alice approle create ci-runner --token-ttl 600 --token-max-ttl 3600"
)]
struct Cli {
    /// Principal performing the operation, as `kind:id`.
    #[arg(id = "actor", long = "as", env = "SAFEKEEP_PRINCIPAL", global = true, value_name = "KIND:ID")]
    principal: Option<PrincipalKey>,

    /// Group memberships of a user principal.
    #[arg(long, env = "SAFEKEEP_GROUPS", global = true, value_delimiter = ',')]
    groups: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Safe lifecycle, grants and ownership.
    Safe {
        #[command(subcommand)]
        action: SafeCommands,
    },
    /// AppRole lifecycle, secret ids and safe associations.
    Approle {
        #[command(subcommand)]
        action: AppRoleCommands,
    },
    /// AWS EC2 and IAM roles.
    Aws {
        #[command(subcommand)]
        action: AwsCommands,
    },
}

#[derive(Subcommand)]
enum SafeCommands {
    /// Create a safe owned by the caller.
    Create {
        /// Safe path: `apps/<name>`, `shared/<name>` or `users/<name>`.
        path: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Show a safe with its grants.
    Get { path: String },
    /// Change safe metadata.
    Update {
        path: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete an empty safe.
    Delete { path: String },
    /// Depth-first listing of the folders below a path.
    List {
        path: String,
        #[arg(long, default_value = "100")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Every safe the caller can access.
    ListAll {
        /// Case-insensitive path filter.
        #[arg(long)]
        search: Option<String>,
        /// Maximum number of safes; all when omitted.
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Names of the visible safes grouped by type.
    Names,
    /// Grant a principal a level on a safe or folder.
    Grant {
        path: String,
        /// Grantee as `kind:id`.
        principal: PrincipalKey,
        /// `deny`, `read` or `write`.
        level: PermissionLevel,
    },
    /// Remove a principal's grant on a safe or folder.
    Revoke { path: String, principal: PrincipalKey },
    /// Transfer ownership of a safe to another user.
    Transfer { path: String, new_owner: PrincipalKey },
}

#[derive(Args)]
struct TtlArgs {
    /// Token TTL in seconds (0 = server default).
    #[arg(long, default_value = "0")]
    token_ttl: i64,
    /// Token max TTL in seconds (0 = server default).
    #[arg(long, default_value = "0")]
    token_max_ttl: i64,
    /// Comma-separated policy names.
    #[arg(long, value_delimiter = ',')]
    policies: Vec<String>,
}

#[derive(Args)]
struct TtlPatchArgs {
    #[arg(long)]
    token_ttl: Option<i64>,
    #[arg(long)]
    token_max_ttl: Option<i64>,
    /// Replace the policy list.
    #[arg(long, value_delimiter = ',')]
    policies: Option<Vec<String>>,
}

#[derive(Args)]
struct AppRoleArgs {
    name: String,
    #[command(flatten)]
    ttls: TtlArgs,
    /// Secret id TTL in seconds (0 = no expiry).
    #[arg(long, default_value = "0")]
    secret_id_ttl: i64,
    /// Uses per secret id (0 = unlimited).
    #[arg(long, default_value = "0")]
    secret_id_num_uses: i64,
    #[arg(long, value_delimiter = ',')]
    token_bound_cidrs: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    secret_id_bound_cidrs: Vec<String>,
    /// Do not require a secret id at login.
    #[arg(long)]
    no_bind_secret_id: bool,
}

#[derive(Args)]
struct AppRolePatchArgs {
    name: String,
    #[command(flatten)]
    ttls: TtlPatchArgs,
    #[arg(long)]
    secret_id_ttl: Option<i64>,
    #[arg(long)]
    secret_id_num_uses: Option<i64>,
    #[arg(long, value_delimiter = ',')]
    token_bound_cidrs: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    secret_id_bound_cidrs: Option<Vec<String>>,
    #[arg(long)]
    bind_secret_id: Option<bool>,
}

#[derive(Subcommand)]
enum AppRoleCommands {
    /// Create an AppRole owned by the caller.
    Create(AppRoleArgs),
    /// Show an AppRole with its role id and associations.
    Read { name: String },
    /// Change the supplied AppRole fields.
    Update(AppRolePatchArgs),
    /// Delete an AppRole, its secret ids and associations.
    Delete { name: String },
    /// Show the role id.
    RoleId { name: String },
    /// Issue a secret id. The value is printed once.
    SecretId { name: String },
    /// List live secret id accessors.
    Accessors { name: String },
    /// Revoke secret ids by accessor.
    Revoke {
        name: String,
        #[arg(required = true, num_args = 1..)]
        accessors: Vec<String>,
    },
    /// Associate the AppRole with a safe.
    Associate {
        name: String,
        safe: String,
        level: PermissionLevel,
    },
    /// Remove the AppRole's association with a safe.
    Disassociate { name: String, safe: String },
    /// List the AppRole's safe associations.
    Associations { name: String },
    /// Show the AppRole's owner.
    Owner { name: String },
    /// List the caller's AppRoles.
    List {
        #[arg(long, default_value = "100")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
}

#[derive(Args)]
struct Ec2BoundsArgs {
    #[arg(long, value_delimiter = ',')]
    bound_ami_id: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bound_account_id: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bound_region: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bound_vpc_id: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bound_subnet_id: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bound_iam_role_arn: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    bound_iam_instance_profile_arn: Vec<String>,
}

impl Ec2BoundsArgs {
    fn is_empty(&self) -> bool {
        self.bound_ami_id.is_empty()
            && self.bound_account_id.is_empty()
            && self.bound_region.is_empty()
            && self.bound_vpc_id.is_empty()
            && self.bound_subnet_id.is_empty()
            && self.bound_iam_role_arn.is_empty()
            && self.bound_iam_instance_profile_arn.is_empty()
    }
}

impl From<Ec2BoundsArgs> for Ec2Bounds {
    fn from(a: Ec2BoundsArgs) -> Self {
        Self {
            bound_ami_id: a.bound_ami_id,
            bound_account_id: a.bound_account_id,
            bound_region: a.bound_region,
            bound_vpc_id: a.bound_vpc_id,
            bound_subnet_id: a.bound_subnet_id,
            bound_iam_role_arn: a.bound_iam_role_arn,
            bound_iam_instance_profile_arn: a.bound_iam_instance_profile_arn,
        }
    }
}

#[derive(Subcommand)]
enum AwsCommands {
    /// Create an EC2 role owned by the caller.
    CreateEc2 {
        name: String,
        #[command(flatten)]
        bounds: Ec2BoundsArgs,
        #[command(flatten)]
        ttls: TtlArgs,
    },
    /// Create an IAM role owned by the caller.
    CreateIam {
        name: String,
        #[arg(long = "bound-iam-principal-arn", value_delimiter = ',', required = true)]
        principal_arns: Vec<String>,
        #[command(flatten)]
        ttls: TtlArgs,
    },
    /// Change TTLs, policies or bounds of an AWS role.
    Update {
        name: String,
        #[command(flatten)]
        bounds: Ec2BoundsArgs,
        /// Replace the IAM principal ARNs (IAM roles only).
        #[arg(long = "bound-iam-principal-arn", value_delimiter = ',')]
        principal_arns: Vec<String>,
        #[command(flatten)]
        ttls: TtlPatchArgs,
    },
    /// Attach an AWS role to a safe.
    Attach {
        name: String,
        safe: String,
        level: PermissionLevel,
    },
    /// Detach an AWS role from a safe, keeping the role.
    Detach { name: String, safe: String },
    /// Detach an AWS role from a safe and delete the role.
    Delete { name: String, safe: String },
    /// List the caller's AWS roles.
    List,
}

// ── Setup ────────────────────────────────────────────────────────────

fn init_tracing(config: &CliConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();
}

async fn build_engine(config: &CliConfig) -> Result<SafeKeep> {
    let storage: Arc<dyn StorageBackend> = match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (state is discarded on exit)");
            Arc::new(MemoryBackend::new())
        }
        StorageBackendType::Redb { path } => {
            info!(path = %path, "using redb storage");
            Arc::new(RedbBackend::open(path).context("failed to open redb storage")?)
        }
    };

    let audit = Arc::new(AuditLog::new());
    if let Some(path) = &config.audit_file_path {
        info!(path = %path, "file audit enabled");
        audit.add_sink(Arc::new(FileAuditSink::new(path))).await;
    }

    Ok(SafeKeep::new(
        config.engine.clone(),
        Arc::new(KvSecretStore::new(storage)),
        Arc::new(OpenDirectory),
        audit,
    ))
}

fn actor(principal: Option<PrincipalKey>, groups: &[String]) -> Result<Principal> {
    let key = principal.context("no principal: pass --as <kind:id> or set SAFEKEEP_PRINCIPAL")?;
    Ok(Principal::from(key).with_groups(groups))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to serialize result")
}

fn error_json(e: &anyhow::Error) -> Value {
    match e.downcast_ref::<safekeep_core::Error>() {
        Some(core) => {
            let mut body = json!({ "kind": core.kind().as_str(), "message": core.to_string() });
            if let safekeep_core::Error::PartialFailure { steps, .. } = core {
                body["steps"] = serde_json::to_value(steps).unwrap_or(Value::Null);
            }
            json!({ "error": body })
        }
        None => json!({ "error": { "kind": "cli", "message": format!("{e:#}") } }),
    }
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = CliConfig::from_env();
    init_tracing(&config);

    match run(cli, &config).await {
        Ok(output) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string())
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", error_json(&e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: &CliConfig) -> Result<Value> {
    let actor = actor(cli.principal, &cli.groups)?;
    let engine = build_engine(config).await?;

    match cli.command {
        Commands::Safe { action } => cmd_safe(&engine, &actor, action).await,
        Commands::Approle { action } => cmd_approle(&engine, &actor, action).await,
        Commands::Aws { action } => cmd_aws(&engine, &actor, action).await,
    }
}

// ── Safe commands ────────────────────────────────────────────────────

async fn cmd_safe(engine: &SafeKeep, actor: &Principal, action: SafeCommands) -> Result<Value> {
    let safes = engine.safes();
    match action {
        SafeCommands::Create { path, description } => {
            to_json(&safes.create_safe(actor, &path, SafeMetadata { description }).await?)
        }
        SafeCommands::Get { path } => to_json(&safes.get_safe(actor, &path).await?),
        SafeCommands::Update { path, description } => {
            to_json(&safes.update_safe(actor, &path, SafePatch { description }).await?)
        }
        SafeCommands::Delete { path } => {
            safes.delete_safe(actor, &path).await?;
            Ok(json!({ "deleted": path }))
        }
        SafeCommands::List {
            path,
            limit,
            offset,
        } => to_json(&safes.list_recursive(actor, &path, limit, offset).await?),
        SafeCommands::ListAll {
            search,
            limit,
            offset,
        } => to_json(
            &safes
                .list_safes_page(actor, search.as_deref(), limit, offset)
                .await?,
        ),
        SafeCommands::Names => to_json(&safes.list_safe_names(actor).await?),
        SafeCommands::Grant {
            path,
            principal,
            level,
        } => {
            let changed = safes.add_grant(actor, &path, &principal, level).await?;
            Ok(json!({ "path": path, "principal": principal, "level": level, "changed": changed }))
        }
        SafeCommands::Revoke { path, principal } => {
            let changed = safes.remove_grant(actor, &path, &principal).await?;
            Ok(json!({ "path": path, "principal": principal, "changed": changed }))
        }
        SafeCommands::Transfer { path, new_owner } => {
            to_json(&engine.transfers().transfer(actor, &path, &new_owner).await?)
        }
    }
}

// ── AppRole commands ─────────────────────────────────────────────────

async fn cmd_approle(
    engine: &SafeKeep,
    actor: &Principal,
    action: AppRoleCommands,
) -> Result<Value> {
    let roles = engine.approles();
    match action {
        AppRoleCommands::Create(args) => {
            let spec = AppRoleSpec {
                name: args.name,
                bind_secret_id: !args.no_bind_secret_id,
                token_ttl_secs: args.ttls.token_ttl,
                token_max_ttl_secs: args.ttls.token_max_ttl,
                secret_id_ttl_secs: args.secret_id_ttl,
                secret_id_num_uses: args.secret_id_num_uses,
                token_bound_cidrs: args.token_bound_cidrs,
                secret_id_bound_cidrs: args.secret_id_bound_cidrs,
                policies: args.ttls.policies,
            };
            to_json(&roles.create_app_role(actor, spec).await?)
        }
        AppRoleCommands::Read { name } => to_json(&roles.read_app_role_details(actor, &name).await?),
        AppRoleCommands::Update(args) => {
            let patch = AppRolePatch {
                bind_secret_id: args.bind_secret_id,
                token_ttl_secs: args.ttls.token_ttl,
                token_max_ttl_secs: args.ttls.token_max_ttl,
                secret_id_ttl_secs: args.secret_id_ttl,
                secret_id_num_uses: args.secret_id_num_uses,
                token_bound_cidrs: args.token_bound_cidrs,
                secret_id_bound_cidrs: args.secret_id_bound_cidrs,
                policies: args.ttls.policies,
            };
            to_json(&roles.update_app_role(actor, &args.name, patch).await?)
        }
        AppRoleCommands::Delete { name } => {
            let steps = roles.delete_app_role(actor, &name).await?;
            Ok(json!({ "deleted": name, "steps": steps }))
        }
        AppRoleCommands::RoleId { name } => {
            let role_id = roles.read_role_id(actor, &name).await?;
            Ok(json!({ "role_name": name, "role_id": role_id }))
        }
        AppRoleCommands::SecretId { name } => to_json(&roles.issue_secret_id(actor, &name).await?),
        AppRoleCommands::Accessors { name } => {
            to_json(&roles.read_secret_id_accessors(actor, &name).await?)
        }
        AppRoleCommands::Revoke { name, accessors } => {
            to_json(&roles.revoke_secret_ids(actor, &name, &accessors).await?)
        }
        AppRoleCommands::Associate { name, safe, level } => {
            let changed = roles.associate(actor, &name, &safe, level).await?;
            Ok(json!({ "role_name": name, "safe": safe, "level": level, "changed": changed }))
        }
        AppRoleCommands::Disassociate { name, safe } => {
            let changed = roles.disassociate(actor, &name, &safe).await?;
            Ok(json!({ "role_name": name, "safe": safe, "changed": changed }))
        }
        AppRoleCommands::Associations { name } => {
            to_json(&roles.list_entity_associations(&name).await?)
        }
        AppRoleCommands::Owner { name } => to_json(&roles.get_owner(&name).await?),
        AppRoleCommands::List { limit, offset } => {
            to_json(&roles.list_app_roles(actor, limit, offset).await?)
        }
    }
}

// ── AWS commands ─────────────────────────────────────────────────────

async fn cmd_aws(engine: &SafeKeep, actor: &Principal, action: AwsCommands) -> Result<Value> {
    let aws = engine.aws_roles();
    match action {
        AwsCommands::CreateEc2 { name, bounds, ttls } => {
            let spec = Ec2RoleSpec {
                name,
                bounds: bounds.into(),
                token_ttl_secs: ttls.token_ttl,
                token_max_ttl_secs: ttls.token_max_ttl,
                policies: ttls.policies,
            };
            to_json(&aws.create_ec2_role(actor, spec).await?)
        }
        AwsCommands::CreateIam {
            name,
            principal_arns,
            ttls,
        } => {
            let spec = IamRoleSpec {
                name,
                bounds: IamBounds {
                    bound_iam_principal_arn: principal_arns,
                },
                token_ttl_secs: ttls.token_ttl,
                token_max_ttl_secs: ttls.token_max_ttl,
                policies: ttls.policies,
            };
            to_json(&aws.create_iam_role(actor, spec).await?)
        }
        AwsCommands::Update {
            name,
            bounds,
            principal_arns,
            ttls,
        } => {
            let patch = AwsRolePatch {
                token_ttl_secs: ttls.token_ttl,
                token_max_ttl_secs: ttls.token_max_ttl,
                policies: ttls.policies,
                ec2: (!bounds.is_empty()).then(|| bounds.into()),
                iam: (!principal_arns.is_empty()).then(|| IamBounds {
                    bound_iam_principal_arn: principal_arns,
                }),
            };
            to_json(&aws.update_aws_role(actor, &name, patch).await?)
        }
        AwsCommands::Attach { name, safe, level } => {
            let changed = aws.add_aws_role_to_safe(actor, &safe, &name, level).await?;
            Ok(json!({ "role_name": name, "safe": safe, "level": level, "changed": changed }))
        }
        AwsCommands::Detach { name, safe } => {
            let changed = aws.detach_aws_role(actor, &safe, &name).await?;
            Ok(json!({ "role_name": name, "safe": safe, "changed": changed }))
        }
        AwsCommands::Delete { name, safe } => {
            aws.delete_aws_role(actor, &safe, &name).await?;
            Ok(json!({ "deleted": name, "safe": safe }))
        }
        AwsCommands::List => to_json(&aws.list_aws_roles(actor).await?),
    }
}
