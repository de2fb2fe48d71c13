use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use loanbook_api::{LoanbookApi, UpsertClientRequest};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "lb")]
#[command(about = "Loanbook client-loan tracker CLI")]
struct Cli {
    #[arg(long, default_value = "./loanbook.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./clients-backup.json")]
    backup: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Client {
        #[command(subcommand)]
        command: Box<ClientCommand>,
    },
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    Add(ClientFieldsArgs),
    Update(ClientUpdateArgs),
    Repay(ClientRepayArgs),
    Delete(ClientIdArgs),
    List,
}

#[derive(Debug, Args)]
struct ClientFieldsArgs {
    #[arg(long)]
    name: String,
    /// Loan amount; numeric strings are accepted.
    #[arg(long)]
    loan: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
}

#[derive(Debug, Args)]
struct ClientUpdateArgs {
    #[arg(long)]
    id: i64,
    #[command(flatten)]
    fields: ClientFieldsArgs,
}

#[derive(Debug, Args)]
struct ClientRepayArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    amount: String,
}

#[derive(Debug, Args)]
struct ClientIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    Export,
    Restore,
    RestoreFile(BackupRestoreFileArgs),
}

#[derive(Debug, Args)]
struct BackupRestoreFileArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "cli_contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "cli_contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

// Amounts pass through as JSON values so the submission layer applies the
// same numeric-or-numeric-string coercion the HTTP boundary gets.
fn amount_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Number(_)) => value,
        _ => Value::String(raw.to_string()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = LoanbookApi::new(cli.db, cli.backup);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Client { command } => run_client(*command, &api),
        Command::Backup { command } => run_backup(command, &api),
    }
}

fn run_db(command: DbCommand, api: &LoanbookApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = api.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }

            let after = api.migrate()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "target_version": after.target_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
    }
}

fn run_client(command: ClientCommand, api: &LoanbookApi) -> Result<()> {
    match command {
        ClientCommand::Add(args) => {
            let result = api.upsert_client(UpsertClientRequest {
                name: args.name,
                loan: amount_value(&args.loan),
                email: args.email,
                phone: args.phone,
            })?;
            emit_json(serde_json::json!({
                "status": result.status.as_str(),
                "client": serde_json::to_value(&result.client)
                    .context("failed to serialize client record")?
            }))
        }
        ClientCommand::Update(args) => {
            let client = api.update_client(
                args.id,
                UpsertClientRequest {
                    name: args.fields.name,
                    loan: amount_value(&args.fields.loan),
                    email: args.fields.email,
                    phone: args.fields.phone,
                },
            )?;
            emit_json(serde_json::to_value(&client).context("failed to serialize client record")?)
        }
        ClientCommand::Repay(args) => {
            let client = api.apply_repayment(args.id, &amount_value(&args.amount))?;
            emit_json(serde_json::to_value(&client).context("failed to serialize client record")?)
        }
        ClientCommand::Delete(args) => {
            api.delete_client(args.id)?;
            emit_json(serde_json::json!({
                "deleted": true,
                "id": args.id
            }))
        }
        ClientCommand::List => {
            let clients = api.list_clients()?;
            emit_json(serde_json::json!({
                "count": clients.len(),
                "clients": serde_json::to_value(&clients)
                    .context("failed to serialize client listing")?
            }))
        }
    }
}

fn run_backup(command: BackupCommand, api: &LoanbookApi) -> Result<()> {
    match command {
        BackupCommand::Export => {
            let report = api.export_backup()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize backup report")?,
            )
        }
        BackupCommand::Restore => {
            let summary = api.restore_from_backup()?;
            emit_json(
                serde_json::to_value(summary).context("failed to serialize restore summary")?,
            )
        }
        BackupCommand::RestoreFile(args) => {
            let summary = api.restore_from_file(&args.input)?;
            emit_json(serde_json::json!({
                "in_file": args.input,
                "inserted": summary.inserted,
                "failed": summary.failed,
                "skipped": summary.skipped
            }))
        }
    }
}
