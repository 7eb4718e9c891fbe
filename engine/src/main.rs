//! Command-line front end for the state engine.
//!
//! Sessions live under the configured data directory (`.engine/data` by
//! default), one JSON file per shard. Results are printed to stdout as JSON.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};

use engine::controller::{ControllerError, StateController};
use engine::core::batch::parse_command_batch;
use engine::core::policy::PathPolicy;
use engine::core::schema::SchemaRegistry;
use engine::core::shards::ShardKey;
use engine::core::types::CommandFailure;
use engine::core::validator::CommandValidator;
use engine::exit_codes;
use engine::io::backend::FileBackend;
use engine::io::config::{EngineConfig, config_path, load_config, write_config};
use engine::io::shard_store::is_valid_session_id;
use engine::logging;

#[derive(Parser)]
#[command(
    name = "engine",
    version,
    about = "Path-addressed command engine with sharded persistence"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.engine/config.toml` with defaults if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Validate a command batch without applying it.
    Validate {
        /// Batch file (`-` for stdin).
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Apply a command batch to a session and persist the touched shards.
    Apply {
        #[arg(short, long)]
        session: String,
        /// Batch file (`-` for stdin).
        #[arg(short, long)]
        file: PathBuf,
        /// Start from defaults when the stored session is corrupt.
        #[arg(long)]
        reset_on_corrupt: bool,
    },
    /// Print a session's aggregate, or one stored shard. Never writes.
    Show {
        #[arg(short, long)]
        session: String,
        /// Shard name (e.g. `attributes`, `memory_short_term`).
        #[arg(long)]
        shard: Option<String>,
    },
    /// Delete every stored key of a session.
    Clear {
        #[arg(short, long)]
        session: String,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = Path::new(".");
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Validate { file } => cmd_validate(root, &file),
        Command::Apply {
            session,
            file,
            reset_on_corrupt,
        } => cmd_apply(root, &session, &file, reset_on_corrupt).await,
        Command::Show { session, shard } => cmd_show(root, &session, shard.as_deref()).await,
        Command::Clear { session } => cmd_clear(root, &session).await,
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let path = config_path(root);
    if force || !path.exists() {
        write_config(&path, &EngineConfig::default())?;
    }
    let cfg = load_config(&path)?;
    fs::create_dir_all(root.join(&cfg.data_dir))
        .with_context(|| format!("create data directory {}", cfg.data_dir.display()))?;
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct ValidationReport {
    index: usize,
    valid: bool,
    command: Option<Value>,
    errors: Vec<CommandFailure>,
    warnings: Vec<String>,
}

fn cmd_validate(root: &Path, file: &Path) -> Result<i32> {
    let cfg = load_config(&config_path(root))?;
    let validator = CommandValidator::new(
        PathPolicy::from_config(&cfg.policy)?,
        SchemaRegistry::builtin()?,
    );
    let batch = parse_command_batch(&read_input(file)?)?;
    let reports: Vec<ValidationReport> = validator
        .validate_batch(&batch)
        .into_iter()
        .enumerate()
        .map(|(index, result)| ValidationReport {
            index,
            valid: result.is_valid(),
            command: result.command.as_ref().map(|command| {
                json!({
                    "action": command.action.label(),
                    "path": command.path.to_string(),
                    "value": command.value,
                })
            }),
            errors: result
                .errors
                .iter()
                .map(|error| CommandFailure::from_raw(index, &batch[index], error))
                .collect(),
            warnings: result.warnings,
        })
        .collect();
    print_json(&reports)?;
    let all_valid = reports.iter().all(|report| report.valid);
    Ok(if all_valid {
        exit_codes::OK
    } else {
        exit_codes::REJECTED
    })
}

async fn cmd_apply(root: &Path, session: &str, file: &Path, reset_on_corrupt: bool) -> Result<i32> {
    let batch = parse_command_batch(&read_input(file)?)?;
    let mut controller = open_controller(root)?;
    match controller.load_session(session).await {
        Ok(_) => {}
        Err(ControllerError::Corrupt { .. }) if reset_on_corrupt => {
            controller.start_default_session(session)?;
        }
        Err(err) => return Err(err).with_context(|| format!("load session {session}")),
    }
    let outcome = controller.submit_commands(&batch).await?;
    let flushed = controller.exit_session().await?;
    print_json(&json!({"batch": outcome, "flush": flushed}))?;
    Ok(if outcome.failures.is_empty() {
        exit_codes::OK
    } else {
        exit_codes::REJECTED
    })
}

async fn cmd_show(root: &Path, session: &str, shard: Option<&str>) -> Result<i32> {
    let controller = open_controller(root)?;
    if let Some(name) = shard {
        let key = ShardKey::from_name(name).with_context(|| format!("unknown shard '{name}'"))?;
        let value = controller.read_stored_shard(session, key).await?;
        print_json(&value.unwrap_or_else(|| key.default_value()))?;
        return Ok(exit_codes::OK);
    }
    let document = controller
        .peek_session(session)
        .await
        .with_context(|| format!("read session {session}"))?;
    print_json(&document)?;
    Ok(exit_codes::OK)
}

async fn cmd_clear(root: &Path, session: &str) -> Result<i32> {
    let controller = open_controller(root)?;
    if !is_valid_session_id(session) {
        return Err(ControllerError::InvalidSession(session.to_string()).into());
    }
    let report = controller.store().clear_all(session).await;
    print_json(&report)?;
    Ok(if report.failed.is_empty() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn open_controller(root: &Path) -> Result<StateController<FileBackend>> {
    let cfg = load_config(&config_path(root))?;
    let backend = FileBackend::new(root.join(&cfg.data_dir));
    StateController::from_config(backend, &cfg)
}

fn read_input(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read batch from stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(file).with_context(|| format!("read {}", file.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_apply() {
        let cli = Cli::parse_from(["engine", "apply", "--session", "s1", "--file", "batch.json"]);
        match cli.command {
            Command::Apply {
                session,
                file,
                reset_on_corrupt,
            } => {
                assert_eq!(session, "s1");
                assert_eq!(file, PathBuf::from("batch.json"));
                assert!(!reset_on_corrupt);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn parse_show_with_shard() {
        let cli = Cli::parse_from(["engine", "show", "-s", "s1", "--shard", "realm"]);
        assert!(matches!(
            cli.command,
            Command::Show { shard: Some(ref name), .. } if name == "realm"
        ));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["engine", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }
}
