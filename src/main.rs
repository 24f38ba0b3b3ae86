//! `morph` - operate the self-authoring UI runtime against a local database.
//!
//! Settings come from `~/.morph/settings.json` and `MORPH_*` environment
//! variables; `--db` and `--log-level` override them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;

use morph_core::tools::ToolDefinition;
use morph_engine::{LocalTool, Runtime, RuntimeConfig, UnitController, UnitSpec};
use morph_llm::{TranscriptLog, Transport};
use morph_settings::{load_settings, MorphSettings};
use morph_store::{Database, DurableStore, SqliteStore};
use morph_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "morph")]
#[command(version, about = "Self-authoring UI runtime", long_about = None)]
struct Args {
    /// Database path (overrides storage.dbPath)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Log level (overrides logging.level)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every virtual source path
    Sources,
    /// Print one source file
    Show { path: String },
    /// Print all shared atoms
    Atoms,
    /// Wipe storage and re-seed the entry point
    Reset,
    /// Mount a unit, author it if needed, render once and print the view
    Mount {
        id: String,
        /// Declared inputs as a JSON object
        #[arg(long, default_value = "{}")]
        inputs: String,
        /// Domain tool as `name:description` (repeatable)
        #[arg(long = "tool", value_name = "NAME:DESCRIPTION")]
        tools: Vec<String>,
        /// Handler name (repeatable)
        #[arg(long = "handler", value_name = "NAME")]
        handlers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings().context("failed to load settings")?;
    if let Some(db) = &args.db {
        settings.storage.db_path = db.display().to_string();
    }
    if let Some(level) = &args.log_level {
        settings.logging.level = level.clone();
    }

    init_telemetry(&TelemetryConfig::from_level_str(&settings.logging.level, settings.logging.json))?;

    let runtime = open_runtime(&settings).await?;
    match args.command {
        Command::Sources => {
            for path in runtime.sources().list() {
                println!("{path}");
            }
        }
        Command::Show { path } => match runtime.sources().get(&path) {
            Some(text) => print!("{text}"),
            None => bail!("no such source: {path}"),
        },
        Command::Atoms => {
            for (key, value) in runtime.atoms().snapshot() {
                println!("{key} = {value}");
            }
        }
        Command::Reset => {
            let status = runtime.reset().await?;
            println!("reset; pipeline {status}");
        }
        Command::Mount {
            id,
            inputs,
            tools,
            handlers,
        } => {
            let spec = unit_spec(&id, &inputs, &tools, handlers)?;
            let unit = UnitController::mount(&runtime, spec)?;
            let state = unit.sync().await?;
            info!(component_id = %unit.id(), %state, "unit synced");
            let view = unit.render().await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }

    runtime.atoms().flush().await;
    Ok(())
}

async fn open_runtime(settings: &MorphSettings) -> Result<Arc<Runtime>> {
    settings.validate()?;
    let db_path = PathBuf::from(&settings.storage.db_path);
    let db = Database::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::new(db));

    let transport = Transport::from_settings(&settings.model, Arc::new(TranscriptLog::new()))?;
    info!(backend = transport.backend_name(), model = transport.model(), "model transport ready");

    let runtime = Runtime::new(store, Arc::new(transport), RuntimeConfig::from_settings(&settings.runtime));
    let status = runtime.start().await?;
    info!(%status, "runtime started");
    Ok(runtime)
}

fn unit_spec(id: &str, inputs: &str, tools: &[String], handlers: Vec<String>) -> Result<UnitSpec> {
    let inputs: Map<String, Value> = match serde_json::from_str::<Value>(inputs).context("--inputs is not valid JSON")? {
        Value::Object(map) => map,
        other => bail!("--inputs must be a JSON object, got {other}"),
    };

    let mut spec = UnitSpec::new(id).inputs(inputs);
    for tool in tools {
        let (name, description) = tool.split_once(':').unwrap_or((tool.as_str(), ""));
        spec = spec.tool(LocalTool::declared(ToolDefinition::untyped(name.trim(), description.trim())));
    }
    for handler in handlers {
        spec = spec.handler(handler);
    }
    Ok(spec)
}
