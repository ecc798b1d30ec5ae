//! Binary entry point for the `derive` CLI.
#![forbid(unsafe_code)]

#[path = "cli/ui.rs"]
mod ui;

use std::error::Error;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;

use derivation::config::EngineConfig;
use derivation::engine::{Engine, Resolver, RollbackLog};
use derivation::model::{MethodDocument, Schema};
use derivation::query::{DataRequest, QueryBuilder};
use derivation::scripts::{HttpRemote, ScriptRegistry};
use derivation::store::{GraphStore, Neo4jHttp};
use derivation::{telemetry, Error as EngineError};

use ui::{format_duration, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "derive",
    version,
    about = "Resolve and run metadata-driven graph derivations",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Check and resolve a method document offline")]
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    #[command(about = "Scope a method document to a study and store it")]
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, value_name = "ID", help = "Study id prefixed to method ids")]
        study: String,
    },
    #[command(about = "Run a stored method")]
    Run(RunCmd),
    #[command(about = "Build the query plan of a data request offline")]
    Plan {
        #[arg(value_name = "REQUEST")]
        request: PathBuf,
        #[arg(
            long,
            value_name = "FILE",
            help = "Method document whose classes and relationships form the schema"
        )]
        schema: Option<PathBuf>,
    },
    #[command(about = "Undo the graph writes recorded in a rollback log")]
    Rollback {
        #[arg(value_name = "LOG")]
        log: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunCmd {
    #[arg(value_name = "METHOD_ID")]
    method_id: String,

    #[arg(long, help = "Row limit for every data fetch")]
    limit: Option<i64>,

    #[arg(long, help = "Skip every action that writes to the graph")]
    dry_run: bool,

    #[arg(long, value_name = "FILE", help = "Write the final table as CSV")]
    output: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Write the rollback log as JSON")]
    rollback_log: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Exit status when compensation itself failed.
const EXIT_PARTIAL_ROLLBACK: i32 = 2;

fn main() {
    telemetry::init("warn");
    if let Err(err) = run() {
        eprintln!("error: {err}");
        let partial = err
            .downcast_ref::<EngineError>()
            .is_some_and(|err| matches!(err, EngineError::PartialRollback(_)));
        std::process::exit(if partial { EXIT_PARTIAL_ROLLBACK } else { 1 });
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let ui = Ui::new(cli.format == OutputFormat::Json);
    match cli.command {
        Command::Validate { file } => validate(&ui, cli.format, &file),
        Command::Import { file, study } => {
            let config = EngineConfig::load(cli.config)?;
            import(&ui, cli.format, &config, &file, &study)
        }
        Command::Run(cmd) => {
            let config = EngineConfig::load(cli.config)?;
            run_method(&ui, cli.format, &config, &cmd)
        }
        Command::Plan { request, schema } => plan(&ui, cli.format, &request, schema.as_deref()),
        Command::Rollback { log } => {
            let config = EngineConfig::load(cli.config)?;
            rollback(&ui, cli.format, &config, &log)
        }
    }
}

fn validate(ui: &Ui, format: OutputFormat, file: &Path) -> Result<(), Box<dyn Error>> {
    let doc = MethodDocument::from_path(file)?;
    let schema = Schema::from_document(&doc);
    let registry = ScriptRegistry::with_builtins();
    let resolved = Resolver::new(&schema, &registry, &registry).resolve(&doc)?;
    match format {
        OutputFormat::Json => {
            let steps: Vec<_> = resolved
                .steps
                .iter()
                .map(|step| {
                    json!({
                        "id": step.id,
                        "kind": step.action.kind(),
                        "mutating": step.action.is_mutating(),
                    })
                })
                .collect();
            print_json(&json!({ "root": resolved.root, "steps": steps }))?;
        }
        OutputFormat::Text => {
            ui.section(
                "method",
                [
                    ("root", resolved.root.clone()),
                    ("records", doc.nodes.len().to_string()),
                    ("actions", resolved.steps.len().to_string()),
                    ("mutating", resolved.mutating().to_string()),
                ],
            );
            ui.list(
                "actions",
                resolved
                    .steps
                    .iter()
                    .map(|step| format!("{} ({})", step.id, step.action.kind())),
            );
            ui.success(&format!("{} is valid", file.display()));
        }
    }
    Ok(())
}

fn import(
    ui: &Ui,
    format: OutputFormat,
    config: &EngineConfig,
    file: &Path,
    study: &str,
) -> Result<(), Box<dyn Error>> {
    let doc = MethodDocument::from_path(file)?.scoped_to_study(study)?;
    doc.validate()?;
    let mut store = Neo4jHttp::new(config.neo4j_settings())?;
    let task = ui.task(format!("importing {}", doc.name));
    store.import_method(&doc)?;
    let elapsed = task.finish();
    match format {
        OutputFormat::Json => print_json(&json!({
            "root": doc.name,
            "methods": doc.methods().count(),
            "records": doc.nodes.len(),
            "relationships": doc.relationships.len(),
        }))?,
        OutputFormat::Text => ui.success(&format!(
            "imported {} ({} records, {} relationships) in {}",
            doc.name,
            doc.nodes.len(),
            doc.relationships.len(),
            format_duration(elapsed)
        )),
    }
    Ok(())
}

fn engine(config: &EngineConfig) -> Result<Engine<Neo4jHttp>, Box<dyn Error>> {
    let store = Neo4jHttp::new(config.neo4j_settings())?;
    let mut engine = Engine::new(store)
        .with_retry(config.retry_policy())
        .with_value_property(config.query.value_property.clone())
        .with_naming(config.query.naming);
    if let Some(settings) = config.remote_settings()? {
        engine = engine.with_remote(Box::new(HttpRemote::new(settings)?));
    }
    Ok(engine)
}

fn run_method(
    ui: &Ui,
    format: OutputFormat,
    config: &EngineConfig,
    cmd: &RunCmd,
) -> Result<(), Box<dyn Error>> {
    let mut engine = engine(config)?;
    let mut options = config.run_options();
    if cmd.limit.is_some() {
        options.limit = cmd.limit;
    }
    if cmd.dry_run {
        options.apply_changes = false;
    }
    let task = ui.task(format!("running {}", cmd.method_id));
    let result = engine.run(&cmd.method_id, &options);
    let elapsed = task.finish();
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            if let (Some(failure), OutputFormat::Text) = (err.run_failure(), format) {
                ui.records("actions", &failure.records);
            }
            return Err(err.into());
        }
    };
    if let Some(path) = &cmd.output {
        outcome.table.write_csv(File::create(path)?)?;
    }
    if let Some(path) = &cmd.rollback_log {
        fs::write(path, outcome.rollback_log.to_json_string()?)?;
    }
    match format {
        OutputFormat::Json => print_json(&json!({
            "root": cmd.method_id,
            "columns": outcome.table.columns(),
            "rows": outcome.table.len(),
            "records": outcome.records,
            "writes": outcome.rollback_log.entries.len(),
            "data": outcome.table.to_json_records(),
        }))?,
        OutputFormat::Text => {
            ui.section(
                "run",
                [
                    ("method", cmd.method_id.clone()),
                    ("rows", outcome.table.len().to_string()),
                    ("actions", outcome.records.len().to_string()),
                    ("writes", outcome.rollback_log.entries.len().to_string()),
                    ("elapsed", format_duration(elapsed)),
                ],
            );
            ui.records("actions", &outcome.records);
            if cmd.output.is_none() {
                ui.table("result", &outcome.table, 10);
            }
            if !options.apply_changes {
                ui.warn("dry run: graph writes were skipped");
            }
        }
    }
    Ok(())
}

fn plan(
    ui: &Ui,
    format: OutputFormat,
    request: &Path,
    schema: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let request: DataRequest = serde_json::from_str(&fs::read_to_string(request)?)?;
    let schema = match schema {
        Some(path) => Schema::from_document(&MethodDocument::from_path(path)?),
        None => Schema::new(),
    };
    let plan = QueryBuilder::new(&schema).build(&request)?;
    match format {
        OutputFormat::Json => print_json(&json!({
            "text": plan.text,
            "params": plan.params_json(),
            "columns": plan.column_names(),
            "limit": plan.limit,
            "hash": format!("{:016x}", plan.hash),
        }))?,
        OutputFormat::Text => {
            ui.section(
                "plan",
                [
                    ("columns", plan.columns.len().to_string()),
                    ("params", plan.params.len().to_string()),
                    ("hash", format!("{:016x}", plan.hash)),
                ],
            );
            ui.list("cypher", plan.text.lines().map(str::to_owned));
            ui.list(
                "columns",
                plan.column_names().into_iter().map(str::to_owned),
            );
        }
    }
    Ok(())
}

fn rollback(
    ui: &Ui,
    format: OutputFormat,
    config: &EngineConfig,
    path: &Path,
) -> Result<(), Box<dyn Error>> {
    let log = RollbackLog::from_json_str(&fs::read_to_string(path)?)?;
    let mut engine = engine(config)?;
    let task = ui.task(format!("rolling back {}", log.root));
    let failures = engine.rollback(&log);
    task.finish();
    match format {
        OutputFormat::Json => print_json(&json!({
            "root": log.root,
            "entries": log.entries.len(),
            "failures": failures,
        }))?,
        OutputFormat::Text => {
            ui.list(
                "failed compensations",
                failures
                    .iter()
                    .map(|f| format!("{}: {}", f.action_id, f.error)),
            );
            if failures.is_empty() {
                ui.success(&format!(
                    "rolled back {} action(s) of {}",
                    log.entries.len(),
                    log.root
                ));
            }
        }
    }
    if !failures.is_empty() {
        std::process::exit(EXIT_PARTIAL_ROLLBACK);
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
