//! Novelflow CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow, replaying prepared responses
//! novelflow volume-one.yaml --responses responses.yaml
//!
//! # Start from a later position
//! novelflow volume-one.yaml --responses responses.yaml --start 3
//!
//! # Continue from the saved snapshot
//! novelflow volume-one.yaml --responses responses.yaml --resume
//!
//! # Preview the execution order
//! novelflow volume-one.yaml --dry-run
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};

use novelflow::config::EngineConfig;
use novelflow::execution::{Engine, RunOutcome};
use novelflow::ports::{
    FileSync, GenerationPort, InMemoryNovel, NovelPort, ScriptedGenerator, SyncPort,
};
use novelflow::workflow::parser::load_workflow;
use novelflow::workflow::state::WorkflowSnapshot;
use novelflow::workflow::validator::quick_validate;
use novelflow::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: String,
    start: usize,
    resume: bool,
    responses_path: Option<String>,
    config_path: Option<String>,
    state_dir: Option<PathBuf>,
    dry_run: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Novel Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: novelflow [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>       Path to workflow YAML or JSON file");
    println!();
    println!("Options:");
    println!("  --start N             Start from execution position N (default: 0)");
    println!("  --resume              Continue from the saved snapshot");
    println!("  --responses FILE      YAML list of replies to replay as generation output");
    println!("  --config FILE         Engine configuration YAML");
    println!("  --state-dir DIR       Directory for workflow snapshots");
    println!("  --dry-run             Print the execution order without running");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  novelflow volume-one.yaml --responses responses.yaml");
    println!("  novelflow volume-one.yaml --dry-run");
    println!("  novelflow volume-one.yaml --responses responses.yaml --resume");
}

/// Returns the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", name))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config {
        workflow_path: DEFAULT_WORKFLOW.to_string(),
        ..Config::default()
    };
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                config.dry_run = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--resume" => {
                config.resume = true;
            }
            "--start" => {
                let value = option_value(args, &mut i, "--start")?;
                config.start = value
                    .parse()
                    .map_err(|_| format!("Invalid start position: {}", value))?;
            }
            "--responses" => {
                config.responses_path = Some(option_value(args, &mut i, "--responses")?.to_string());
            }
            "--config" => {
                config.config_path = Some(option_value(args, &mut i, "--config")?.to_string());
            }
            "--state-dir" => {
                config.state_dir = Some(PathBuf::from(option_value(args, &mut i, "--state-dir")?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    if config.resume && config.start > 0 {
        return Err("--resume and --start cannot be combined".to_string());
    }

    Ok(config)
}

/// Loads engine settings, applying command-line overrides.
fn load_engine_config(config: &Config) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &config.state_dir {
        engine_config.state_dir = dir.clone();
    }
    Ok(engine_config)
}

/// Prints the execution order and validation warnings.
fn print_plan(engine: &Engine) {
    println!("Execution order:");
    for (position, id) in engine.order().iter().enumerate() {
        let Some(node) = engine.graph().node(id) else {
            continue;
        };
        let marker = if node.skipped { " (skipped)" } else { "" };
        println!(
            "  {:>3}. {} [{}]{}",
            position,
            node.display_name(),
            node.kind.type_key(),
            marker.dimmed()
        );
    }

    for warning in quick_validate(engine.graph()) {
        println!("{} {}", "warning:".yellow(), warning);
    }
}

/// Main application entry point.
async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let engine_config = load_engine_config(&config)?;

    // Load workflow
    info!("Loading workflow: {}", config.workflow_path);
    let document = load_workflow(&config.workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path, e
        )
    })?;

    info!(
        "Workflow '{}' loaded: {} nodes, {} edges",
        document.id,
        document.nodes.len(),
        document.edges.len()
    );

    let generator = match &config.responses_path {
        Some(path) => ScriptedGenerator::from_yaml_file(path)
            .map_err(|e| format!("Could not load responses from '{}': {}", path, e))?,
        None => {
            warn!("No responses file given; generation nodes cannot run");
            ScriptedGenerator::new()
        }
    };
    let novel = Arc::new(InMemoryNovel::new());
    let state_dir = engine_config.state_dir.clone();

    let mut engine = Engine::from_document(
        document,
        Arc::new(generator) as Arc<dyn GenerationPort>,
        Arc::clone(&novel) as Arc<dyn NovelPort>,
    );
    let sync = Arc::new(FileSync::new(&state_dir));
    engine.set_sync(Arc::clone(&sync) as Arc<dyn SyncPort>);
    engine.set_config(engine_config);

    if config.dry_run {
        print_plan(&engine);
        return Ok(());
    }

    // Ctrl+C pauses at the current node; the snapshot allows --resume
    let run_state = engine.run_state();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; pausing");
            run_state.request_pause();
        }
    });

    let result = if config.resume {
        let snapshot = WorkflowSnapshot::load(&state_dir, engine.workflow_id())?;
        engine.restore(snapshot)?;
        engine.resume().await
    } else {
        engine.run(config.start).await
    };
    sync.flush().await;

    println!("{}", engine.timeline().gantt_chart());

    let summary = novel.summary();
    if !summary.is_empty() {
        println!("Novel:");
        print!("{}", summary);
        println!();
    }

    match result? {
        RunOutcome::Completed => println!("{}", "Workflow completed".green().bold()),
        RunOutcome::GraphReplaced => {
            println!("{}", "Workflow replaced by the generated graph".green().bold())
        }
        outcome @ RunOutcome::Paused { .. } => {
            println!("{}", format!("Workflow {}", outcome).yellow().bold());
            println!("Continue with --resume");
        }
        outcome => println!("{}", format!("Workflow {}", outcome).yellow().bold()),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
