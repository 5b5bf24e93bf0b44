//! Halldyll Stacks CLI entrypoint.
//!
//! This is the main entrypoint for the halldyll-stacks command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use halldyll_stacks::cli::{Cli, Commands, OutputFormatter, StateCommands};
use halldyll_stacks::config::{
    find_config_file, ConfigParser, ConfigValidator, StackDocument, StateBackend,
};
use halldyll_stacks::engine::{ApplyOptions, Engine};
use halldyll_stacks::error::{DeclarationError, Result, StackError};
use halldyll_stacks::graph::DependencyGraph;
use halldyll_stacks::model::Stack;
use halldyll_stacks::planner::{AbortSignal, Plan};
use halldyll_stacks::provider;
use halldyll_stacks::state::{LocalStateStore, S3StateStore, StateStore, STATE_DIR};

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code of `plan` when changes are pending.
const EXIT_CHANGES_PENDING: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// Logs go to stderr so that stdout carries only command output.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph { target } => cmd_graph(config, target.as_deref(), &formatter),
        Commands::Plan { target, detailed } => {
            cmd_plan(config, target.as_deref(), detailed, &formatter).await
        }
        Commands::Apply {
            target,
            yes,
            parallelism,
        } => cmd_apply(config, target, yes, parallelism, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new stack directory.
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("halldyll.stack.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Declaration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::FAILURE);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/halldyll.stack.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let ignored = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ignored.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Halldyll")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{ignored}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Edit halldyll.stack.yaml with your resources");
    eprintln!("  2. Run 'halldyll-stacks validate' to check the declarations");
    eprintln!("  3. Run 'halldyll-stacks plan' to see what would change");
    eprintln!("  4. Run 'halldyll-stacks apply' to apply it");

    Ok(ExitCode::SUCCESS)
}

/// Validate declarations and the graph.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config_file, doc) = read_document(config_path)?;
    info!("Validating declarations: {}", config_file.display());

    let result = ConfigValidator::new().check(&doc);
    if let Some(first) = result.errors.first() {
        for e in &result.errors {
            eprintln!("  - {e}");
        }
        return Err(StackError::Declaration(DeclarationError::validation(
            first.message.clone(),
            first.field.clone(),
        )));
    }

    let (_, graph) = build_graph(&doc)?;
    emit(&formatter.format_validation(&doc.stack_id(), &result, show_warnings, graph.waves().len()))?;
    Ok(ExitCode::SUCCESS)
}

/// Print dependency waves.
fn cmd_graph(
    config_path: Option<&PathBuf>,
    target: Option<&str>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (_, doc) = load_document(config_path)?;
    let (stack, graph) = build_graph(&doc)?;

    let waves = match target {
        Some(id) => graph.scope_to_target(id)?,
        None => graph.waves().to_vec(),
    };

    emit(&formatter.format_waves(stack.id(), &waves))?;
    Ok(ExitCode::SUCCESS)
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    target: Option<&str>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let engine = create_engine(config_path).await?;
    let plan = engine.plan(target).await?;

    emit(&formatter.format_plan(&plan, detailed))?;

    if plan.has_changes() {
        Ok(ExitCode::from(EXIT_CHANGES_PENDING))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Plan, confirm and apply.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    target: Option<String>,
    auto_approve: bool,
    parallelism: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let engine = create_engine(config_path).await?;
    let abort = AbortSignal::new();

    let options = ApplyOptions {
        target,
        parallelism,
        holder: None,
        abort: abort.clone(),
    };

    let outcome = engine
        .apply(&options, |plan| {
            if let Err(e) = emit(&formatter.format_plan(plan, false)) {
                warn!("Failed to print plan: {e}");
            }
            let confirmed = auto_approve || confirm(plan);
            if confirmed {
                watch_interrupt(abort);
            }
            confirmed
        })
        .await?;

    let Some(report) = outcome.report else {
        if !outcome.plan.has_changes() {
            emit(&formatter.format_plan(&outcome.plan, false))?;
        } else {
            eprintln!("Apply cancelled.");
        }
        return Ok(ExitCode::SUCCESS);
    };

    emit(&formatter.format_report(&report))?;

    if report.success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config_file, doc) = load_document(config_path)?;
    let stack_id = doc.stack_id();

    match command {
        StateCommands::Show => {
            let store = create_store(&doc, &config_file).await?;
            if let Some(state) = store.load_state(&stack_id).await? {
                emit(&formatter.format_state(&state))?;
            } else {
                eprintln!("No state found for {stack_id}.");
            }
            if let Some(lock) = store.lock_info(&stack_id).await?
                && !lock.is_expired()
            {
                eprintln!(
                    "Locked by {} since {} (lock id {}, expires in {}s)",
                    lock.holder,
                    lock.acquired_at.to_rfc3339(),
                    lock.lock_id,
                    lock.remaining_secs()
                );
            }
        }
        StateCommands::List => {
            let store = create_store(&doc, &config_file).await?;
            emit(&formatter.format_stacks(&store.list_stacks().await?))?;
        }
        StateCommands::Rm { id } => {
            let engine = engine_for(doc, &config_file).await?;
            if engine.forget(&id).await?.is_some() {
                emit(&formatter.message(&format!("Removed {id} from state of {stack_id}")))?;
            } else {
                eprintln!("No record for {id} in {stack_id}.");
                return Ok(ExitCode::FAILURE);
            }
        }
        StateCommands::Lock { holder } => {
            let store = create_store(&doc, &config_file).await?;
            let lock = store
                .acquire_lock(&stack_id, holder.as_deref().unwrap_or(""))
                .await?;
            emit(&formatter.message(&format!(
                "State locked: {} (held by {}, expires in {}s)",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            )))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            let engine = engine_for(doc, &config_file).await?;
            engine.unlock(lock_id.as_deref(), force).await?;
            emit(&formatter.message("State unlocked"))?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

/// Asks for confirmation on stderr.
fn confirm(plan: &Plan) -> bool {
    eprint!(
        "Do you want to apply these {} changes to {}? [y/N]: ",
        plan.summary().changes(),
        plan.stack
    );
    if std::io::stderr().flush().is_err() {
        return false;
    }

    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    input.trim().eq_ignore_ascii_case("y") || input.trim().eq_ignore_ascii_case("yes")
}

/// Stops dispatch of new items on the first Ctrl-C; exits on the second.
fn watch_interrupt(abort: AbortSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received; waiting for in-flight items (press Ctrl-C again to exit)");
        abort.abort();

        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Second interrupt; exiting without waiting");
            std::process::exit(130);
        }
    });
}

/// Resolves the declaration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Reads the declaration file with `.env` and environment overrides.
fn read_document(config_path: Option<&PathBuf>) -> Result<(PathBuf, StackDocument)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading declarations from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let doc = parser.load_with_env(&config_file)?;

    Ok((config_file, doc))
}

/// Reads and validates the declaration file.
fn load_document(config_path: Option<&PathBuf>) -> Result<(PathBuf, StackDocument)> {
    let (config_file, doc) = read_document(config_path)?;
    let result = ConfigValidator::new().validate(&doc)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    Ok((config_file, doc))
}

/// Materializes the stack and its graph.
fn build_graph(doc: &StackDocument) -> Result<(Stack, DependencyGraph)> {
    let stack = Stack::build(&doc.settings(), &doc.resources)?;
    let graph = DependencyGraph::build_with_patches(&stack, &doc.wiring)?;
    Ok((stack, graph))
}

/// Loads the document and creates an engine.
async fn create_engine(config_path: Option<&PathBuf>) -> Result<Engine> {
    let (config_file, doc) = load_document(config_path)?;
    engine_for(doc, &config_file).await
}

/// Creates an engine for a loaded document.
async fn engine_for(doc: StackDocument, config_file: &Path) -> Result<Engine> {
    let store = create_store(&doc, config_file).await?;
    let provider = provider::from_config(&doc.provider)?;
    Engine::new(doc, store, provider)
}

/// Creates the state store selected by the document.
async fn create_store(doc: &StackDocument, config_file: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match doc.state.backend {
        StateBackend::Local => {
            let base = base_dir(config_file);
            let path = doc
                .state
                .path
                .as_ref()
                .map_or_else(|| base.join(STATE_DIR), |p| base.join(p));
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = doc.state.bucket.as_deref().ok_or_else(|| {
                StackError::Declaration(DeclarationError::validation(
                    "S3 bucket not configured",
                    "state.bucket",
                ))
            })?;
            Arc::new(
                S3StateStore::new(bucket, doc.state.prefix.as_deref(), doc.state.region.as_deref())
                    .await?,
            )
        }
    };
    Ok(store)
}

/// Directory containing the declaration file.
fn base_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}
