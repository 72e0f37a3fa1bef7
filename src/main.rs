//! Cairn CLI entrypoint.
//!
//! This is the main entrypoint for the cairn command-line tool. Results go
//! to stdout, progress and prompts to stderr.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use cairn::cli::{Cli, Commands, LogFormat, OutputFormat, OutputFormatter, StateCommands};
use cairn::config::{
    ConfigParser, ConfigValidator, InfraConfig, VariableResolver, VariableValues, find_config_file,
};
use cairn::error::{CairnError, ConfigError, ReconcileError, Result};
use cairn::graph::GraphBuilder;
use cairn::provider::{ProviderRegistry, SandboxRemote};
use cairn::reconciler::Reconciler;
use cairn::resource::ResourceId;
use cairn::state::{STATE_DIR, StateManager, create_store, generate_holder_id};

use clap::Parser;
use colored::Colorize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code of `plan --detailed-exitcode` when changes are pending.
const EXIT_CHANGES_PENDING: u8 = 2;

/// Exit code after a second Ctrl-C, as a shell reports SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

/// File the sandbox provider persists its objects to, under the state dir.
const REMOTE_FILE: &str = "remote.json";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

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
            eprintln!("{} {e}", "Error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `--verbose` forces debug output for the crate; otherwise `RUST_LOG`
/// applies, defaulting to info.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("warn,cairn=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,cairn=info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();
    let vars = cli.vars.as_slice();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, vars, warnings, &formatter),
        Commands::Plan {
            detailed_exitcode,
            destroy,
            no_refresh,
        } => {
            let ws = Workspace::open(config, vars).await?;
            cmd_plan(&ws, detailed_exitcode, destroy, no_refresh, &formatter).await
        }
        Commands::Apply { yes, no_refresh } => {
            let ws = Workspace::open(config, vars).await?;
            cmd_apply(&ws, yes, no_refresh, &formatter).await
        }
        Commands::Destroy { yes } => {
            let ws = Workspace::open(config, vars).await?;
            cmd_destroy(&ws, yes, &formatter).await
        }
        Commands::Drift => {
            let ws = Workspace::open(config, vars).await?;
            let report = ws.reconciler().check_drift().await;
            emit(&formatter.format_drift(&report))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Refresh => {
            let ws = Workspace::open(config, vars).await?;
            let report = ws.reconciler().refresh().await?;
            emit(&formatter.format_drift(&report))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Output { name } => {
            let ws = Workspace::open(config, vars).await?;
            cmd_output(&ws, name.as_deref(), &formatter).await
        }
        Commands::Graph => {
            let ws = Workspace::open(config, vars).await?;
            let graph = ws.reconciler().build_graph()?;
            emit(&graph.to_dot())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::State { command } => {
            let ws = Workspace::open(config, vars).await?;
            cmd_state(&ws, command, &formatter).await
        }
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    info!("Initializing new Cairn project in: {}", path.display());

    let config_path = path.join("cairn.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::FAILURE);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/cairn.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Cairn")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit cairn.yaml to declare your resources");
    eprintln!("  2. Run 'cairn validate' to check the document");
    eprintln!("  3. Run 'cairn plan' to see what will change");
    eprintln!("  4. Run 'cairn apply' to converge");

    Ok(ExitCode::SUCCESS)
}

/// Validate the document and build its graph.
fn cmd_validate(
    config_path: Option<&Path>,
    vars: &[String],
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir_of(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    let variables = resolve_variables(&config, vars)?;
    let graph = GraphBuilder::new(&variables).build(&config)?;

    emit(&formatter.format_validation(&config, &result, &graph, show_warnings))?;
    Ok(ExitCode::SUCCESS)
}

/// Show the changes an apply or destroy would make.
async fn cmd_plan(
    ws: &Workspace,
    detailed_exitcode: bool,
    destroy: bool,
    no_refresh: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let reconciler = ws.reconciler().with_refresh(!no_refresh);
    let plan = if destroy {
        reconciler.plan_destroy().await?
    } else {
        reconciler.plan().await?
    };

    emit(&formatter.format_plan(&plan))?;

    if detailed_exitcode && plan.has_changes() {
        Ok(ExitCode::from(EXIT_CHANGES_PENDING))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Plan and apply.
async fn cmd_apply(
    ws: &Workspace,
    auto_approve: bool,
    no_refresh: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let reconciler = ws.reconciler().with_refresh(!no_refresh);

    let confirmed = if auto_approve {
        None
    } else {
        let plan = reconciler.plan().await?;
        if !plan.has_changes() {
            emit(&formatter.format_plan(&plan))?;
            return Ok(ExitCode::SUCCESS);
        }

        eprintln!("{}", OutputFormatter::new(OutputFormat::Text).format_plan(&plan));
        if !confirm("Do you want to apply this plan? [y/N]: ", |s| s.eq_ignore_ascii_case("y"))? {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
        Some(plan)
    };

    let reconciler = reconciler.with_cancellation(interrupt_signal());
    let result = match &confirmed {
        Some(plan) => reconciler.apply_confirmed(plan).await?,
        None => reconciler.apply().await?,
    };
    emit(&formatter.format_result(&result))?;

    Ok(exit_for(result.is_success()))
}

/// Destroy every tracked resource.
async fn cmd_destroy(ws: &Workspace, auto_approve: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let reconciler = ws.reconciler();

    let plan = reconciler.plan_destroy().await?;
    if !plan.has_changes() {
        eprintln!("Nothing to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    if !auto_approve {
        eprintln!("{}", OutputFormatter::new(OutputFormat::Text).format_plan(&plan));
        if !confirm("This action is IRREVERSIBLE. Type 'destroy' to confirm: ", |s| s == "destroy")? {
            eprintln!("Destruction cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let result = reconciler
        .with_cancellation(interrupt_signal())
        .destroy_confirmed(&plan)
        .await?;
    emit(&formatter.format_result(&result))?;

    Ok(exit_for(result.is_success()))
}

/// Show output values.
async fn cmd_output(ws: &Workspace, name: Option<&str>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let outputs = ws.reconciler().outputs().await?;

    match name {
        Some(name) => {
            let value = outputs.get(name).ok_or_else(|| ReconcileError::OutputUnavailable {
                name: name.to_string(),
                reason: String::from("no such output is declared"),
            })?;
            emit(&formatter.format_value(value))?;
        }
        None => emit(&formatter.format_outputs(&outputs))?,
    }

    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(ws: &Workspace, command: StateCommands, formatter: &OutputFormatter) -> Result<ExitCode> {
    let store = ws.state.store();

    match command {
        StateCommands::Show => {
            if store.exists().await? {
                emit(&formatter.format_state(&ws.state.snapshot().await))?;
            } else {
                eprintln!("No state found at {}.", store.location());
            }
        }
        StateCommands::List => {
            emit(&formatter.format_state_list(&ws.state.snapshot().await))?;
        }
        StateCommands::Rm { id } => {
            let id = ResourceId::parse(&id).map_err(ConfigError::validation_general)?;
            ws.reconciler().forget(&id).await?;
            eprintln!("{} Removed {id} from state; the remote instance was left in place.", "✓".green());
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual lock").await?;
            eprintln!("State locked by {} until {}", lock.holder, lock.expires_at);
            emit(&lock.lock_id)?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info().await? {
                    warn!("Force-unlocking state held by {}", lock.holder);
                }
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a command needs once the document is loaded.
struct Workspace {
    config: InfraConfig,
    variables: VariableValues,
    registry: ProviderRegistry,
    state: Arc<StateManager>,
}

impl Workspace {
    /// Loads the document and opens its state and providers.
    async fn open(config_path: Option<&Path>, vars: &[String]) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading configuration from: {}", config_file.display());

        let base_dir = base_dir_of(&config_file);
        let parser = ConfigParser::new().with_base_path(&base_dir);
        parser.load_dotenv()?;

        let config = parser.load_with_env(&config_file)?;
        let validation = ConfigValidator::new().validate(&config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }
        let variables = resolve_variables(&config, vars)?;

        let store = create_store(&config.state, &base_dir).await?;
        let state = StateManager::open(store, &config.project.name, &config.project.environment).await?;

        let remote_path = config.provider.remote_path.as_ref().map_or_else(
            || base_dir.join(STATE_DIR).join(REMOTE_FILE),
            |path| base_dir.join(path),
        );
        let remote = SandboxRemote::open(&remote_path).await?;

        Ok(Self {
            registry: ProviderRegistry::sandbox(&remote),
            config,
            variables,
            state: Arc::new(state),
        })
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.config, &self.variables, &self.registry, Arc::clone(&self.state))
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Directory relative paths in the document are resolved against.
fn base_dir_of(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn resolve_variables(config: &InfraConfig, vars: &[String]) -> Result<VariableValues> {
    VariableResolver::new()
        .with_assignments(vars)?
        .resolve(&config.variables)
}

/// Returns a receiver that flips to `true` on Ctrl-C. A second Ctrl-C
/// exits immediately without waiting for in-flight operations.
fn interrupt_signal() -> watch::Receiver<bool> {
    watch_interrupts(
        || async { tokio::signal::ctrl_c().await.is_ok() },
        || {
            warn!("Interrupted again; exiting, state may lag behind the remote side");
            std::process::exit(EXIT_INTERRUPTED)
        },
    )
}

/// Cancels on the first signal and calls `force_exit` on the second.
/// `next_signal` resolves to false when signals cannot be received.
fn watch_interrupts<S, F>(
    mut next_signal: S,
    force_exit: impl FnOnce() + Send + 'static,
) -> watch::Receiver<bool>
where
    S: FnMut() -> F + Send + 'static,
    F: Future<Output = bool> + Send,
{
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if !next_signal().await {
            return;
        }
        warn!("Interrupted; waiting for in-flight operations to finish (Ctrl-C again to exit now)");
        let _ = tx.send(true);

        if next_signal().await {
            force_exit();
        }
    });
    rx
}

/// Prompts on stderr and reads one line from stdin.
fn confirm(prompt: &str, accept: impl Fn(&str) -> bool) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(accept(input.trim()))
}

/// Writes a result to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush().map_err(CairnError::from)
}

fn exit_for(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
