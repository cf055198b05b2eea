use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use stoneforge::dispatch::{DispatchOptions, Dispatcher};
use stoneforge::runner::{CommandOutcome, OutputFormat};
use stoneforge::session::{ProcessLauncher, SessionManager, StartOptions};
use stoneforge::steward::{
    BuiltinExecutor, GitMergeBackend, MergeStewardService, StewardScheduler,
};
use stoneforge::workspace::Workspace;
use stoneforge::{runner, telemetry};

use stoneforge_core::graph::{self, ReadyFilter};
use stoneforge_core::model::ElementId;
use stoneforge_core::store::Store;
use stoneforge_core::sync::Syncer;

/// Stoneforge — coordinate autonomous coding agents on a shared task graph
///
/// Stoneforge keeps a dirty-tracked element store, computes which tasks are
/// ready to run, dispatches them to agent sessions under pool and
/// rate-limit constraints, and runs stewards that reconcile merge readiness
/// and documentation drift.
///
/// QUICK START:
///
///   sf init
///   #   edit .stoneforge/config.yaml and set your actor id
///
///   sf task ready            # what could run right now
///   sf dispatch el-t1 el-ag1 # hand a task to an agent
///   sf steward watch         # drive cron/event stewards
///
///   sf sync export           # write sync/*.jsonl for your peers
///   sf sync import           # merge a peer's files back in
#[derive(Parser)]
#[command(name = "sf", version, about, verbatim_doc_comment)]
struct Cli {
    /// Emit machine-parseable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit ids only
    #[arg(long, global = true, conflicts_with = "json")]
    quiet: bool,

    /// Run as if started in this directory
    #[arg(short = 'C', long, global = true, value_name = "DIR")]
    directory: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a Stoneforge workspace in the current directory
    Init,

    /// Summarize the workspace: element counts, dirty set, conflicts
    Status,

    /// Export/import the JSONL sync files
    #[command(subcommand)]
    Sync(SyncCommands),

    /// Query the task graph
    #[command(subcommand)]
    Task(TaskCommands),

    /// Dispatch a task to an agent
    Dispatch(DispatchArgs),

    /// Run and inspect stewards
    #[command(subcommand)]
    Steward(StewardCommands),
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Write elements.jsonl and dependencies.jsonl, clearing the dirty set
    Export,
    /// Merge a peer's sync files into the local store
    Import,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Tasks that are open, unblocked, and not deferred
    Ready {
        /// Maximum rows
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Open tasks that are blocked or deferred
    Backlog {
        /// Maximum rows
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Close a task and fire event-triggered stewards
    Close {
        /// Task element id
        task: String,
    },
}

#[derive(Args)]
struct DispatchArgs {
    /// Task element id
    task: String,
    /// Agent element id
    agent: String,
    /// Priority recorded on the notification
    #[arg(long)]
    priority: Option<i64>,
    /// Mark the task started immediately
    #[arg(long)]
    start: bool,
}

#[derive(Subcommand)]
enum StewardCommands {
    /// Execute one steward now
    Run {
        /// Steward agent element id
        agent: String,
    },
    /// Show recent steward executions
    History {
        /// Maximum rows
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Drive cron and event triggers until interrupted
    Watch,
}

#[tokio::main]
async fn main() {
    telemetry::init();
    let cli = Cli::parse();
    let format = OutputFormat::resolve(cli.json, cli.quiet);

    let (outcome, quiet_ids) = match run(&cli).await {
        Ok(pair) => pair,
        Err(e) => (CommandOutcome::failure(&e), Vec::new()),
    };
    std::process::exit(outcome.render(format, &quiet_ids));
}

async fn run(cli: &Cli) -> Result<(CommandOutcome, Vec<String>)> {
    let cwd = match &cli.directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };

    match &cli.command {
        Commands::Init => {
            let ws = Workspace::init(&cwd)?;
            Ok((
                CommandOutcome::success(
                    &serde_json::json!({"root": ws.root()}),
                    format!("Initialized workspace at {}", ws.root().display()),
                ),
                vec![],
            ))
        }
        Commands::Status => status(&cwd),
        Commands::Sync(cmd) => sync(&cwd, cmd),
        Commands::Task(cmd) => task(&cwd, cmd).await,
        Commands::Dispatch(args) => dispatch(&cwd, args),
        Commands::Steward(cmd) => steward(&cwd, cmd).await,
    }
}

fn open_store(ws: &Workspace) -> Result<Store> {
    Store::open(&ws.db_path()).context("opening element store")
}

fn parse_id(raw: &str) -> Result<ElementId> {
    Ok(ElementId::new(raw)?)
}

fn status(cwd: &std::path::Path) -> Result<(CommandOutcome, Vec<String>)> {
    let ws = Workspace::discover(cwd)?;
    let store = open_store(&ws)?;

    let elements = store.list(&stoneforge_core::store::ElementFilter {
        include_deleted: true,
        ..Default::default()
    })?;
    let live = elements.iter().filter(|e| !e.is_deleted()).count();
    let tombstones = elements.len() - live;
    let dirty = store.dirty_elements()?;
    let syncer = Syncer::new(&store, ws.sync_paths(), tombstone_ttl());
    let conflicts = syncer.recent_conflicts(5)?;

    let data = serde_json::json!({
        "root": ws.root(),
        "elements": live,
        "tombstones": tombstones,
        "dirty": dirty.len(),
        "recentConflicts": conflicts,
    });
    let message = format!(
        "{live} element(s), {tombstones} tombstone(s), {} dirty, {} recent conflict(s)",
        dirty.len(),
        conflicts.len()
    );
    let ids = dirty.iter().map(ToString::to_string).collect();
    Ok((CommandOutcome::success(&data, message), ids))
}

fn tombstone_ttl() -> chrono::Duration {
    chrono::Duration::days(stoneforge_core::store::DEFAULT_TOMBSTONE_TTL_DAYS)
}

fn sync(cwd: &std::path::Path, cmd: &SyncCommands) -> Result<(CommandOutcome, Vec<String>)> {
    let ws = Workspace::discover(cwd)?;
    let store = open_store(&ws)?;
    let syncer = Syncer::new(&store, ws.sync_paths(), tombstone_ttl());

    match cmd {
        SyncCommands::Export => {
            let report = syncer.export()?;
            Ok((
                CommandOutcome::success(
                    &serde_json::json!({
                        "elements": report.elements,
                        "dependencies": report.dependencies,
                        "clearedDirty": report.cleared_dirty,
                    }),
                    format!(
                        "Exported {} element(s) and {} dependenc(ies)",
                        report.elements, report.dependencies
                    ),
                ),
                vec![],
            ))
        }
        SyncCommands::Import => {
            let report = syncer.import()?;
            Ok((
                CommandOutcome::success(
                    &serde_json::json!({
                        "elementsSeen": report.elements_seen,
                        "elementsWritten": report.elements_written,
                        "conflicts": report.conflicts,
                        "dependenciesAdded": report.dependencies_added,
                        "dependenciesRemoved": report.dependencies_removed,
                        "skippedLines": report.skipped_lines,
                    }),
                    format!(
                        "Imported {} record(s), {} conflict(s) journaled",
                        report.elements_seen, report.conflicts
                    ),
                ),
                vec![],
            ))
        }
    }
}

async fn task(cwd: &std::path::Path, cmd: &TaskCommands) -> Result<(CommandOutcome, Vec<String>)> {
    let ws = Workspace::discover(cwd)?;
    let store = open_store(&ws)?;

    let (tasks, label) = match cmd {
        TaskCommands::Ready { limit } => (
            graph::ready_tasks(&store, *limit, &ReadyFilter::default())?,
            "ready",
        ),
        TaskCommands::Backlog { limit } => (graph::backlog_tasks(&store, *limit)?, "backlog"),
        TaskCommands::Close { task } => return close_task(&ws, store, task).await,
    };

    let ids: Vec<String> = tasks.iter().map(|t| t.id.to_string()).collect();
    let rows: Vec<serde_json::Value> = tasks
        .iter()
        .map(|t| {
            serde_json::json!({
                "id": t.id,
                "title": t.metadata.get("title"),
                "priority": t.priority(),
                "complexity": t.complexity(),
            })
        })
        .collect();

    let mut message = format!("{} {label} task(s)", tasks.len());
    for task in &tasks {
        let title = task
            .metadata
            .get("title")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("(untitled)");
        message.push_str(&format!("\n  {}  p{}  {title}", task.id, task.priority()));
    }
    let mut data = serde_json::Map::new();
    data.insert(label.to_owned(), serde_json::Value::Array(rows));
    Ok((CommandOutcome::success(&data, message), ids))
}

async fn close_task(
    ws: &Workspace,
    store: Store,
    raw_id: &str,
) -> Result<(CommandOutcome, Vec<String>)> {
    let actor = ws.actor()?.to_owned();
    let task_id = parse_id(raw_id)?;

    let task = store.require(&task_id)?;
    let mut metadata = task.metadata.clone();
    metadata.insert("status".to_owned(), "closed".into());
    store.update(
        &task_id,
        &stoneforge_core::store::ElementPatch::metadata(metadata),
        &actor,
    )?;

    // Closing a task is the canonical trigger for merge stewards.
    let store = Arc::new(store);
    let scheduler = build_scheduler(ws, Arc::clone(&store), &actor);
    let fired = scheduler.handle_event("task.closed").await;

    if ws.config().sync.auto_export {
        let syncer = Syncer::new(&store, ws.sync_paths(), tombstone_ttl());
        syncer.export().context("auto-exporting after close")?;
    }

    let data = serde_json::json!({
        "task": task_id,
        "stewardsFired": fired.len(),
    });
    let message = format!("Closed {task_id}; {} steward(s) fired", fired.len());
    Ok((CommandOutcome::success(&data, message), vec![task_id.to_string()]))
}

fn dispatch(cwd: &std::path::Path, args: &DispatchArgs) -> Result<(CommandOutcome, Vec<String>)> {
    let ws = Workspace::discover(cwd)?;
    let store = open_store(&ws)?;
    let actor = ws.actor()?.to_owned();
    let task_id = parse_id(&args.task)?;
    let agent_id = parse_id(&args.agent)?;

    let dispatcher = Dispatcher::new(&store, &actor);
    let result = dispatcher.dispatch(
        &task_id,
        &agent_id,
        &DispatchOptions {
            priority: args.priority,
            assign: stoneforge::dispatch::AssignOptions {
                mark_as_started: args.start,
                ..Default::default()
            },
        },
    )?;

    if ws.config().sync.auto_export {
        let syncer = Syncer::new(&store, ws.sync_paths(), tombstone_ttl());
        syncer.export().context("auto-exporting after dispatch")?;
    }

    let data = serde_json::json!({
        "task": result.task.id,
        "agent": result.agent.id,
        "channel": result.channel.id,
        "notification": result.notification.id,
        "isNewAssignment": result.is_new_assignment,
        "dispatchedAt": result.dispatched_at,
    });
    let message = format!(
        "Dispatched {} to {} (notification {} in {})",
        result.task.id, result.agent.id, result.notification.id, result.channel.id
    );
    let ids = vec![result.notification.id.to_string()];
    Ok((CommandOutcome::success(&data, message), ids))
}

async fn steward(
    cwd: &std::path::Path,
    cmd: &StewardCommands,
) -> Result<(CommandOutcome, Vec<String>)> {
    let ws = Workspace::discover(cwd)?;
    let store = Arc::new(open_store(&ws)?);
    let actor = ws.actor()?.to_owned();
    let scheduler = build_scheduler(&ws, Arc::clone(&store), &actor);

    match cmd {
        StewardCommands::Run { agent } => {
            let agent_id = parse_id(agent)?;
            let record = scheduler.execute_steward(&agent_id, "manual").await;
            let message = if record.success {
                format!(
                    "Steward {} succeeded in {}ms: {}",
                    record.steward_id,
                    record.duration_ms,
                    record.output.as_deref().unwrap_or("")
                )
            } else {
                format!(
                    "Steward {} failed: {}",
                    record.steward_id,
                    record
                        .error
                        .as_deref()
                        .or(record.output.as_deref())
                        .unwrap_or("unknown error")
                )
            };
            let exit = if record.success {
                runner::EXIT_SUCCESS
            } else {
                runner::EXIT_GENERAL
            };
            let mut outcome = CommandOutcome::success(&record, message);
            outcome.exit_code = exit;
            Ok((outcome, vec![record.steward_id.to_string()]))
        }
        StewardCommands::History { limit } => {
            let history = scheduler.history(*limit).await;
            let mut message = format!("{} execution(s)", history.len());
            for record in &history {
                message.push_str(&format!(
                    "\n  {}  {}  {}ms  {}",
                    record.started_at.format("%Y-%m-%d %H:%M:%S"),
                    record.steward_id,
                    record.duration_ms,
                    if record.success { "ok" } else { "failed" }
                ));
            }
            let ids = history.iter().map(|r| r.steward_id.to_string()).collect();
            Ok((CommandOutcome::success(&history, message), ids))
        }
        StewardCommands::Watch => {
            eprintln!("Watching steward triggers (ctrl-c to stop)…");
            scheduler
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
            Ok((
                CommandOutcome::success(&serde_json::json!({}), "Steward watch stopped"),
                vec![],
            ))
        }
    }
}

fn build_scheduler(ws: &Workspace, store: Arc<Store>, actor: &str) -> StewardScheduler {
    let config = ws.config();
    let launcher = Arc::new(ProcessLauncher::new());
    let sessions = Arc::new(SessionManager::new(Arc::clone(&store), launcher, actor));
    let backend = Arc::new(GitMergeBackend::new(ws.root().to_path_buf(), None));
    let merge = Arc::new(MergeStewardService::new(Arc::clone(&store), backend, actor));
    let executable = config
        .session
        .executable_chain
        .first()
        .cloned()
        .unwrap_or_else(|| "claude".to_owned());
    let executor = Arc::new(BuiltinExecutor::new(
        merge,
        sessions,
        StartOptions {
            executable,
            working_directory: ws.root().to_path_buf(),
            prompt: Some("Review the workspace documentation for drift.".to_owned()),
            extra_args: config.session.extra_args.clone(),
        },
    ));
    StewardScheduler::new(store, executor)
}
