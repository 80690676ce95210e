mod config;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use config::CliConfig;
use foreman_core::{Actor, Task, TaskKind, TaskStatus};
use foreman_orchestrator::profiles::COORDINATOR_ID;
use foreman_orchestrator::{CommandExecutor, IssueTools, Orchestrator};
use foreman_queue::{FileQueueStore, QueueStore, TaskFilter, TaskSummary};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "foreman", about = "Foreman: coordinator, workers and observers over one task queue")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "foreman.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator and feed it messages from stdin, one per line
    Run,
    /// Inspect and administer tasks as the coordinator
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Print task counts by status
    Summary,
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tasks, most urgent first
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Create an open task
    Create {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(long)]
        kind: Option<TaskKind>,
        #[arg(short, long)]
        priority: Option<u8>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Answer a waiting task and return it to open
    Unblock { id: Uuid, info: String },
    /// Close a task from any state
    Close {
        id: Uuid,
        #[arg(default_value = "closed by operator")]
        reason: String,
    },
    /// Print one task as JSON
    Show { id: Uuid },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = CliConfig::load(&cli.config).await?;
    let store = Arc::new(
        FileQueueStore::open(&config.data_dir)
            .await
            .with_context(|| format!("failed to open queue at '{}'", config.data_dir.display()))?,
    );

    match cli.command {
        Commands::Run => run(config, store).await?,
        Commands::Tasks { action } => tasks(action, store).await?,
        Commands::Summary => {
            let summary = TaskSummary::of_store(store.as_ref()).await?;
            println!("{summary}");
        }
    }

    Ok(())
}

async fn run(config: CliConfig, store: Arc<FileQueueStore>) -> anyhow::Result<()> {
    let executor_config = config
        .executor
        .context("`foreman run` needs an [executor] section in the config")?;
    let executor = Arc::new(CommandExecutor::new(executor_config));
    let orchestrator = Orchestrator::new(config.orchestrator, store, executor)?;
    orchestrator.start().await?;
    info!(
        categories = ?orchestrator.config().categories(),
        observers = orchestrator.config().observers.len(),
        "Ready for messages on stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = unless_interrupted(lines.next_line(), tokio::signal::ctrl_c()).await
        else {
            info!("Interrupted");
            break;
        };
        let Some(line) = line? else { break };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        match unless_interrupted(orchestrator.handle(message), tokio::signal::ctrl_c()).await {
            Some(Ok(response)) => println!("{response}"),
            Some(Err(e)) => warn!(error = %e, "Coordinator failed to handle message"),
            None => {
                info!("Interrupted while handling a message");
                break;
            }
        }
    }

    orchestrator.stop().await;
    println!("{}", orchestrator.summary().await?);
    println!(
        "{}",
        serde_json::to_string_pretty(&orchestrator.monitor().to_json().await)?
    );
    Ok(())
}

/// Await `work` unless `interrupt` completes first, in which case `work` is
/// dropped and `None` returned.
async fn unless_interrupted<T, I>(work: impl Future<Output = T>, interrupt: I) -> Option<T>
where
    I: Future,
{
    tokio::select! {
        out = work => Some(out),
        _ = interrupt => None,
    }
}

async fn tasks(action: TaskAction, store: Arc<FileQueueStore>) -> anyhow::Result<()> {
    let tools = IssueTools::new(store.clone(), Actor::coordinator(COORDINATOR_ID));

    match action {
        TaskAction::List { status, category } => {
            let mut filter = TaskFilter::new();
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(category) = category {
                filter = filter.with_category(category);
            }
            let tasks = store.list(&filter).await?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in &tasks {
                print_line(task);
            }
        }
        TaskAction::Create {
            title,
            description,
            kind,
            priority,
            category,
        } => {
            let mut task = tools.new_task(title, description);
            if let Some(kind) = kind {
                task = task.with_kind(kind);
            }
            if let Some(priority) = priority {
                task = task.with_priority(priority);
            }
            if let Some(category) = category {
                task = task.with_category(category);
            }
            let id = tools.create(task).await?;
            println!("{id}");
        }
        TaskAction::Unblock { id, info } => {
            let task = tools.unblock(id, info).await?;
            print_line(&task);
        }
        TaskAction::Close { id, reason } => {
            let task = tools.close(id, reason).await?;
            print_line(&task);
        }
        TaskAction::Show { id } => {
            let task = tools.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
    }
    Ok(())
}

fn print_line(task: &Task) {
    let category = task.category().unwrap_or("-");
    let assignee = task
        .assignee
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string);
    println!(
        "{}  p{}  {:<18}  {:<10}  {:<16}  {}",
        task.id,
        task.priority,
        task.status.as_str(),
        category,
        assignee,
        task.title
    );
    if let Some(notes) = &task.blocking_notes {
        println!("    waiting: {notes}");
    }
}
