//! `tidewire run`: one message, or an interactive session.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tidewire_config::AppConfig;
use tidewire_core::history::{FileHistory, HistoryStore};
use tidewire_core::EventBus;
use tidewire_pipeline::{Engine, PipelineOutput};
use tidewire_providers::build_from_config;
use tidewire_tasks::{
    PipelineEngineFactory, PromptRunner, TaskManager, WORKSPACE_HISTORY_FILE, task_tools,
};
use tidewire_tools::{ConfirmationGate, Decision};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const EVENT_BUS_CAPACITY: usize = 1024;

pub struct RunOptions {
    pub message: Option<String>,
    pub workspace: Option<PathBuf>,
    pub dry_run: bool,
    pub allow_outside: bool,
}

/// An engine plus the task manager wired into it.
struct Session {
    engine: Arc<Engine>,
    tasks: Arc<TaskManager>,
}

impl Session {
    async fn open(config: AppConfig, root: &Path, options: &RunOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let events = Arc::new(EventBus::new(EVENT_BUS_CAPACITY));
        let router = Arc::new(build_from_config(&config));

        let factory = PipelineEngineFactory::new(config.clone()).with_router(router.clone());
        let tasks = Arc::new(
            TaskManager::new(config.tasks.clone())
                .with_engine_factory(Arc::new(factory))
                .with_events(events.clone())
                .with_origin_workspace(root),
        );

        let history = FileHistory::open(root.join(WORKSPACE_HISTORY_FILE)).await?;
        // Nobody can answer a prompt while the agent owns the terminal
        let gate = if options.allow_outside {
            ConfirmationGate::auto(Decision::AllowOnce)
        } else {
            ConfirmationGate::auto(Decision::Deny)
        };

        let mut builder = Engine::builder(config.clone(), root)
            .with_router(router)
            .with_events(events)
            .with_history(Arc::new(history) as Arc<dyn HistoryStore>)
            .with_gate(Arc::new(gate))
            .with_tool_source(Arc::new(task_tools(tasks.clone())))
            .with_notifications(tasks.clone());
        if options.dry_run {
            builder = builder.with_dry_run(true);
        }
        let engine = Arc::new(builder.build()?);

        let runner: Weak<dyn PromptRunner> = Arc::downgrade(&engine) as Weak<dyn PromptRunner>;
        tasks.set_prompt_runner(runner);
        for error in tasks.load_schedules(&config.schedules) {
            warn!(error = %error, "Schedule not started");
        }

        Ok(Self { engine, tasks })
    }

    async fn close(self) {
        self.tasks.shutdown();
        self.engine.dispose().await;
    }
}

pub async fn run(options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if !config.has_api_key() {
        warn!(
            "No API key configured. Set TIDEWIRE_API_KEY, OPENROUTER_API_KEY or OPENAI_API_KEY, \
             or add api_key to {}",
            AppConfig::config_dir().join("config.toml").display()
        );
    }

    let root = match &options.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let root = std::fs::canonicalize(&root)
        .map_err(|e| format!("Workspace {} is not accessible: {e}", root.display()))?;
    info!(workspace = %root.display(), dry_run = options.dry_run, "Starting session");

    let session = Session::open(config, &root, &options).await?;
    let result = match &options.message {
        Some(message) => {
            let output = session.engine.handle(message).await;
            print_output(&output);
            print_planned_changes(&session.engine);
            if output.failed {
                Err("Request failed".into())
            } else {
                Ok(())
            }
        }
        None => interactive(&session, &root).await,
    };
    session.close().await;
    result
}

async fn interactive(session: &Session, root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("  Tidewire interactive mode");
    println!("  Workspace: {}", root.display());
    println!("  Commands:  /tasks, /exit");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/exit" | "exit" | "quit" => break,
            "/tasks" => {
                print_tasks(&session.tasks);
                continue;
            }
            _ => {}
        }

        let output = session.engine.handle(input).await;
        println!();
        print_output(&output);
        println!();
        session.tasks.cleanup_old();
    }

    print_planned_changes(&session.engine);
    println!();
    Ok(())
}

fn print_output(output: &PipelineOutput) {
    if output.failed {
        eprintln!("{}", output.response);
        return;
    }
    println!("{}", output.response);
}

fn print_tasks(tasks: &TaskManager) {
    let records = tasks.list_tasks();
    if records.is_empty() {
        println!("  No background tasks.");
    }
    for record in records {
        println!("  {}", record.summary());
    }
    for schedule in tasks.list_schedules() {
        println!("  [schedule] {} every {}s", schedule.name, schedule.interval_secs);
    }
}

fn print_planned_changes(engine: &Engine) {
    let changes = engine.executor().planned_changes();
    if changes.is_empty() {
        return;
    }
    println!();
    println!("Planned changes (dry run):");
    for change in changes {
        let target = if change.paths.is_empty() {
            change.arguments.to_string()
        } else {
            change.paths.join(", ")
        };
        println!("  {} {}", change.tool_name, target);
    }
}
