//! Agent Crew CLI
//!
//! Runs one task through the agent pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use agent_crew::sandbox::executor_from_config;
use agent_crew::{
    CliLlm, Collaborators, CommandChannel, CrewConfig, GitHubPublisher, LogChannel,
    NotificationChannel, Orchestrator, RunStatus, Task, VolatileMemory,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <task description>", args[0]);
        eprintln!("\nPlans, writes, sandboxes and reviews code for the task.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  CREW_CONFIG=<path>   TOML configuration file");
        eprintln!("  CREW_REPO=<path>     Repository approved code is published to");
        eprintln!("  CREW_NOTIFY=<addr>   Recipient of the outcome summary");
        std::process::exit(1);
    }

    let description = args[1..].join(" ");

    let config_path = std::env::var_os("CREW_CONFIG").map(PathBuf::from);
    let config = match CrewConfig::load_validated(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Cannot determine working directory: {}", e);
            std::process::exit(1);
        }
    };
    let repo_dir = std::env::var_os("CREW_REPO")
        .map(PathBuf::from)
        .unwrap_or_else(|| cwd.clone());

    let channel: Arc<dyn NotificationChannel> = match config
        .notify
        .command
        .as_deref()
        .and_then(CommandChannel::new)
    {
        Some(channel) => {
            tracing::info!("using command notification channel");
            Arc::new(channel)
        }
        None => Arc::new(LogChannel),
    };

    let collaborators = Collaborators {
        llm: Arc::new(CliLlm::from_config(&config.llm).with_working_dir(cwd)),
        memory: Arc::new(VolatileMemory::new()),
        executor: Arc::new(executor_from_config(&config.sandbox)),
        publisher: Arc::new(GitHubPublisher::from_config(&config.publish, &repo_dir)),
        channel,
    };
    let orchestrator = Orchestrator::from_config(&config, collaborators);

    let mut task = Task::new(&description).with_repository(repo_dir.display().to_string());
    if let Ok(recipient) = std::env::var("CREW_NOTIFY") {
        task = task.with_recipient(recipient);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current cycle");
            on_signal.cancel();
        }
    });

    tracing::info!(task = %description, "starting run");
    let outcome = orchestrator.run_with_cancellation(task, cancel).await;

    println!("\n{}", "=".repeat(60));
    println!("Run Complete: {}", outcome.run_id);
    println!("{}", "=".repeat(60));
    println!();
    println!("{}", outcome.summary_markdown());

    if outcome.status != RunStatus::Completed {
        std::process::exit(1);
    }
}
