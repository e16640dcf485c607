//! ferry CLI
//!
//! ```bash
//! # 10 件投入して worker で処理、結果を JSON で出力
//! ferry demo --tasks 10 --fail-rate 0.3
//!
//! # 環境変数から読んだ設定を表示
//! FERRY_MAX_ATTEMPTS=5 ferry config
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use ferry_core::{
    EngineBuilder, FerryConfig, HandlerError, RetryPolicy, SubmitTask, TaskHandler, TaskId,
    TaskRecord, TaskService,
};
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ferry", version, about = "Task lifecycle and delivery engine")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit tasks to an in-memory engine and run them to completion
    Demo(DemoArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct DemoArgs {
    /// Number of tasks to submit
    #[arg(long, default_value_t = 5)]
    tasks: usize,

    /// Task kind (email, data_sync, or anything else for the fallback)
    #[arg(long, default_value = "email")]
    kind: String,

    #[arg(long, default_value = "user@example.com")]
    payload: String,

    /// Probability that a handler call fails transiently
    #[arg(long, default_value_t = 0.0)]
    fail_rate: f64,

    /// Overrides FERRY_RETRY_DELAY_MS for the demo
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.json);

    match cli.command {
        Commands::Demo(args) => demo(args).await,
        Commands::Config => {
            let config = FerryConfig::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn setup_logging(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Demo handler: fails with probability `fail_rate`, otherwise answers
/// with `reply`.
struct DemoHandler {
    fail_rate: f64,
    reply: fn(&TaskRecord) -> String,
}

#[async_trait]
impl TaskHandler for DemoHandler {
    async fn handle(&self, task: &TaskRecord) -> Result<String, HandlerError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if rand::thread_rng().gen_bool(self.fail_rate) {
            return Err(HandlerError::transient(format!(
                "simulated failure on attempt {}",
                task.attempt_count
            )));
        }
        Ok((self.reply)(task))
    }
}

#[derive(Serialize)]
struct Report {
    submitted: usize,
    finished: usize,
    tasks: Vec<TaskRecord>,
}

async fn demo(args: DemoArgs) -> Result<()> {
    if !(0.0..=1.0).contains(&args.fail_rate) {
        bail!("--fail-rate must be between 0 and 1");
    }
    let mut config = FerryConfig::from_env()?;
    if let Some(ms) = args.retry_delay_ms {
        config.retry.delay_ms = ms;
    }
    let policy = RetryPolicy::from(&config.retry);

    let handler = |reply: fn(&TaskRecord) -> String| -> Arc<dyn TaskHandler> {
        Arc::new(DemoHandler {
            fail_rate: args.fail_rate,
            reply,
        })
    };
    let engine = EngineBuilder::new(config)
        .with_retry_policy(policy)
        .register("email", handler(|t| format!("Email sent to {}", t.payload)))?
        .register("data_sync", handler(|_| String::new()))?
        .fallback(handler(|t| format!("Processed {} task", t.kind)))
        .build()?;

    let workers = engine.spawn_workers();
    let cancel = CancellationToken::new();
    let reaper = engine.spawn_reaper(cancel.clone());

    let mut ids: Vec<TaskId> = Vec::with_capacity(args.tasks);
    for i in 0..args.tasks {
        let request = SubmitTask {
            kind: args.kind.clone(),
            payload: format!("{}#{i}", args.payload),
        };
        let record = engine.service().submit(request).await?;
        ids.push(record.id);
    }
    info!(submitted = ids.len(), "tasks submitted");

    let outcome = tokio::select! {
        res = tokio::time::timeout(
            Duration::from_secs(args.timeout_secs),
            wait_until_finished(engine.service(), &ids),
        ) => {
            res.context("timed out waiting for tasks to finish")
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    cancel.cancel();
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    workers.shutdown_and_join().await;

    let tasks = outcome??;
    let report = Report {
        submitted: ids.len(),
        finished: tasks.len(),
        tasks,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn wait_until_finished(service: &TaskService, ids: &[TaskId]) -> Result<Vec<TaskRecord>> {
    loop {
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            tasks.push(service.get(*id).await?);
        }
        if tasks.iter().all(TaskRecord::is_terminal) {
            return Ok(tasks);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
