//! CLI argument parsing and subcommand dispatch.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use sluice_core::Config;
use sluice_queue::{Hooks, InvocationContext, PassOutcome};

use crate::startup::build_app_state;

#[derive(Parser, Debug)]
#[command(name = "sluice", version, about = "Durable, self-healing background batch queue")]
pub struct Cli {
    /// Configuration profile; keys are looked up as `{PROFILE}_{KEY}` first.
    #[arg(long, global = true, env = "SLUICE_PROFILE")]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the trigger endpoint and run the health-check loop.
    Serve {
        /// Seconds between health-check schedule polls.
        #[arg(long, env = "SLUICE_TICK_SECS", default_value_t = 5)]
        tick_secs: u64,
    },
    /// Queue JSON items as one batch and dispatch a pass.
    Enqueue {
        /// Items, one JSON document per argument.
        #[arg(required = true)]
        items: Vec<String>,
    },
    /// Drain the queue in this process, ignoring the time budget.
    Drain,
    /// Delete every queued batch and clear the health check.
    Cancel,
    /// Print the queue status as JSON.
    Status,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Serve { .. } => "serve",
            Self::Enqueue { .. } => "enqueue",
            Self::Drain => "drain",
            Self::Cancel => "cancel",
            Self::Status => "status",
        }
    }
}

impl Cli {
    pub fn config(&self) -> Config {
        match &self.profile {
            Some(profile) => Config::for_profile(profile),
            None => Config::from_env(),
        }
    }
}

/// One-shot subcommands act on the queue a server is draining, so they need
/// the store and the trigger secret that server uses.
fn check_shared_setup(command: &Command, config: &Config) -> anyhow::Result<()> {
    if matches!(command, Command::Serve { .. }) {
        return Ok(());
    }
    if !config.postgres.is_configured() {
        anyhow::bail!(
            "`sluice {}` needs the shared queue store: set PG_URL or PG_HOST \
             (an in-memory queue would vanish when this command exits)",
            command.name()
        );
    }
    if matches!(command, Command::Enqueue { .. }) && config.queue.trigger_secret.is_none() {
        anyhow::bail!(
            "`sluice enqueue` dispatches to the running server: set QUEUE_TRIGGER_SECRET \
             to the secret the server uses"
        );
    }
    Ok(())
}

pub async fn run(command: Command, config: &Config) -> anyhow::Result<()> {
    check_shared_setup(&command, config)?;
    match command {
        Command::Serve { tick_secs } => crate::serve(config, Duration::from_secs(tick_secs.max(1))).await,
        Command::Enqueue { items } => enqueue(config, &items).await,
        Command::Drain => drain(config).await,
        Command::Cancel => {
            let state = build_app_state(config, Hooks::default()).await?;
            state.processor.cancel().await?;
            println!("cancelled queue '{}'", state.processor.identifier());
            Ok(())
        }
        Command::Status => {
            let state = build_app_state(config, Hooks::default()).await?;
            let status = state.processor.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn parse_items(raw: &[String]) -> anyhow::Result<Vec<Value>> {
    raw.iter()
        .enumerate()
        .map(|(i, s)| serde_json::from_str(s).with_context(|| format!("item {} is not valid JSON: {s}", i + 1)))
        .collect()
}

async fn enqueue(config: &Config, raw: &[String]) -> anyhow::Result<()> {
    let items = parse_items(raw)?;
    let state = build_app_state(config, Hooks::default()).await?;
    let count = items.len();
    for item in items {
        state.processor.push_to_queue(item);
    }
    state.processor.save().await?.dispatch().await?;
    info!(queue = %state.processor.identifier(), items = count, "enqueued and dispatched");
    // The HTTP trigger is sent from a detached task; give it a moment to leave.
    tokio::time::sleep(Duration::from_millis(config.queue.dispatch_timeout_ms)).await;
    Ok(())
}

/// Run passes locally until the queue is empty. Continuations are handled
/// by this loop rather than dispatched over HTTP.
async fn drain(config: &Config) -> anyhow::Result<()> {
    let state = build_app_state(config, Hooks::new().before_dispatch(|_| false)).await?;
    let mut total = 0;
    loop {
        let outcome = state.processor.handle_trigger(InvocationContext::Cli).await?;
        if let Some(report) = outcome.report() {
            total += report.processed;
        }
        match outcome {
            PassOutcome::Continued { .. } => continue,
            PassOutcome::Completed { .. } => {
                println!("drained queue '{}' ({total} items handled)", state.processor.identifier());
                return Ok(());
            }
            PassOutcome::Skipped { reason } => {
                anyhow::bail!("pass skipped: {reason:?}");
            }
            PassOutcome::Aborted { report } => {
                anyhow::bail!(
                    "pass aborted after {} items: {}",
                    report.processed,
                    report.fatal.unwrap_or_default()
                );
            }
            PassOutcome::LockLost { report } => {
                anyhow::bail!(
                    "lost the queue lock after {} items; another worker is draining",
                    report.processed
                );
            }
        }
    }
}
