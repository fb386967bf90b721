use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use framepace_core::config::{millis_to_duration, FramepaceConfig};
use framepace_scheduler::{Engine, Scheduler};
use tracing::{info, warn};

mod demo;

/// Frame-paced cooperative job scheduler.
#[derive(Parser, Debug)]
#[command(name = "framepace", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the demonstration workload until interrupted.
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to framepace.toml (falls back to FRAMEPACE_CONFIG, then ~/.framepace).
    #[arg(long)]
    config: Option<String>,

    /// Override the minimum interval between ticks.
    #[arg(long)]
    frame_delay_ms: Option<f64>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Schedule a job that aborts the loop on its N-th call.
    #[arg(long, value_name = "N")]
    abort_after: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    // load config before logging so the configured filter applies;
    // a load failure is reported once the subscriber is up
    let loaded = FramepaceConfig::load(args.config.as_deref());
    let config = loaded.as_ref().cloned().unwrap_or_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .init();

    if let Err(e) = &loaded {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
    }

    let scheduler = Scheduler::from_config(&config.scheduler);
    if let Some(ms) = args.frame_delay_ms {
        scheduler.set_frame_delay(millis_to_duration(ms));
    }

    let engine = Engine::new(scheduler);
    engine.load_service(demo::Heartbeat::default()).await?;
    engine.schedule_job(demo::warmup());
    if let Some(after) = args.abort_after {
        engine.schedule_job(demo::fault_injector(after));
    }

    engine.start().await?;
    let scheduler = engine.scheduler();
    let completion = scheduler.completion();

    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, stopping"),
        _ = deadline => info!("run duration elapsed, stopping"),
        _ = completion.wait() => {}
    }

    engine.stop().await;

    let stats = scheduler.tick_stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    completion.wait().await.context("scheduler faulted")?;
    Ok(())
}
