use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rbm_sync::{business_today, validate_days, Engine};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "rbm-cli")]
#[command(about = "Rolling booking mirror reconciliation engine")]
struct Cli {
    /// Ignore RBM_STORE_URL and keep records in memory for this process.
    #[arg(long, global = true)]
    memory_store: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass in the foreground and print its report.
    Reconcile {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Run the reminder pass for business-local today.
    Remind,
    /// Serve the trigger surface and the cron jobs.
    Serve,
    /// Run only the cron jobs until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Reconcile { days: None }) {
        Commands::Reconcile { days } => {
            let engine = Engine::from_env(cli.memory_store).await?;
            let horizons = engine.settings.horizons;
            let days = validate_days(days.unwrap_or(horizons.fast_days), horizons.full_days)?;
            let report = engine
                .reconciler
                .run_exclusive(days)
                .await
                .context("a reconciliation run is already in flight")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Remind => {
            let engine = Engine::from_env(cli.memory_store).await?;
            let report = engine
                .reminders
                .run(business_today(engine.config.timezone))
                .await?
                .context("a reminder pass is already in flight")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve => {
            if cli.memory_store {
                let engine = Engine::from_env(true).await?;
                let scheduler = rbm_sync::build_scheduler(&engine).await?;
                if let Some(scheduler) = &scheduler {
                    scheduler.start().await?;
                }
                rbm_web::serve(engine).await?;
            } else {
                rbm_web::serve_from_env().await?;
            }
        }
        Commands::Schedule => {
            let engine = Engine::from_env(cli.memory_store).await?;
            let Some(scheduler) = rbm_sync::build_scheduler(&engine).await? else {
                anyhow::bail!("scheduler is disabled, set RBM_SCHEDULER_ENABLED=true");
            };
            scheduler.start().await?;
            info!("scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    Ok(())
}
