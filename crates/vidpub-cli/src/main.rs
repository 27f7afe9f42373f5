use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vidpub_core::SyncOptions;
use vidpub_sync::{build_scheduler, SyncRuntime};

#[derive(Debug, Parser)]
#[command(name = "vidpub-cli")]
#[command(about = "Video catalog sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull videos from the upstream API into the site store.
    Sync(SyncArgs),
    ClearLogs,
    TestConnection,
    Stats,
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run the recurring sync job until interrupted.
    Schedule,
    Serve,
    /// Forget the watermark, activity log and cached pages.
    Reset,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Ignore the last-sync watermark.
    #[arg(long)]
    full: bool,
    /// Ask upstream to refresh first, then run a full uncached sync.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    bypass_cache: bool,
    /// Only fetch videos changed after this watermark.
    #[arg(long, conflicts_with = "full")]
    since: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let result = if args.force {
                let runtime = SyncRuntime::from_env().await?;
                runtime.run_force_sync(true, None).await?
            } else {
                vidpub_sync::run_sync_once_from_env(SyncOptions {
                    full_sync: args.full,
                    bypass_cache: args.bypass_cache,
                    since: args.since,
                })
                .await?
            };
            println!("Sync completed: {result}");
            println!("run_id={}", result.run_id);
        }
        Commands::ClearLogs => {
            SyncRuntime::from_env().await?.clear_logs().await?;
            println!("Logs cleared successfully.");
        }
        Commands::TestConnection => {
            let runtime = SyncRuntime::from_env().await?;
            if let Err(err) = runtime.test_connection().await {
                bail!("API connection failed: {err}");
            }
            println!("API connection successful!");
        }
        Commands::Stats => {
            let stats = SyncRuntime::from_env().await?.stats().await?;
            println!("Total Videos: {}", stats.total);
            println!("Published: {}", stats.published);
            println!("Drafts: {}", stats.drafts);
            println!("Pending: {}", stats.pending);
            println!("Last Sync: {}", stats.last_sync);
        }
        Commands::Logs { limit } => {
            let runtime = SyncRuntime::from_env().await?;
            let logs = runtime.activity().entries().await?;
            if logs.is_empty() {
                println!("No activity logged yet.");
            }
            for entry in logs.iter().take(limit) {
                println!(
                    "[{}] {}: {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.level.as_str().to_uppercase(),
                    entry.message
                );
            }
        }
        Commands::Schedule => {
            let runtime = Arc::new(SyncRuntime::from_env().await?);
            let cron = runtime.settings().sync_interval.cron_expression();
            let mut sched = build_scheduler(runtime).await?;
            sched.start().await.context("starting scheduler")?;
            println!("scheduler running: cron={cron} (ctrl-c to stop)");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            vidpub_web::serve_from_env().await?;
        }
        Commands::Reset => {
            SyncRuntime::from_env().await?.reset().await?;
            println!("Sync state reset.");
        }
    }

    Ok(())
}
