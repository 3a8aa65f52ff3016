use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use revmon_storage::{MemoryReviewWriter, PgReviewStore, ReviewWriter};
use revmon_sync::{build_source, maybe_build_scheduler, ReviewPipeline, SyncConfig};
use revmon_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "revmon-cli")]
#[command(about = "Review monitoring pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the service: migrations, scheduler, and the HTTP surface.
    Start,
    /// One dry-run collection cycle against an in-memory store.
    Test,
    /// Check database connectivity and print stored counts.
    Health,
    /// Print the effective configuration with secrets redacted.
    Config,
    /// Apply pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start().await,
        Commands::Test => dry_run().await,
        Commands::Health => health().await,
        Commands::Config => config_dump(),
        Commands::Migrate => migrate().await,
    }
}

async fn start() -> Result<()> {
    let config = SyncConfig::from_env();
    config.validate()?;

    let store = PgReviewStore::connect(&config.database_url).await?;
    store.run_migrations().await?;

    let port: u16 = std::env::var("REVMON_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);

    let writer: Arc<dyn ReviewWriter> = Arc::new(store.clone());
    let source = build_source(&config)?;
    let pipeline = Arc::new(ReviewPipeline::new(config, source, writer)?);

    let scheduler = maybe_build_scheduler(&pipeline).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!("scheduler started");
    } else {
        info!("scheduler disabled; runs happen via POST /api/trigger only");
    }

    let status = pipeline.status();
    let shutdown = async move {
        shutdown_signal().await;
        info!("shutdown signal received; finishing in-flight work");
        status.request_stop();
    };

    let state = AppState::new(pipeline, Arc::new(store));
    revmon_web::serve(state, port, shutdown).await?;

    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            warn!(%err, "scheduler shutdown failed");
        }
    }
    info!("service stopped");
    Ok(())
}

async fn dry_run() -> Result<()> {
    let mut config = SyncConfig::from_env();
    // Dry runs never touch the database; everything lands in memory.
    config.database_url = "memory://dry-run".to_string();
    config.validate()?;

    let writer = Arc::new(MemoryReviewWriter::new());
    let source = build_source(&config)?;
    let pipeline = ReviewPipeline::new(config, source, writer.clone())?;

    let stats = pipeline.run_once().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!(
        "dry run: {} reviews, {} links, {} collaborators would be written (nothing persisted)",
        writer.review_count(),
        writer.link_count(),
        writer.collaborator_count(),
    );
    Ok(())
}

async fn health() -> Result<()> {
    let config = SyncConfig::from_env();
    let store = PgReviewStore::connect(&config.database_url).await?;
    if !store.test_connection().await {
        bail!("database did not answer");
    }
    let counts = store.counts().await?;
    println!(
        "ok: {} reviews, {} collaborators, {} links",
        counts.reviews, counts.collaborators, counts.links
    );
    Ok(())
}

fn config_dump() -> Result<()> {
    let config = SyncConfig::from_env();
    println!("{}", serde_json::to_string_pretty(&config.redacted_summary())?);
    if let Err(err) = config.validate() {
        println!("warning: configuration is incomplete: {err}");
    }
    Ok(())
}

async fn migrate() -> Result<()> {
    let config = SyncConfig::from_env();
    let store = PgReviewStore::connect(&config.database_url).await?;
    store.run_migrations().await?;
    println!("migrations applied");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(%err, "SIGTERM handler unavailable; ctrl-c only");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
