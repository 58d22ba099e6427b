mod cli;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use listing_scout::config::Settings;
use listing_scout::CrawlSession;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "listing-scout", about = "Crawl map-search listings area by area")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Use the in-memory store; nothing outlives the process
    #[arg(long, global = true)]
    memory: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Geocode a place and register it as a search area
    AddArea { name: String },
    /// Show an area's bounding box and surveys
    AreaInfo {
        /// Area name or id
        area: String,
    },
    /// Create a survey for a registered area
    AddSurvey {
        /// Area name or id
        area: String,
    },
    /// Run a survey, splitting its area if results overflow
    Search { survey_id: i64 },
    /// Run a survey's search without storing anything
    PrintSearch { survey_id: i64 },
    /// Register an area, create a survey for it and run it
    AddAndSearch { area: String },
    /// Survey an area and every subdivision its overflow needs
    SuperSurvey { area: String },
    /// Re-run the pending and incomplete surveys of a super survey
    ResumeSuperSurvey { super_survey_id: i64 },
    /// Survey the root area's sublocalities not yet covered
    ContinueSublocality { super_survey_id: i64 },
    /// Survey the root area's streets not yet covered
    ContinueRoute { super_survey_id: i64 },
    /// Drop a survey's listings and set it back to pending
    DeleteSurvey {
        survey_id: i64,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// List all surveys
    ListSurveys,
    /// Show every stored row of a room
    ListRoom { room_id: i64 },
    /// Fetch a room's detail page and print it without storing
    PrintRoom { room_id: i64 },
    /// Fetch detail pages for listings that lack them
    Fill {
        /// Only fill listings of this survey
        #[arg(long)]
        survey: Option<i64>,
    },
    /// Check the database connection
    DbPing,
    /// Remove older duplicate rows of the same room within a super survey
    DedupeSuperSurvey { super_survey_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, letting in-flight requests finish");
            on_signal.cancel();
        }
    });

    let config = cli.settings.into_config();
    let session = CrawlSession::connect(config, cli.memory, cancel)
        .await
        .context("failed to start crawl session")?;
    cli::run(&cli.command, Arc::new(session)).await
}
