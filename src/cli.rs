//! Subcommand execution. Each command prints a short confirmation; failures
//! carry the survey or area they concern.

use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use listing_scout::crawl::{fill, surveyor, RunMode, TreeReport};
use listing_scout::geo::SplitDimension;
use listing_scout::models::{Listing, Survey};
use listing_scout::store::FillScope;
use listing_scout::{crawl, CrawlSession};
use std::sync::Arc;
use tracing::info;

use super::Commands;

pub async fn run(command: &Commands, session: Arc<CrawlSession>) -> Result<()> {
    match command {
        Commands::AddArea { name } => {
            let (area, created) = surveyor::add_area(&session, name)
                .await
                .with_context(|| format!("could not add area '{name}'"))?;
            let verb = if created { "Added" } else { "Area already exists:" };
            println!("{verb} {} (id {}, abbreviation {})", area.name, area.id, area.abbreviation);
            if let Some(bbox) = area.bounding_box {
                println!("  {bbox}");
            }
        }
        Commands::AreaInfo { area } => {
            let area = surveyor::find_area(&session, area).await?;
            let surveys = session.store.surveys_for_area(area.id).await?;
            println!("{} (id {}, abbreviation {})", area.name, area.id, area.abbreviation);
            match area.bounding_box {
                Some(bbox) => println!("  bounding box: {bbox}"),
                None => println!("  bounding box: not geocoded yet"),
            }
            println!("  surveys: {}", surveys.len());
            for survey in &surveys {
                print_survey(survey);
            }
        }
        Commands::AddSurvey { area } => {
            let survey = surveyor::add_survey(&session, area)
                .await
                .with_context(|| format!("could not add a survey for '{area}'"))?;
            println!("Survey {} created for area {}", survey.id, survey.geo_area_id);
        }
        Commands::Search { survey_id } => {
            let report = surveyor::run_survey_tree(&session, *survey_id)
                .await
                .with_context(|| format!("survey {survey_id} aborted"))?;
            print_tree_report(&format!("Survey {survey_id}"), &report);
        }
        Commands::PrintSearch { survey_id } => {
            let result = crawl::run_survey(&session, *survey_id, RunMode::Print)
                .await
                .with_context(|| format!("search for survey {survey_id} failed"))?;
            for record in &result.printed {
                println!("{}\t{:.6}\t{:.6}", record.room_id, record.latitude, record.longitude);
            }
            println!(
                "{} listings on {} pages{}",
                result.listings_found,
                result.pages_fetched,
                if result.overflow { ", area overflows" } else { "" }
            );
        }
        Commands::AddAndSearch { area } => {
            let (area, _) = surveyor::add_area(&session, area)
                .await
                .with_context(|| format!("could not add area '{area}'"))?;
            let survey = surveyor::add_survey(&session, &area.id.to_string()).await?;
            let report = surveyor::run_survey_tree(&session, survey.id)
                .await
                .with_context(|| format!("survey {} of '{}' aborted", survey.id, area.name))?;
            print_tree_report(&format!("Survey {} ({})", survey.id, area.name), &report);
        }
        Commands::SuperSurvey { area } => {
            let (super_survey_id, report) = surveyor::run_super_survey(&session, area)
                .await
                .with_context(|| format!("super survey of '{area}' aborted"))?;
            print_tree_report(&format!("Super survey {super_survey_id} ({area})"), &report);
        }
        Commands::ResumeSuperSurvey { super_survey_id } => {
            let report = surveyor::resume_super_survey(&session, *super_survey_id)
                .await
                .with_context(|| format!("resuming super survey {super_survey_id} failed"))?;
            print_tree_report(&format!("Super survey {super_survey_id}"), &report);
        }
        Commands::ContinueSublocality { super_survey_id } => {
            continue_by(&session, *super_survey_id, SplitDimension::Sublocality).await?;
        }
        Commands::ContinueRoute { super_survey_id } => {
            continue_by(&session, *super_survey_id, SplitDimension::Route).await?;
        }
        Commands::DeleteSurvey { survey_id, yes } => {
            let survey = session.store.survey(*survey_id).await?;
            let prompt = format!(
                "Delete all listings of survey {} and reset it to pending?",
                survey.id
            );
            if !*yes && !confirm(&prompt)? {
                println!("Cancelled");
                return Ok(());
            }
            let removed = surveyor::delete_survey(&session, survey.id).await?;
            println!("Survey {} reset, {removed} listings removed", survey.id);
        }
        Commands::ListSurveys => {
            let surveys = session.store.surveys().await?;
            if surveys.is_empty() {
                println!("No surveys");
            }
            for survey in &surveys {
                print_survey(survey);
            }
        }
        Commands::ListRoom { room_id } => {
            let rows = session.store.listings_for_room(*room_id).await?;
            if rows.is_empty() {
                println!("Room {room_id} is not stored");
            }
            for listing in &rows {
                print_listing(listing);
            }
        }
        Commands::PrintRoom { room_id } => {
            let detail = fill::preview_detail(&session, *room_id)
                .await
                .with_context(|| format!("could not fetch room {room_id}"))?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        Commands::Fill { survey } => {
            let scope = survey.map_or(FillScope::Global, FillScope::Survey);
            let report = fill::run_fill(session.clone(), scope)
                .await
                .context("fill aborted")?;
            println!(
                "Filled {}, deleted {}, abandoned {} ({} transient failures)",
                report.filled, report.deleted, report.abandoned, report.transient_failures
            );
            if session.is_cancelled() {
                println!("Fill interrupted; run it again to continue");
            }
        }
        Commands::DbPing => {
            session.store.ping().await.context("database is unreachable")?;
            println!("Database connection OK");
        }
        Commands::DedupeSuperSurvey { super_survey_id } => {
            session.store.super_survey(*super_survey_id).await?;
            let removed = session
                .store
                .prune_duplicate_listings(*super_survey_id)
                .await?;
            info!(super_survey_id, removed, "Duplicate listings pruned");
            println!("Removed {removed} duplicate listings from super survey {super_survey_id}");
        }
    }
    Ok(())
}

async fn continue_by(session: &CrawlSession, super_survey_id: i64, dimension: SplitDimension) -> Result<()> {
    let report = surveyor::continue_by(session, super_survey_id, dimension)
        .await
        .with_context(|| format!("continuing super survey {super_survey_id} by {dimension} failed"))?;
    print_tree_report(
        &format!("Super survey {super_survey_id} by {dimension}"),
        &report,
    );
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

fn print_tree_report(label: &str, report: &TreeReport) {
    println!(
        "{label}: {} surveys run, {} listings ({} new), {} child surveys created",
        report.surveys_run, report.listings_found, report.new_listings, report.children_created
    );
    if report.unsettled > 0 {
        println!(
            "  {} surveys are incomplete or failed; incomplete ones can be resumed",
            report.unsettled
        );
    }
}

fn print_survey(survey: &Survey) {
    println!(
        "  #{:<6} area {:<6} {:<10} pages {:<3} super {} parent {} created {}",
        survey.id,
        survey.geo_area_id,
        survey.status.as_str(),
        survey.page_cursor,
        survey.super_survey_id.map_or("-".to_string(), |id| id.to_string()),
        survey.parent_survey_id.map_or("-".to_string(), |id| id.to_string()),
        survey.created_at.format("%Y-%m-%d %H:%M"),
    );
}

fn print_listing(listing: &Listing) {
    let state = if listing.deleted {
        "deleted"
    } else if listing.detail_fetched {
        "filled"
    } else {
        "stub"
    };
    println!(
        "  room {} survey {} {} ({:.6}, {:.6}) {state}",
        listing.room_id, listing.survey_id, listing.geo_area_name, listing.latitude, listing.longitude
    );
    if let Some(name) = listing.detail.as_ref().and_then(|d| d.name.as_deref()) {
        println!("    {name}");
    }
}
