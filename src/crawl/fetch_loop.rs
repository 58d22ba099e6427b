//! Paginated search over one survey's area.
//!
//! Pages are requested in order from the survey's persisted cursor, and the
//! cursor is saved after every page, so an interrupted pass resumes at the
//! first page it had not stored. Listing rows are upserted, never blindly
//! inserted, which keeps a page fetched twice from duplicating anything.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::retry::{retry, with_timeout};
use crate::error::{CrawlError, CrawlResult};
use crate::models::{BoundingBox, GeoArea, SurveyStatus, UpsertOutcome};
use crate::scrapers::SearchRecord;
use crate::session::CrawlSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Persist listings and survey progress
    Add,
    /// Fetch and report only; nothing is written
    Print,
}

#[derive(Debug, Clone)]
pub struct SurveyResult {
    pub survey_id: i64,
    /// Search records processed in this pass
    pub listings_found: usize,
    /// Records that created a new row
    pub new_listings: usize,
    pub pages_fetched: u32,
    pub overflow: bool,
    /// `Running` when the pass overflowed and children still have to run
    pub status: SurveyStatus,
    /// Records seen in print mode
    pub printed: Vec<SearchRecord>,
}

impl SurveyResult {
    fn empty(survey_id: i64, status: SurveyStatus, overflow: bool) -> Self {
        Self {
            survey_id,
            listings_found: 0,
            new_listings: 0,
            pages_fetched: 0,
            overflow,
            status,
            printed: Vec::new(),
        }
    }
}

/// How a pass over the pages ended
enum PassEnd {
    Exhausted,
    Overflow,
    Interrupted,
    PageFailed(CrawlError),
}

pub async fn run_survey(
    session: &CrawlSession,
    survey_id: i64,
    mode: RunMode,
) -> CrawlResult<SurveyResult> {
    let store = &session.store;
    let persist = mode == RunMode::Add;
    let survey = store.survey(survey_id).await?;
    let area = store.geo_area(survey.geo_area_id).await?;

    if persist && survey.status.is_settled() {
        info!(survey_id, status = %survey.status, "Survey already settled, nothing to fetch");
        return Ok(SurveyResult::empty(survey_id, survey.status, survey.overflow));
    }
    if session.is_cancelled() {
        info!(survey_id, "Cancelled before the survey started");
        let mut status = survey.status;
        if persist && status == SurveyStatus::Running {
            status = SurveyStatus::Incomplete;
            store.set_survey_status(survey_id, status, None).await?;
        }
        return Ok(SurveyResult::empty(survey_id, status, survey.overflow));
    }

    if persist {
        if survey.status == SurveyStatus::Running {
            warn!(survey_id, "Survey was left running by an earlier process, resuming it");
        }
        store
            .set_survey_status(survey_id, SurveyStatus::Running, None)
            .await?;
    }

    let bounding_box = match resolve_bounding_box(session, &area, persist).await {
        Ok(bbox) => bbox,
        Err(err) if err.is_transient() => {
            warn!(survey_id, area = %area.name, error = %err, "Geocoder unavailable, survey left resumable");
            if persist {
                store
                    .set_survey_status(survey_id, SurveyStatus::Incomplete, None)
                    .await?;
            }
            return Ok(SurveyResult::empty(survey_id, SurveyStatus::Incomplete, false));
        }
        Err(err) => {
            error!(survey_id, area = %area.name, error = %err, "Survey failed, area has no usable bounding box");
            if persist {
                store
                    .set_survey_status(survey_id, SurveyStatus::Failed, None)
                    .await?;
            }
            return Err(CrawlError::fatal(format!(
                "survey {survey_id} failed and is not resumable: area '{}' cannot be geocoded ({err})",
                area.name
            )));
        }
    };

    let slot = tokio::select! {
        _ = session.cancel.cancelled() => None,
        permit = session.survey_slots.acquire() => permit.ok(),
    };
    if slot.is_none() {
        info!(survey_id, "Cancelled before the survey started paging");
        if persist {
            store
                .set_survey_status(survey_id, SurveyStatus::Incomplete, None)
                .await?;
        }
        return Ok(SurveyResult::empty(survey_id, SurveyStatus::Incomplete, survey.overflow));
    }

    let max_pages = session.config.search_max_pages;
    let start = if persist { survey.page_cursor } else { 0 };
    let mut overflow = persist && survey.overflow;
    let mut end = if overflow {
        info!(survey_id, "Search pages already fetched, overflow recorded earlier");
        PassEnd::Overflow
    } else {
        PassEnd::Exhausted
    };
    let mut result = SurveyResult::empty(survey_id, SurveyStatus::Running, overflow);
    let mut page = start;

    while !overflow && page < max_pages {
        if session.is_cancelled() {
            end = PassEnd::Interrupted;
            break;
        }
        if page > start && !session.config.request_sleep.is_zero() {
            tokio::select! {
                _ = session.cancel.cancelled() => {
                    end = PassEnd::Interrupted;
                    break;
                }
                _ = tokio::time::sleep(session.config.request_sleep) => {}
            }
        }

        let fetched = retry(
            session.retry_policy(),
            &session.proxies,
            &session.cancel,
            move |egress| async move {
                session
                    .scraper
                    .search_by_bounding_box(&bounding_box, page, &egress)
                    .await
            },
        )
        .await;
        let search_page = match fetched {
            Ok(search_page) => search_page,
            Err(err) if err.is_transient() => {
                end = PassEnd::PageFailed(err);
                break;
            }
            Err(CrawlError::NotFound(what)) => {
                debug!(survey_id, page, %what, "Search has no such page");
                break;
            }
            Err(CrawlError::Cancelled) => {
                end = PassEnd::Interrupted;
                break;
            }
            Err(err) => {
                if persist {
                    store
                        .set_survey_status(survey_id, SurveyStatus::Incomplete, None)
                        .await?;
                }
                return Err(err);
            }
        };

        for record in &search_page.records {
            result.listings_found += 1;
            if !persist {
                result.printed.push(record.clone());
                continue;
            }
            match store.upsert_listing(survey_id, &area.name, record).await? {
                UpsertOutcome::Inserted => result.new_listings += 1,
                UpsertOutcome::Updated => {
                    debug!(survey_id, room_id = record.room_id, "Listing already collected")
                }
                UpsertOutcome::Tombstoned => {
                    debug!(survey_id, room_id = record.room_id, "Listing is deleted, left as is")
                }
            }
        }

        page += 1;
        result.pages_fetched += 1;
        if search_page.overflow || (search_page.has_more && page >= max_pages) {
            overflow = true;
            end = PassEnd::Overflow;
        }
        if persist {
            store.save_progress(survey_id, page, overflow).await?;
        }
        debug!(
            survey_id,
            page,
            records = search_page.records.len(),
            total = ?search_page.total_results,
            "Search page processed"
        );
        if !search_page.has_more {
            break;
        }
    }

    result.overflow = overflow;
    result.status = match end {
        PassEnd::Exhausted => SurveyStatus::Complete,
        PassEnd::Overflow => {
            info!(survey_id, area = %area.name, pages = page, "Area overflows pagination");
            SurveyStatus::Running
        }
        PassEnd::Interrupted => {
            info!(survey_id, page_cursor = page, "Survey interrupted, resumable");
            SurveyStatus::Incomplete
        }
        PassEnd::PageFailed(err) => {
            warn!(survey_id, page, error = %err, "Search page failed after retries, survey resumable");
            SurveyStatus::Incomplete
        }
    };

    if persist && result.status != SurveyStatus::Running {
        let completed_at = (result.status == SurveyStatus::Complete).then(Utc::now);
        store
            .set_survey_status(survey_id, result.status, completed_at)
            .await?;
    }
    info!(
        survey_id,
        area = %area.name,
        found = result.listings_found,
        new = result.new_listings,
        status = %result.status,
        "Survey pass finished"
    );
    Ok(result)
}

/// Stored box of an area, geocoding (and storing) it when missing.
async fn resolve_bounding_box(
    session: &CrawlSession,
    area: &GeoArea,
    persist: bool,
) -> CrawlResult<BoundingBox> {
    if let Some(bbox) = area.bounding_box {
        return Ok(bbox);
    }

    info!(area = %area.name, "Area has no bounding box, geocoding it");
    let mut attempts = 0;
    let bbox = loop {
        attempts += 1;
        match with_timeout(
            session.config.request_timeout,
            session.geocoder.bounding_box(&area.name),
        )
        .await
        {
            Ok(bbox) => break bbox,
            Err(err) if err.is_transient() && attempts < session.config.max_connection_attempts => {
                debug!(area = %area.name, attempt = attempts, error = %err, "Retrying geocoder");
            }
            Err(err) => return Err(err),
        }
    };
    if persist {
        session.store.update_bounding_box(area.id, bbox).await?;
    }
    Ok(bbox)
}
