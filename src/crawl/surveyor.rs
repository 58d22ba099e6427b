//! Survey trees: a survey, and the child surveys its overflow spawns.
//!
//! A parent that overflows stays `running` while its children run. It
//! settles as `complete` once every child is complete or failed, and as
//! `incomplete` otherwise, so a later resume picks the tree up again.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use tracing::{error, info, warn};

use super::fetch_loop::{run_survey, RunMode};
use super::retry::with_timeout;
use crate::error::{CrawlError, CrawlResult};
use crate::geo::SplitDimension;
use crate::models::{GeoArea, NewSurvey, Survey, SurveyStatus};
use crate::session::CrawlSession;

/// Totals over a survey and its descendants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeReport {
    pub surveys_run: usize,
    pub listings_found: usize,
    pub new_listings: usize,
    pub children_created: usize,
    /// Surveys left `incomplete` or `failed`
    pub unsettled: usize,
}

impl TreeReport {
    fn absorb(&mut self, other: TreeReport) {
        self.surveys_run += other.surveys_run;
        self.listings_found += other.listings_found;
        self.new_listings += other.new_listings;
        self.children_created += other.children_created;
        self.unsettled += other.unsettled;
    }
}

/// Area named by a numeric id or by its exact name.
pub async fn find_area(session: &CrawlSession, area: &str) -> CrawlResult<GeoArea> {
    if let Ok(id) = area.parse::<i64>() {
        return Ok(session.store.geo_area(id).await?);
    }
    session
        .store
        .geo_area_by_name(area)
        .await?
        .ok_or_else(|| CrawlError::fatal(format!("area '{area}' is not registered, add it first")))
}

/// Register (or reuse) an area, geocoding it when it has no box yet.
pub async fn add_area(session: &CrawlSession, name: &str) -> CrawlResult<(GeoArea, bool)> {
    let (area, created) = session.store.get_or_create_geo_area(name, None).await?;
    if area.bounding_box.is_some() {
        return Ok((area, created));
    }
    let bbox = with_timeout(session.config.request_timeout, session.geocoder.bounding_box(name))
        .await
        .map_err(|e| CrawlError::fatal(format!("area '{name}' cannot be geocoded: {e}")))?;
    session.store.update_bounding_box(area.id, bbox).await?;
    let area = GeoArea {
        bounding_box: Some(bbox),
        ..area
    };
    Ok((area, created))
}

/// New standalone survey of an existing area.
pub async fn add_survey(session: &CrawlSession, area: &str) -> CrawlResult<Survey> {
    let area = find_area(session, area).await?;
    let survey = session
        .store
        .create_survey(NewSurvey {
            geo_area_id: area.id,
            ..NewSurvey::default()
        })
        .await?;
    info!(survey_id = survey.id, area = %area.name, "Survey created");
    Ok(survey)
}

/// Run a survey, then, if it overflowed, its children, recursively.
pub fn run_survey_tree(session: &CrawlSession, survey_id: i64) -> BoxFuture<'_, CrawlResult<TreeReport>> {
    async move {
        let pass = run_survey(session, survey_id, RunMode::Add).await?;
        let mut report = TreeReport {
            surveys_run: 1,
            listings_found: pass.listings_found,
            new_listings: pass.new_listings,
            ..TreeReport::default()
        };
        if pass.status != SurveyStatus::Running {
            if !pass.status.is_settled() {
                report.unsettled += 1;
            }
            return Ok(report);
        }
        if session.is_cancelled() {
            // Resume splits the area and creates the children
            info!(survey_id, "Cancelled before child surveys were created");
            session
                .store
                .set_survey_status(survey_id, SurveyStatus::Incomplete, None)
                .await?;
            report.unsettled += 1;
            return Ok(report);
        }

        let survey = session.store.survey(survey_id).await?;
        let (children, created) = spawn_children(session, &survey).await?;
        report.children_created += created;

        let pending: Vec<i64> = children
            .iter()
            .filter(|child| !child.status.is_settled())
            .map(|child| child.id)
            .collect();
        let outcomes: Vec<(i64, CrawlResult<TreeReport>)> = futures::stream::iter(pending)
            .map(move |child_id| async move { (child_id, run_survey_tree(session, child_id).await) })
            .buffer_unordered(session.config.survey_workers)
            .collect()
            .await;
        for (child_id, outcome) in outcomes {
            match outcome {
                Ok(child_report) => report.absorb(child_report),
                Err(err) => {
                    error!(survey_id = child_id, parent_survey_id = survey_id, error = %err, "Child survey aborted");
                }
            }
        }

        let status = settle_parent(session, survey_id).await?;
        if status != SurveyStatus::Complete {
            report.unsettled += 1;
        }
        Ok(report)
    }
    .boxed()
}

/// Child surveys of an overflowing survey: the ones already stored plus new
/// ones for split areas that have none yet. Returns all children and how
/// many were created.
async fn spawn_children(session: &CrawlSession, parent: &Survey) -> CrawlResult<(Vec<Survey>, usize)> {
    let area = session.store.geo_area(parent.geo_area_id).await?;
    let split = session.splitter.split(&area).await?;
    if split.is_empty() {
        warn!(survey_id = parent.id, area = %area.name, "Overflow cannot be split further, results are truncated");
    }
    let created = create_missing_children(session, parent, &split.areas).await?;
    let children = session.store.child_surveys(parent.id).await?;
    Ok((children, created))
}

/// One survey per area not yet covered by a survey of the same super survey
/// (or, outside a super survey, by a child of `parent`).
async fn create_missing_children(
    session: &CrawlSession,
    parent: &Survey,
    areas: &[GeoArea],
) -> CrawlResult<usize> {
    let existing = match parent.super_survey_id {
        Some(ss_id) => session.store.surveys_in_super_survey(ss_id).await?,
        None => session.store.child_surveys(parent.id).await?,
    };
    let covered: HashSet<i64> = existing.iter().map(|s| s.geo_area_id).collect();

    let mut created = 0;
    for area in areas.iter().filter(|a| !covered.contains(&a.id)) {
        let child = session
            .store
            .create_survey(NewSurvey {
                geo_area_id: area.id,
                super_survey_id: parent.super_survey_id,
                parent_survey_id: Some(parent.id),
            })
            .await?;
        info!(survey_id = child.id, parent_survey_id = parent.id, area = %area.name, "Child survey created");
        created += 1;
    }
    Ok(created)
}

/// Settle an overflowed parent from its children's statuses.
async fn settle_parent(session: &CrawlSession, survey_id: i64) -> CrawlResult<SurveyStatus> {
    let children = session.store.child_surveys(survey_id).await?;
    let settled = children.iter().all(|child| child.status.is_settled());
    let status = if settled && !session.is_cancelled() {
        SurveyStatus::Complete
    } else {
        SurveyStatus::Incomplete
    };
    let completed_at = (status == SurveyStatus::Complete).then(Utc::now);
    session
        .store
        .set_survey_status(survey_id, status, completed_at)
        .await?;
    info!(survey_id, children = children.len(), %status, "Parent survey settled");
    Ok(status)
}

/// Root area, super survey and root survey, then the whole tree. The root
/// area is geocoded by the first pass; if that fails the root survey fails.
pub async fn run_super_survey(session: &CrawlSession, root_area: &str) -> CrawlResult<(i64, TreeReport)> {
    let (area, _) = session.store.get_or_create_geo_area(root_area, None).await?;
    let super_survey = session.store.create_super_survey(&area.name).await?;
    let root = session
        .store
        .create_survey(NewSurvey {
            geo_area_id: area.id,
            super_survey_id: Some(super_survey.id),
            parent_survey_id: None,
        })
        .await?;
    info!(
        super_survey_id = super_survey.id,
        survey_id = root.id,
        area = %area.name,
        "Super survey started"
    );
    let report = run_survey_tree(session, root.id).await?;
    Ok((super_survey.id, report))
}

/// Re-run every pending or incomplete member, in ascending id order.
pub async fn resume_super_survey(session: &CrawlSession, super_survey_id: i64) -> CrawlResult<TreeReport> {
    session.store.super_survey(super_survey_id).await?;
    let members = session.store.surveys_in_super_survey(super_survey_id).await?;
    let mut report = TreeReport::default();

    for member in members {
        if session.is_cancelled() {
            info!(super_survey_id, "Resume cancelled");
            break;
        }
        // An earlier tree in this loop may already have run it
        let current = session.store.survey(member.id).await?;
        if !current.status.is_resumable() && current.status != SurveyStatus::Running {
            continue;
        }
        info!(super_survey_id, survey_id = current.id, status = %current.status, "Resuming survey");
        report.absorb(run_survey_tree(session, current.id).await?);
    }
    Ok(report)
}

/// Split the root area along `dimension` and survey the children that no
/// member of the super survey covers yet.
pub async fn continue_by(
    session: &CrawlSession,
    super_survey_id: i64,
    dimension: SplitDimension,
) -> CrawlResult<TreeReport> {
    session.store.super_survey(super_survey_id).await?;
    let members = session.store.surveys_in_super_survey(super_survey_id).await?;
    let root = members
        .iter()
        .find(|s| s.parent_survey_id.is_none())
        .cloned()
        .ok_or_else(|| CrawlError::fatal(format!("super survey {super_survey_id} has no root survey")))?;
    if session.is_cancelled() {
        info!(super_survey_id, "Cancelled before continuing");
        return Ok(TreeReport::default());
    }
    let area = session.store.geo_area(root.geo_area_id).await?;

    let children = session.splitter.split_along(&area, dimension).await?;
    let before: HashSet<i64> = members.iter().map(|s| s.id).collect();
    let created = create_missing_children(session, &root, &children).await?;
    info!(super_survey_id, %dimension, candidates = children.len(), created, "Continuing super survey");

    let fresh: Vec<i64> = session
        .store
        .surveys_in_super_survey(super_survey_id)
        .await?
        .into_iter()
        .filter(|s| !before.contains(&s.id))
        .map(|s| s.id)
        .collect();

    let mut report = TreeReport {
        children_created: created,
        ..TreeReport::default()
    };
    let outcomes: Vec<CrawlResult<TreeReport>> = futures::stream::iter(fresh)
        .map(|id| run_survey_tree(session, id))
        .buffer_unordered(session.config.survey_workers)
        .collect()
        .await;
    for outcome in outcomes {
        match outcome {
            Ok(child_report) => report.absorb(child_report),
            Err(err) => error!(super_survey_id, error = %err, "Survey aborted"),
        }
    }
    Ok(report)
}

/// Soft rollback: drop the survey's listings and progress, keep the row.
pub async fn delete_survey(session: &CrawlSession, survey_id: i64) -> CrawlResult<u64> {
    let removed = session.store.reset_survey(survey_id).await?;
    info!(survey_id, removed, "Survey reset to pending");
    Ok(removed)
}
