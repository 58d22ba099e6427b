//! Persistence seam for areas, surveys and listings.
//!
//! [`MemoryStore`] backs tests and `--memory` dry runs, [`PgStore`] is the
//! production PostgreSQL backend. Both honour the same rules: areas are
//! unique by name, listing upserts are idempotent per `(room_id, survey_id)`,
//! and a deleted listing is never resurrected.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::models::{
    BoundingBox, GeoArea, Listing, ListingDetail, ListingKey, NewSurvey, SuperSurvey, Survey,
    SurveyStatus, UpsertOutcome,
};
use crate::scrapers::SearchRecord;

/// Which listings a fill pass draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillScope {
    Global,
    Survey(i64),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Round-trip to the backend.
    async fn ping(&self) -> StoreResult<()>;

    async fn geo_area(&self, id: i64) -> StoreResult<GeoArea>;

    async fn geo_area_by_name(&self, name: &str) -> StoreResult<Option<GeoArea>>;

    /// Insert an area, or return the existing one with the same name
    /// untouched. The flag is `true` when a row was created.
    async fn get_or_create_geo_area(
        &self,
        name: &str,
        bounding_box: Option<BoundingBox>,
    ) -> StoreResult<(GeoArea, bool)>;

    async fn update_bounding_box(&self, id: i64, bounding_box: BoundingBox) -> StoreResult<()>;

    async fn create_super_survey(&self, root_geo_area_name: &str) -> StoreResult<SuperSurvey>;

    async fn super_survey(&self, id: i64) -> StoreResult<SuperSurvey>;

    async fn create_survey(&self, new: NewSurvey) -> StoreResult<Survey>;

    async fn survey(&self, id: i64) -> StoreResult<Survey>;

    /// All surveys, ascending id.
    async fn surveys(&self) -> StoreResult<Vec<Survey>>;

    /// Members of a super survey, ascending id.
    async fn surveys_in_super_survey(&self, super_survey_id: i64) -> StoreResult<Vec<Survey>>;

    /// Surveys spawned by a parent's overflow, ascending id.
    async fn child_surveys(&self, parent_survey_id: i64) -> StoreResult<Vec<Survey>>;

    async fn surveys_for_area(&self, geo_area_id: i64) -> StoreResult<Vec<Survey>>;

    async fn set_survey_status(
        &self,
        id: i64,
        status: SurveyStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Persist the resume point of a survey.
    async fn save_progress(&self, id: i64, page_cursor: u32, overflow: bool) -> StoreResult<()>;

    /// Drop a survey's listings and progress and set it back to pending.
    /// Returns the number of listings removed.
    async fn reset_survey(&self, id: i64) -> StoreResult<u64>;

    /// Insert-or-update a listing stub for one survey.
    async fn upsert_listing(
        &self,
        survey_id: i64,
        geo_area_name: &str,
        record: &SearchRecord,
    ) -> StoreResult<UpsertOutcome>;

    async fn listings_for_survey(&self, survey_id: i64) -> StoreResult<Vec<Listing>>;

    /// Every stored row for a room, one per survey that saw it.
    async fn listings_for_room(&self, room_id: i64) -> StoreResult<Vec<Listing>>;

    /// A random listing that still needs detail, skipping `exclude` room ids.
    async fn next_listing_to_fill(
        &self,
        scope: FillScope,
        exclude: &[i64],
    ) -> StoreResult<Option<Listing>>;

    async fn save_detail(&self, key: ListingKey, detail: &ListingDetail) -> StoreResult<()>;

    /// Tombstone every stored row of a room, whichever survey found it.
    /// Returns the number of rows newly marked.
    async fn mark_deleted(&self, room_id: i64) -> StoreResult<u64>;

    /// Within one super survey, remove rows whose room also has a more
    /// recently modified row. Returns the number removed.
    async fn prune_duplicate_listings(&self, super_survey_id: i64) -> StoreResult<u64>;
}
