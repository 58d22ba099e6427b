//! PostgreSQL backend.
//!
//! The listing upsert is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE
//! NOT deleted`, so retries and re-fetched pages can never duplicate a row or
//! revive a deleted one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;

use super::{FillScope, Store};
use crate::error::{StoreError, StoreResult};
use crate::geo::{place_label, PartitionSource, SplitDimension};
use crate::models::{
    abbreviate, BoundingBox, GeoArea, Listing, ListingDetail, ListingKey, NewSurvey, SuperSurvey,
    Survey, SurveyStatus, UpsertOutcome,
};
use crate::scrapers::SearchRecord;

const SCHEMA: &str = include_str!("schema.sql");

const SURVEY_COLUMNS: &str = "id, geo_area_id, super_survey_id, parent_survey_id, created_at, \
                              completed_at, status, page_cursor, overflow";
const LISTING_COLUMNS: &str = "room_id, survey_id, geo_area_name, latitude, longitude, \
                               detail_fetched, deleted, last_modified, detail";

#[derive(sqlx::FromRow)]
struct GeoAreaRow {
    id: i64,
    name: String,
    abbreviation: String,
    bb_n_lat: Option<f64>,
    bb_s_lat: Option<f64>,
    bb_e_lng: Option<f64>,
    bb_w_lng: Option<f64>,
}

impl From<GeoAreaRow> for GeoArea {
    fn from(row: GeoAreaRow) -> Self {
        let bounding_box = match (row.bb_n_lat, row.bb_s_lat, row.bb_e_lng, row.bb_w_lng) {
            (Some(n), Some(s), Some(e), Some(w)) => BoundingBox::new(n, s, e, w),
            _ => None,
        };
        GeoArea {
            id: row.id,
            name: row.name,
            abbreviation: row.abbreviation,
            bounding_box,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SurveyRow {
    id: i64,
    geo_area_id: i64,
    super_survey_id: Option<i64>,
    parent_survey_id: Option<i64>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    status: String,
    page_cursor: i32,
    overflow: bool,
}

impl TryFrom<SurveyRow> for Survey {
    type Error = StoreError;

    fn try_from(row: SurveyRow) -> StoreResult<Self> {
        let corrupt = |reason: String| StoreError::Corrupt {
            entity: "survey",
            reason,
        };
        Ok(Survey {
            id: row.id,
            geo_area_id: row.geo_area_id,
            super_survey_id: row.super_survey_id,
            parent_survey_id: row.parent_survey_id,
            created_at: row.created_at,
            completed_at: row.completed_at,
            status: row.status.parse().map_err(corrupt)?,
            page_cursor: u32::try_from(row.page_cursor)
                .map_err(|_| corrupt(format!("negative page cursor {}", row.page_cursor)))?,
            overflow: row.overflow,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SuperSurveyRow {
    id: i64,
    root_geo_area_name: String,
    created_at: DateTime<Utc>,
}

impl From<SuperSurveyRow> for SuperSurvey {
    fn from(row: SuperSurveyRow) -> Self {
        SuperSurvey {
            id: row.id,
            root_geo_area_name: row.root_geo_area_name,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ListingRow {
    room_id: i64,
    survey_id: i64,
    geo_area_name: String,
    latitude: f64,
    longitude: f64,
    detail_fetched: bool,
    deleted: bool,
    last_modified: DateTime<Utc>,
    detail: Option<Json<ListingDetail>>,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            room_id: row.room_id,
            survey_id: row.survey_id,
            geo_area_name: row.geo_area_name,
            latitude: row.latitude,
            longitude: row.longitude,
            detail_fetched: row.detail_fetched,
            deleted: row.deleted,
            last_modified: row.last_modified,
            detail: row.detail.map(|Json(detail)| detail),
        }
    }
}

fn surveys_from(rows: Vec<SurveyRow>) -> StoreResult<Vec<Survey>> {
    rows.into_iter().map(Survey::try_from).collect()
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create missing tables and indexes.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn surveys_by(&self, filter: &str, value: i64) -> StoreResult<Vec<Survey>> {
        let sql = format!("SELECT {SURVEY_COLUMNS} FROM survey WHERE {filter} = $1 ORDER BY id");
        let rows: Vec<SurveyRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;
        surveys_from(rows)
    }

    async fn listings_by(&self, filter: &str, value: i64, order: &str) -> StoreResult<Vec<Listing>> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listing WHERE {filter} = $1 ORDER BY {order}"
        );
        let rows: Vec<ListingRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn geo_area(&self, id: i64) -> StoreResult<GeoArea> {
        let row: Option<GeoAreaRow> = sqlx::query_as("SELECT * FROM geo_area WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(GeoArea::from)
            .ok_or_else(|| StoreError::missing("geo area", id))
    }

    async fn geo_area_by_name(&self, name: &str) -> StoreResult<Option<GeoArea>> {
        let row: Option<GeoAreaRow> = sqlx::query_as("SELECT * FROM geo_area WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(GeoArea::from))
    }

    async fn get_or_create_geo_area(
        &self,
        name: &str,
        bounding_box: Option<BoundingBox>,
    ) -> StoreResult<(GeoArea, bool)> {
        let inserted: Option<GeoAreaRow> = sqlx::query_as(
            "INSERT INTO geo_area (name, abbreviation, bb_n_lat, bb_s_lat, bb_e_lng, bb_w_lng)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (name) DO NOTHING
             RETURNING *",
        )
        .bind(name)
        .bind(abbreviate(name))
        .bind(bounding_box.map(|b| b.north))
        .bind(bounding_box.map(|b| b.south))
        .bind(bounding_box.map(|b| b.east))
        .bind(bounding_box.map(|b| b.west))
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok((row.into(), true)),
            None => self
                .geo_area_by_name(name)
                .await?
                .map(|area| (area, false))
                .ok_or_else(|| StoreError::missing("geo area", name)),
        }
    }

    async fn update_bounding_box(&self, id: i64, bounding_box: BoundingBox) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE geo_area SET bb_n_lat = $2, bb_s_lat = $3, bb_e_lng = $4, bb_w_lng = $5
             WHERE id = $1",
        )
        .bind(id)
        .bind(bounding_box.north)
        .bind(bounding_box.south)
        .bind(bounding_box.east)
        .bind(bounding_box.west)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::missing("geo area", id));
        }
        Ok(())
    }

    async fn create_super_survey(&self, root_geo_area_name: &str) -> StoreResult<SuperSurvey> {
        let row: SuperSurveyRow = sqlx::query_as(
            "INSERT INTO super_survey (root_geo_area_name) VALUES ($1) RETURNING *",
        )
        .bind(root_geo_area_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn super_survey(&self, id: i64) -> StoreResult<SuperSurvey> {
        let row: Option<SuperSurveyRow> =
            sqlx::query_as("SELECT * FROM super_survey WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(SuperSurvey::from)
            .ok_or_else(|| StoreError::missing("super survey", id))
    }

    async fn create_survey(&self, new: NewSurvey) -> StoreResult<Survey> {
        let sql = format!(
            "INSERT INTO survey (geo_area_id, super_survey_id, parent_survey_id)
             VALUES ($1, $2, $3) RETURNING {SURVEY_COLUMNS}"
        );
        let row: SurveyRow = sqlx::query_as(&sql)
            .bind(new.geo_area_id)
            .bind(new.super_survey_id)
            .bind(new.parent_survey_id)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn survey(&self, id: i64) -> StoreResult<Survey> {
        self.surveys_by("id", id)
            .await?
            .pop()
            .ok_or_else(|| StoreError::missing("survey", id))
    }

    async fn surveys(&self) -> StoreResult<Vec<Survey>> {
        let sql = format!("SELECT {SURVEY_COLUMNS} FROM survey ORDER BY id");
        let rows: Vec<SurveyRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        surveys_from(rows)
    }

    async fn surveys_in_super_survey(&self, super_survey_id: i64) -> StoreResult<Vec<Survey>> {
        self.surveys_by("super_survey_id", super_survey_id).await
    }

    async fn child_surveys(&self, parent_survey_id: i64) -> StoreResult<Vec<Survey>> {
        self.surveys_by("parent_survey_id", parent_survey_id).await
    }

    async fn surveys_for_area(&self, geo_area_id: i64) -> StoreResult<Vec<Survey>> {
        self.surveys_by("geo_area_id", geo_area_id).await
    }

    async fn set_survey_status(
        &self,
        id: i64,
        status: SurveyStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE survey SET status = $2, completed_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(completed_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::missing("survey", id));
        }
        Ok(())
    }

    async fn save_progress(&self, id: i64, page_cursor: u32, overflow: bool) -> StoreResult<()> {
        let cursor = i32::try_from(page_cursor).map_err(|_| StoreError::Corrupt {
            entity: "survey",
            reason: format!("page cursor {page_cursor} out of range"),
        })?;
        sqlx::query("UPDATE survey SET page_cursor = $2, overflow = $3 WHERE id = $1")
            .bind(id)
            .bind(cursor)
            .bind(overflow)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_survey(&self, id: i64) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM listing WHERE survey_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let updated = sqlx::query(
            "UPDATE survey
             SET status = 'pending', completed_at = NULL, page_cursor = 0, overflow = FALSE
             WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::missing("survey", id));
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn upsert_listing(
        &self,
        survey_id: i64,
        geo_area_name: &str,
        record: &SearchRecord,
    ) -> StoreResult<UpsertOutcome> {
        // xmax is zero only on rows this statement inserted
        let inserted: Option<bool> = sqlx::query_scalar(
            "INSERT INTO listing (room_id, survey_id, geo_area_name, latitude, longitude)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (room_id, survey_id) DO UPDATE
                 SET latitude = EXCLUDED.latitude,
                     longitude = EXCLUDED.longitude,
                     last_modified = now()
                 WHERE NOT listing.deleted
             RETURNING (xmax = 0)",
        )
        .bind(record.room_id)
        .bind(survey_id)
        .bind(geo_area_name)
        .bind(record.latitude)
        .bind(record.longitude)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some(true) => UpsertOutcome::Inserted,
            Some(false) => UpsertOutcome::Updated,
            None => UpsertOutcome::Tombstoned,
        })
    }

    async fn listings_for_survey(&self, survey_id: i64) -> StoreResult<Vec<Listing>> {
        self.listings_by("survey_id", survey_id, "room_id").await
    }

    async fn listings_for_room(&self, room_id: i64) -> StoreResult<Vec<Listing>> {
        self.listings_by("room_id", room_id, "survey_id").await
    }

    async fn next_listing_to_fill(
        &self,
        scope: FillScope,
        exclude: &[i64],
    ) -> StoreResult<Option<Listing>> {
        let survey_id = match scope {
            FillScope::Global => None,
            FillScope::Survey(id) => Some(id),
        };
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listing
             WHERE NOT detail_fetched AND NOT deleted
               AND ($1::BIGINT IS NULL OR survey_id = $1)
               AND NOT (room_id = ANY($2))
             ORDER BY random()
             LIMIT 1"
        );
        let row: Option<ListingRow> = sqlx::query_as(&sql)
            .bind(survey_id)
            .bind(exclude.to_vec())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Listing::from))
    }

    async fn save_detail(&self, key: ListingKey, detail: &ListingDetail) -> StoreResult<()> {
        sqlx::query(
            "UPDATE listing
             SET detail = $3, detail_fetched = TRUE, last_modified = now()
             WHERE room_id = $1 AND survey_id = $2 AND NOT deleted",
        )
        .bind(key.room_id)
        .bind(key.survey_id)
        .bind(Json(detail))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_deleted(&self, room_id: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE listing SET deleted = TRUE, last_modified = now()
             WHERE room_id = $1 AND NOT deleted",
        )
        .bind(room_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn prune_duplicate_listings(&self, super_survey_id: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM listing l
             USING survey s, listing newer, survey ns
             WHERE l.survey_id = s.id AND s.super_survey_id = $1
               AND newer.survey_id = ns.id AND ns.super_survey_id = $1
               AND newer.room_id = l.room_id
               AND (newer.last_modified, newer.survey_id) > (l.last_modified, l.survey_id)",
        )
        .bind(super_survey_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PartitionSource for PgStore {
    async fn partition_labels(
        &self,
        area: &GeoArea,
        dimension: SplitDimension,
    ) -> StoreResult<Vec<String>> {
        let sql = match dimension {
            SplitDimension::Sublocality => {
                "SELECT DISTINCT sublocality FROM location
                 WHERE locality = $1 AND sublocality IS NOT NULL
                 ORDER BY 1"
            }
            SplitDimension::Route => {
                "SELECT DISTINCT route FROM location
                 WHERE (sublocality = $1 OR locality = $1) AND route IS NOT NULL
                 ORDER BY 1"
            }
        };
        let labels: Vec<String> = sqlx::query_scalar(sql)
            .bind(place_label(&area.name))
            .fetch_all(&self.pool)
            .await?;
        Ok(labels)
    }
}
