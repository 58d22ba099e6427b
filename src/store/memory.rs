//! In-memory storage implementation for testing and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{FillScope, Store};
use crate::error::{StoreError, StoreResult};
use crate::geo::{place_label, PartitionSource, SplitDimension};
use crate::models::{
    abbreviate, BoundingBox, GeoArea, Listing, ListingDetail, ListingKey, NewSurvey, SuperSurvey,
    Survey, SurveyStatus, UpsertOutcome,
};
use crate::scrapers::SearchRecord;

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    areas: BTreeMap<i64, GeoArea>,
    super_surveys: BTreeMap<i64, SuperSurvey>,
    surveys: BTreeMap<i64, Survey>,
    listings: HashMap<ListingKey, Listing>,
    partitions: HashMap<(String, SplitDimension), Vec<String>>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn survey_mut(&mut self, id: i64) -> StoreResult<&mut Survey> {
        self.surveys
            .get_mut(&id)
            .ok_or_else(|| StoreError::missing("survey", id))
    }

    fn listing_mut(&mut self, key: ListingKey) -> StoreResult<&mut Listing> {
        self.listings
            .get_mut(&key)
            .ok_or_else(|| StoreError::missing("listing", key.room_id))
    }

    fn surveys_where(&self, pred: impl Fn(&Survey) -> bool) -> Vec<Survey> {
        self.surveys.values().filter(|s| pred(s)).cloned().collect()
    }
}

/// In-memory store for areas, surveys and listings.
///
/// Data is lost when the process exits. Partition labels, which production
/// reads from reverse-geocoded locations, are seeded by hand.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the places known inside an area along one dimension.
    pub fn seed_partitions(&self, area_name: &str, dimension: SplitDimension, labels: &[&str]) {
        self.lock().partitions.insert(
            (place_label(area_name).to_string(), dimension),
            labels.iter().map(|l| l.to_string()).collect(),
        );
    }

    pub fn geo_area_count(&self) -> usize {
        self.lock().areas.len()
    }

    pub fn listing_count(&self) -> usize {
        self.lock().listings.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn geo_area(&self, id: i64) -> StoreResult<GeoArea> {
        self.lock()
            .areas
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::missing("geo area", id))
    }

    async fn geo_area_by_name(&self, name: &str) -> StoreResult<Option<GeoArea>> {
        Ok(self.lock().areas.values().find(|a| a.name == name).cloned())
    }

    async fn get_or_create_geo_area(
        &self,
        name: &str,
        bounding_box: Option<BoundingBox>,
    ) -> StoreResult<(GeoArea, bool)> {
        let mut state = self.lock();
        if let Some(existing) = state.areas.values().find(|a| a.name == name) {
            return Ok((existing.clone(), false));
        }
        let area = GeoArea {
            id: state.allocate_id(),
            name: name.to_string(),
            abbreviation: abbreviate(name),
            bounding_box,
        };
        state.areas.insert(area.id, area.clone());
        Ok((area, true))
    }

    async fn update_bounding_box(&self, id: i64, bounding_box: BoundingBox) -> StoreResult<()> {
        let mut state = self.lock();
        let area = state
            .areas
            .get_mut(&id)
            .ok_or_else(|| StoreError::missing("geo area", id))?;
        area.bounding_box = Some(bounding_box);
        Ok(())
    }

    async fn create_super_survey(&self, root_geo_area_name: &str) -> StoreResult<SuperSurvey> {
        let mut state = self.lock();
        let super_survey = SuperSurvey {
            id: state.allocate_id(),
            root_geo_area_name: root_geo_area_name.to_string(),
            created_at: Utc::now(),
        };
        state
            .super_surveys
            .insert(super_survey.id, super_survey.clone());
        Ok(super_survey)
    }

    async fn super_survey(&self, id: i64) -> StoreResult<SuperSurvey> {
        self.lock()
            .super_surveys
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::missing("super survey", id))
    }

    async fn create_survey(&self, new: NewSurvey) -> StoreResult<Survey> {
        let mut state = self.lock();
        if !state.areas.contains_key(&new.geo_area_id) {
            return Err(StoreError::missing("geo area", new.geo_area_id));
        }
        let survey = Survey {
            id: state.allocate_id(),
            geo_area_id: new.geo_area_id,
            super_survey_id: new.super_survey_id,
            parent_survey_id: new.parent_survey_id,
            created_at: Utc::now(),
            completed_at: None,
            status: SurveyStatus::Pending,
            page_cursor: 0,
            overflow: false,
        };
        state.surveys.insert(survey.id, survey.clone());
        Ok(survey)
    }

    async fn survey(&self, id: i64) -> StoreResult<Survey> {
        self.lock()
            .surveys
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::missing("survey", id))
    }

    async fn surveys(&self) -> StoreResult<Vec<Survey>> {
        Ok(self.lock().surveys_where(|_| true))
    }

    async fn surveys_in_super_survey(&self, super_survey_id: i64) -> StoreResult<Vec<Survey>> {
        Ok(self
            .lock()
            .surveys_where(|s| s.super_survey_id == Some(super_survey_id)))
    }

    async fn child_surveys(&self, parent_survey_id: i64) -> StoreResult<Vec<Survey>> {
        Ok(self
            .lock()
            .surveys_where(|s| s.parent_survey_id == Some(parent_survey_id)))
    }

    async fn surveys_for_area(&self, geo_area_id: i64) -> StoreResult<Vec<Survey>> {
        Ok(self.lock().surveys_where(|s| s.geo_area_id == geo_area_id))
    }

    async fn set_survey_status(
        &self,
        id: i64,
        status: SurveyStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let survey = state.survey_mut(id)?;
        survey.status = status;
        survey.completed_at = completed_at;
        Ok(())
    }

    async fn save_progress(&self, id: i64, page_cursor: u32, overflow: bool) -> StoreResult<()> {
        let mut state = self.lock();
        let survey = state.survey_mut(id)?;
        survey.page_cursor = page_cursor;
        survey.overflow = overflow;
        Ok(())
    }

    async fn reset_survey(&self, id: i64) -> StoreResult<u64> {
        let mut state = self.lock();
        let survey = state.survey_mut(id)?;
        survey.status = SurveyStatus::Pending;
        survey.completed_at = None;
        survey.page_cursor = 0;
        survey.overflow = false;

        let before = state.listings.len();
        state.listings.retain(|key, _| key.survey_id != id);
        Ok((before - state.listings.len()) as u64)
    }

    async fn upsert_listing(
        &self,
        survey_id: i64,
        geo_area_name: &str,
        record: &SearchRecord,
    ) -> StoreResult<UpsertOutcome> {
        let mut state = self.lock();
        let key = ListingKey {
            room_id: record.room_id,
            survey_id,
        };
        let now = Utc::now();
        if let Some(existing) = state.listings.get_mut(&key) {
            if existing.deleted {
                return Ok(UpsertOutcome::Tombstoned);
            }
            existing.latitude = record.latitude;
            existing.longitude = record.longitude;
            existing.last_modified = now;
            return Ok(UpsertOutcome::Updated);
        }
        state.listings.insert(
            key,
            Listing {
                room_id: record.room_id,
                survey_id,
                geo_area_name: geo_area_name.to_string(),
                latitude: record.latitude,
                longitude: record.longitude,
                detail_fetched: false,
                deleted: false,
                last_modified: now,
                detail: None,
            },
        );
        Ok(UpsertOutcome::Inserted)
    }

    async fn listings_for_survey(&self, survey_id: i64) -> StoreResult<Vec<Listing>> {
        let mut listings: Vec<Listing> = self
            .lock()
            .listings
            .values()
            .filter(|l| l.survey_id == survey_id)
            .cloned()
            .collect();
        listings.sort_by_key(|l| l.room_id);
        Ok(listings)
    }

    async fn listings_for_room(&self, room_id: i64) -> StoreResult<Vec<Listing>> {
        let mut listings: Vec<Listing> = self
            .lock()
            .listings
            .values()
            .filter(|l| l.room_id == room_id)
            .cloned()
            .collect();
        listings.sort_by_key(|l| l.survey_id);
        Ok(listings)
    }

    async fn next_listing_to_fill(
        &self,
        scope: FillScope,
        exclude: &[i64],
    ) -> StoreResult<Option<Listing>> {
        let state = self.lock();
        let candidates: Vec<&Listing> = state
            .listings
            .values()
            .filter(|l| l.needs_fill() && !exclude.contains(&l.room_id))
            .filter(|l| match scope {
                FillScope::Global => true,
                FillScope::Survey(id) => l.survey_id == id,
            })
            .collect();
        Ok(candidates
            .choose(&mut rand::thread_rng())
            .map(|l| (*l).clone()))
    }

    async fn save_detail(&self, key: ListingKey, detail: &ListingDetail) -> StoreResult<()> {
        let mut state = self.lock();
        let listing = state.listing_mut(key)?;
        if listing.deleted {
            return Ok(());
        }
        listing.detail = Some(detail.clone());
        listing.detail_fetched = true;
        listing.last_modified = Utc::now();
        Ok(())
    }

    async fn mark_deleted(&self, room_id: i64) -> StoreResult<u64> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut marked = 0;
        for listing in state
            .listings
            .values_mut()
            .filter(|l| l.room_id == room_id && !l.deleted)
        {
            listing.deleted = true;
            listing.last_modified = now;
            marked += 1;
        }
        Ok(marked)
    }

    async fn prune_duplicate_listings(&self, super_survey_id: i64) -> StoreResult<u64> {
        let mut state = self.lock();
        let members: Vec<i64> = state
            .surveys_where(|s| s.super_survey_id == Some(super_survey_id))
            .iter()
            .map(|s| s.id)
            .collect();

        // Newest row per room wins; ties go to the later survey
        let mut newest: HashMap<i64, (DateTime<Utc>, i64)> = HashMap::new();
        for listing in state.listings.values() {
            if !members.contains(&listing.survey_id) {
                continue;
            }
            let candidate = (listing.last_modified, listing.survey_id);
            newest
                .entry(listing.room_id)
                .and_modify(|best| {
                    if candidate > *best {
                        *best = candidate;
                    }
                })
                .or_insert(candidate);
        }

        let before = state.listings.len();
        state.listings.retain(|key, _| {
            !members.contains(&key.survey_id)
                || newest
                    .get(&key.room_id)
                    .map_or(true, |(_, survey_id)| *survey_id == key.survey_id)
        });
        Ok((before - state.listings.len()) as u64)
    }
}

#[async_trait]
impl PartitionSource for MemoryStore {
    async fn partition_labels(
        &self,
        area: &GeoArea,
        dimension: SplitDimension,
    ) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()
            .partitions
            .get(&(place_label(&area.name).to_string(), dimension))
            .cloned()
            .unwrap_or_default())
    }
}
