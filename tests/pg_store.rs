//! PostgreSQL store tests. Skipped unless TEST_DATABASE_URL points at a
//! scratch database; every test truncates the tables it uses.

mod common;

use listing_scout::geo::{PartitionSource, SplitDimension};
use listing_scout::models::{ListingDetail, NewSurvey, SurveyStatus, UpsertOutcome};
use listing_scout::scrapers::SearchRecord;
use listing_scout::store::{FillScope, PgStore, Store};
use tokio::sync::Mutex;

macro_rules! require_db {
    () => {
        if !common::has_test_db() {
            eprintln!("Skipping: TEST_DATABASE_URL not set");
            return;
        }
    };
}

// Tests share one database
static DB_LOCK: Mutex<()> = Mutex::const_new(());

async fn setup() -> PgStore {
    let store = PgStore::connect(&common::test_db_url())
        .await
        .expect("Failed to connect to test database");
    store.ensure_schema().await.unwrap();
    sqlx::raw_sql("TRUNCATE TABLE listing, survey, super_survey, geo_area, location RESTART IDENTITY CASCADE")
        .execute(store.pool())
        .await
        .unwrap();
    store
}

fn record(room_id: i64) -> SearchRecord {
    SearchRecord {
        room_id,
        latitude: 41.15,
        longitude: -8.61,
    }
}

async fn new_survey(store: &PgStore, super_survey_id: Option<i64>) -> i64 {
    let (area, _) = store
        .get_or_create_geo_area("Porto", Some(common::bbox(41.2, 41.1, -8.5, -8.7)))
        .await
        .unwrap();
    store
        .create_survey(NewSurvey {
            geo_area_id: area.id,
            super_survey_id,
            parent_survey_id: None,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn geo_areas_are_unique_by_name_and_abbreviated() {
    require_db!();
    let _guard = DB_LOCK.lock().await;
    let store = setup().await;

    let (first, created) = store.get_or_create_geo_area("Vila Nova de Gaia", None).await.unwrap();
    let (second, created_again) = store
        .get_or_create_geo_area("Vila Nova de Gaia", Some(common::bbox(1.0, 0.0, 1.0, 0.0)))
        .await
        .unwrap();

    assert!(created);
    assert!(!created_again);
    assert_eq!(first.id, second.id);
    assert_eq!(second.abbreviation, "vila_nova");
    assert!(second.bounding_box.is_none());
}

#[tokio::test]
async fn listing_upsert_is_idempotent_and_respects_tombstones() {
    require_db!();
    let _guard = DB_LOCK.lock().await;
    let store = setup().await;
    let survey_id = new_survey(&store, None).await;

    assert_eq!(
        store.upsert_listing(survey_id, "Porto", &record(1)).await.unwrap(),
        UpsertOutcome::Inserted
    );
    assert_eq!(
        store.upsert_listing(survey_id, "Porto", &record(1)).await.unwrap(),
        UpsertOutcome::Updated
    );
    assert_eq!(store.mark_deleted(1).await.unwrap(), 1);
    assert_eq!(
        store.upsert_listing(survey_id, "Porto", &record(1)).await.unwrap(),
        UpsertOutcome::Tombstoned
    );

    let rows = store.listings_for_room(1).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].deleted);
}

#[tokio::test]
async fn survey_progress_status_and_reset_round_trip() {
    require_db!();
    let _guard = DB_LOCK.lock().await;
    let store = setup().await;
    let survey_id = new_survey(&store, None).await;
    store.upsert_listing(survey_id, "Porto", &record(1)).await.unwrap();
    store.upsert_listing(survey_id, "Porto", &record(2)).await.unwrap();

    store.set_survey_status(survey_id, SurveyStatus::Running, None).await.unwrap();
    store.save_progress(survey_id, 4, true).await.unwrap();
    let running = store.survey(survey_id).await.unwrap();
    assert_eq!(running.status, SurveyStatus::Running);
    assert_eq!(running.page_cursor, 4);
    assert!(running.overflow);

    let removed = store.reset_survey(survey_id).await.unwrap();
    let reset = store.survey(survey_id).await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(reset.status, SurveyStatus::Pending);
    assert_eq!(reset.page_cursor, 0);
    assert!(!reset.overflow);
}

#[tokio::test]
async fn fill_selection_skips_filled_and_excluded_rooms() {
    require_db!();
    let _guard = DB_LOCK.lock().await;
    let store = setup().await;
    let survey_id = new_survey(&store, None).await;
    for room_id in 1..=3 {
        store.upsert_listing(survey_id, "Porto", &record(room_id)).await.unwrap();
    }
    let detail = ListingDetail {
        name: Some("Casa da Ribeira".into()),
        ..ListingDetail::default()
    };
    let first = store.listings_for_room(1).await.unwrap()[0].key();
    store.save_detail(first, &detail).await.unwrap();

    let next = store
        .next_listing_to_fill(FillScope::Survey(survey_id), &[2])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.room_id, 3);

    let filled = &store.listings_for_room(1).await.unwrap()[0];
    assert!(filled.detail_fetched);
    assert_eq!(filled.detail.as_ref(), Some(&detail));
    assert!(store
        .next_listing_to_fill(FillScope::Global, &[2, 3])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn pruning_keeps_the_newest_row_of_each_room() {
    require_db!();
    let _guard = DB_LOCK.lock().await;
    let store = setup().await;
    let super_survey = store.create_super_survey("Porto").await.unwrap();
    let older = new_survey(&store, Some(super_survey.id)).await;
    let newer = new_survey(&store, Some(super_survey.id)).await;
    store.upsert_listing(older, "Porto", &record(1)).await.unwrap();
    store.upsert_listing(older, "Porto", &record(2)).await.unwrap();
    store.upsert_listing(newer, "Porto", &record(1)).await.unwrap();

    let removed = store.prune_duplicate_listings(super_survey.id).await.unwrap();

    assert_eq!(removed, 1);
    let rows = store.listings_for_room(1).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].survey_id, newer);
    assert_eq!(store.listings_for_room(2).await.unwrap().len(), 1);
}

#[tokio::test]
async fn partitions_come_from_reverse_geocoded_locations() {
    require_db!();
    let _guard = DB_LOCK.lock().await;
    let store = setup().await;
    sqlx::raw_sql(
        "INSERT INTO location (route, sublocality, locality) VALUES
           ('Rua das Flores', 'Cedofeita', 'Porto'),
           ('Rua de Ceuta', 'Cedofeita', 'Porto'),
           ('Avenida da Boavista', 'Lordelo do Ouro', 'Porto'),
           (NULL, 'Campanha', 'Porto')",
    )
    .execute(store.pool())
    .await
    .unwrap();
    let (porto, _) = store.get_or_create_geo_area("Porto", None).await.unwrap();
    let (cedofeita, _) = store.get_or_create_geo_area("Cedofeita, Porto", None).await.unwrap();

    let sublocalities = store
        .partition_labels(&porto, SplitDimension::Sublocality)
        .await
        .unwrap();
    let routes = store
        .partition_labels(&cedofeita, SplitDimension::Route)
        .await
        .unwrap();

    assert_eq!(sublocalities, vec!["Campanha", "Cedofeita", "Lordelo do Ouro"]);
    assert_eq!(routes, vec!["Rua das Flores", "Rua de Ceuta"]);
}
