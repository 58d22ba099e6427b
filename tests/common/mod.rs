//! Shared test helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use listing_scout::crawl::ProxySource;
use listing_scout::error::{CrawlError, CrawlResult, TransientKind};
use listing_scout::geo::Geocoder;
use listing_scout::models::{BoundingBox, ListingDetail};
use listing_scout::scrapers::{EgressIdentity, ListingScraper, SearchPage, SearchRecord};
use listing_scout::store::MemoryStore;
use listing_scout::{Collaborators, Config, CrawlSession};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

pub fn bbox(north: f64, south: f64, east: f64, west: f64) -> BoundingBox {
    BoundingBox::new(north, south, east, west).expect("valid test box")
}

/// `count` distinct records with room ids starting at `first`
pub fn records(first: i64, count: i64) -> Vec<SearchRecord> {
    (first..first + count)
        .map(|room_id| SearchRecord {
            room_id,
            latitude: 1.0,
            longitude: 1.0,
        })
        .collect()
}

pub fn page(records: Vec<SearchRecord>, has_more: bool) -> SearchPage {
    SearchPage {
        total_results: None,
        has_more,
        overflow: false,
        records,
    }
}

/// Scripted reply to a detail request
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Transient(TransientKind),
    NotFound,
}

/// Marketplace stand-in: search pages scripted per box, detail replies
/// scripted per room (anything unscripted succeeds).
#[derive(Default)]
pub struct ScriptedScraper {
    pages: Mutex<Vec<(BoundingBox, Vec<SearchPage>)>>,
    page_failures: Mutex<HashMap<u32, usize>>,
    details: Mutex<HashMap<i64, VecDeque<Reply>>>,
    search_calls: AtomicUsize,
    page_fetches: Mutex<HashMap<u32, usize>>,
    detail_egress: Mutex<Vec<EgressIdentity>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    cancel_after_details: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedScraper {
    pub fn with_area(self, bounding_box: BoundingBox, pages: Vec<SearchPage>) -> Self {
        lock(&self.pages).push((bounding_box, pages));
        self
    }

    /// Fail the next `times` requests for page `page` (of any box) transiently.
    pub fn fail_page(self, page: u32, times: usize) -> Self {
        lock(&self.page_failures).insert(page, times);
        self
    }

    pub fn with_detail_replies(self, room_id: i64, replies: Vec<Reply>) -> Self {
        lock(&self.details).insert(room_id, replies.into());
        self
    }

    /// Cancel `token` once `calls` search requests have been answered.
    pub fn cancel_after(&self, calls: usize, token: CancellationToken) {
        *lock(&self.cancel_after) = Some((calls, token));
    }

    /// Cancel `token` once `calls` detail requests have been answered.
    pub fn cancel_after_details(&self, calls: usize, token: CancellationToken) {
        *lock(&self.cancel_after_details) = Some((calls, token));
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// How often page `page` was requested, across all boxes
    pub fn fetches_of_page(&self, page: u32) -> usize {
        lock(&self.page_fetches).get(&page).copied().unwrap_or(0)
    }

    pub fn detail_egress(&self) -> Vec<EgressIdentity> {
        lock(&self.detail_egress).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("test mutex poisoned")
}

#[async_trait]
impl ListingScraper for ScriptedScraper {
    async fn search_by_bounding_box(
        &self,
        bounding_box: &BoundingBox,
        page: u32,
        _egress: &EgressIdentity,
    ) -> CrawlResult<SearchPage> {
        *lock(&self.page_fetches).entry(page).or_default() += 1;
        if let Some(remaining) = lock(&self.page_failures).get_mut(&page) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CrawlError::transient(TransientKind::Connection, "connection reset"));
            }
        }

        let result = lock(&self.pages)
            .iter()
            .find(|(b, _)| b == bounding_box)
            .map(|(_, pages)| pages.get(page as usize).cloned().unwrap_or_default())
            .unwrap_or_default();

        let calls = self.search_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = lock(&self.cancel_after).as_ref() {
            if calls >= *after {
                token.cancel();
            }
        }
        Ok(result)
    }

    async fn fetch_detail(
        &self,
        room_id: i64,
        egress: &EgressIdentity,
    ) -> CrawlResult<ListingDetail> {
        let calls = {
            let mut egress_log = lock(&self.detail_egress);
            egress_log.push(egress.clone());
            egress_log.len()
        };
        if let Some((after, token)) = lock(&self.cancel_after_details).as_ref() {
            if calls >= *after {
                token.cancel();
            }
        }
        let reply = lock(&self.details)
            .get_mut(&room_id)
            .and_then(|replies| replies.pop_front());
        match reply {
            Some(Reply::Transient(kind)) => Err(CrawlError::transient(kind, "scripted failure")),
            Some(Reply::NotFound) => Err(CrawlError::NotFound(format!("room {room_id}"))),
            None => Ok(ListingDetail {
                name: Some(format!("Room {room_id}")),
                room_type: Some("Entire home/apt".into()),
                reviews: Some(3),
                ..ListingDetail::default()
            }),
        }
    }

    fn source_name(&self) -> &'static str {
        "Scripted"
    }
}

#[derive(Default)]
pub struct StaticGeocoder {
    boxes: HashMap<String, BoundingBox>,
}

impl StaticGeocoder {
    pub fn with(mut self, place: &str, bounding_box: BoundingBox) -> Self {
        self.boxes.insert(place.to_string(), bounding_box);
        self
    }
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn bounding_box(&self, place: &str) -> CrawlResult<BoundingBox> {
        self.boxes
            .get(place)
            .copied()
            .ok_or_else(|| CrawlError::NotFound(format!("place '{place}'")))
    }
}

/// Fixed proxy list that counts how often it is (re)loaded
pub struct CountingProxies {
    pub loads: AtomicUsize,
    proxies: Vec<String>,
}

impl CountingProxies {
    pub fn new(proxies: &[&str]) -> Self {
        Self {
            loads: AtomicUsize::new(0),
            proxies: proxies.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxySource for CountingProxies {
    async fn load(&self) -> Vec<String> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.proxies.clone()
    }
}

/// Small timings so cooldowns and sleeps don't slow the suite down
pub fn test_config() -> Config {
    Config {
        re_init_sleep: Duration::from_millis(20),
        request_timeout: Duration::from_secs(2),
        request_sleep: Duration::ZERO,
        survey_workers: 2,
        fill_workers: 1,
        ..Config::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub scraper: Arc<ScriptedScraper>,
    pub geocoder: Arc<StaticGeocoder>,
    pub proxies: Arc<dyn ProxySource>,
    pub config: Config,
}

impl Harness {
    pub fn new(scraper: ScriptedScraper, geocoder: StaticGeocoder) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            scraper: Arc::new(scraper),
            geocoder: Arc::new(geocoder),
            proxies: Arc::new(CountingProxies::new(&[])),
            config: test_config(),
        }
    }

    /// A fresh session over the same store and adapters
    pub async fn session(&self, cancel: CancellationToken) -> CrawlSession {
        let parts = Collaborators {
            store: self.store.clone(),
            partitions: self.store.clone(),
            scraper: self.scraper.clone(),
            geocoder: self.geocoder.clone(),
            proxies: self.proxies.clone(),
        };
        CrawlSession::new(self.config.clone(), parts, cancel).await
    }
}
