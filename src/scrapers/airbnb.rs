use crate::error::{CrawlError, CrawlResult, TransientKind};
use crate::models::{BoundingBox, ListingDetail};
use crate::scrapers::traits::ListingScraper;
use crate::scrapers::types::{EgressIdentity, SearchPage, SearchRecord};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

const SEARCH_URL: &str = "https://www.airbnb.com/api/v2/explore_tabs";
const ROOM_URL: &str = "https://www.airbnb.com/rooms/";

/// Listings per map search page
pub const ITEMS_PER_PAGE: u32 = 18;

/// The map search never returns more than this many results for one box
pub const RESULT_CAP: u32 = 300;

/// Airbnb map search and room page scraper
pub struct AirbnbScraper {
    api_key: Option<String>,
    user_agent: String,
    timeout: Duration,
    clients: Mutex<HashMap<EgressIdentity, Client>>,
}

impl AirbnbScraper {
    pub fn new(api_key: Option<String>, user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_key,
            user_agent: user_agent.into(),
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// HTTP client bound to one egress identity, built on first use
    fn client_for(&self, egress: &EgressIdentity) -> CrawlResult<Client> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| CrawlError::fatal("scraper client cache poisoned"))?;
        if let Some(client) = clients.get(egress) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone());
        if let EgressIdentity::Proxy(url) = egress {
            let proxy = reqwest::Proxy::all(url.as_str()).map_err(|e| {
                CrawlError::transient(TransientKind::Connection, format!("bad proxy {url}: {e}"))
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| CrawlError::fatal(format!("failed to create HTTP client: {e}")))?;
        clients.insert(egress.clone(), client.clone());
        Ok(client)
    }
}

fn status_error(status: StatusCode, what: &str) -> CrawlError {
    let kind = match status {
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => TransientKind::Blocked,
        _ => TransientKind::Connection,
    };
    CrawlError::transient(kind, format!("{what} returned status {status}"))
}

#[async_trait]
impl ListingScraper for AirbnbScraper {
    async fn search_by_bounding_box(
        &self,
        bounding_box: &BoundingBox,
        page: u32,
        egress: &EgressIdentity,
    ) -> CrawlResult<SearchPage> {
        let client = self.client_for(egress)?;
        let offset = (page * ITEMS_PER_PAGE).to_string();
        let per_page = ITEMS_PER_PAGE.to_string();
        let (sw_lat, sw_lng) = (bounding_box.south.to_string(), bounding_box.west.to_string());
        let (ne_lat, ne_lng) = (bounding_box.north.to_string(), bounding_box.east.to_string());

        let mut query = vec![
            ("version", "1.3.9"),
            ("_format", "for_explore_search_web"),
            ("search_by_map", "true"),
            ("items_per_grid", per_page.as_str()),
            ("items_offset", offset.as_str()),
            ("sw_lat", sw_lat.as_str()),
            ("sw_lng", sw_lng.as_str()),
            ("ne_lat", ne_lat.as_str()),
            ("ne_lng", ne_lng.as_str()),
        ];
        if let Some(key) = self.api_key.as_deref() {
            query.push(("key", key));
        }

        debug!(page, bbox = %bounding_box, egress = egress.label(), "Fetching search page");
        let response = client.get(SEARCH_URL).query(&query).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "search"));
        }
        let body = response.text().await?;
        parse_search_page(&body)
    }

    async fn fetch_detail(
        &self,
        room_id: i64,
        egress: &EgressIdentity,
    ) -> CrawlResult<ListingDetail> {
        let client = self.client_for(egress)?;
        let url = format!("{ROOM_URL}{room_id}");

        debug!(room_id, egress = egress.label(), "Fetching room page");
        let response = client.get(&url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(CrawlError::NotFound(format!("room {room_id}")));
        }
        if !status.is_success() {
            return Err(status_error(status, "room page"));
        }
        // Removed rooms redirect to a search page
        if !response.url().path().starts_with("/rooms/") {
            return Err(CrawlError::NotFound(format!(
                "room {room_id} redirected to {}",
                response.url().path()
            )));
        }

        let html = response.text().await?;
        parse_detail_page(&html).map_err(|err| {
            warn!(room_id, "Room page did not match the expected layout");
            err
        })
    }

    fn source_name(&self) -> &'static str {
        "Airbnb"
    }
}

#[derive(Debug, Deserialize)]
struct ExploreResponse {
    #[serde(default)]
    explore_tabs: Vec<ExploreTab>,
}

#[derive(Debug, Deserialize)]
struct ExploreTab {
    #[serde(default)]
    home_tab_metadata: Option<HomeTabMetadata>,
    #[serde(default)]
    pagination_metadata: Option<PaginationMetadata>,
    #[serde(default)]
    sections: Vec<ExploreSection>,
}

#[derive(Debug, Deserialize)]
struct HomeTabMetadata {
    listings_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PaginationMetadata {
    #[serde(default)]
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
struct ExploreSection {
    #[serde(default)]
    listings: Vec<ExploreListing>,
}

#[derive(Debug, Deserialize)]
struct ExploreListing {
    listing: ExploreListingBody,
}

#[derive(Debug, Deserialize)]
struct ExploreListingBody {
    id: i64,
    lat: f64,
    lng: f64,
}

/// Parse the explore JSON of one map search page
pub fn parse_search_page(body: &str) -> CrawlResult<SearchPage> {
    let response: ExploreResponse = serde_json::from_str(body).map_err(|e| {
        CrawlError::transient(TransientKind::Extraction, format!("search JSON: {e}"))
    })?;
    let tab = response.explore_tabs.into_iter().next().ok_or_else(|| {
        CrawlError::transient(TransientKind::Extraction, "search JSON has no explore tab")
    })?;

    let records = tab
        .sections
        .into_iter()
        .flat_map(|section| section.listings)
        .map(|item| SearchRecord {
            room_id: item.listing.id,
            latitude: item.listing.lat,
            longitude: item.listing.lng,
        })
        .collect();
    let total_results = tab.home_tab_metadata.and_then(|m| m.listings_count);

    Ok(SearchPage {
        records,
        has_more: tab.pagination_metadata.map_or(false, |p| p.has_next_page),
        total_results,
        overflow: total_results.map_or(false, |total| total >= RESULT_CAP),
    })
}

/// Parse the fields we keep from a room page
pub fn parse_detail_page(html: &str) -> CrawlResult<ListingDetail> {
    let document = Html::parse_document(html);
    let og_title = meta_content(&document, r#"meta[property="og:title"]"#);
    let description = meta_content(&document, r#"meta[property="og:description"]"#);

    let ld = json_ld(&document).unwrap_or(Value::Null);
    let name = og_title.or_else(|| ld["name"].as_str().map(str::to_string));
    let Some(name) = name else {
        return Err(CrawlError::transient(
            TransientKind::Extraction,
            "room page has no title",
        ));
    };

    let place = &ld["containsPlace"];
    let rating = &ld["aggregateRating"];
    let offer = &ld["offers"];

    Ok(ListingDetail {
        name: Some(name),
        room_type: place["additionalType"].as_str().map(str::to_string),
        property_type: ld["@type"].as_str().map(str::to_string),
        host_id: ld["host"]["identifier"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| ld["host"]["identifier"].as_i64()),
        price: number(&offer["price"]),
        currency: offer["priceCurrency"].as_str().map(str::to_string),
        reviews: number(&rating["ratingCount"]).map(|v| v as i32),
        overall_satisfaction: number(&rating["ratingValue"]).map(|v| v as f32),
        accommodates: number(&place["occupancy"]["value"]).map(|v| v as i32),
        bedrooms: number(&place["numberOfBedrooms"]).map(|v| v as f32),
        bathrooms: number(&place["numberOfBathroomsTotal"]).map(|v| v as f32),
        raw: json!({
            "description": description,
            "ld": ld,
        }),
    })
}

fn meta_content(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn json_ld(document: &Html) -> Option<Value> {
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;
    document
        .select(&selector)
        .filter_map(|el| serde_json::from_str::<Value>(&el.text().collect::<String>()).ok())
        .find(|v| v.get("containsPlace").is_some() || v.get("aggregateRating").is_some())
}

/// Numbers arrive either as JSON numbers or as strings
fn number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_JSON: &str = r#"{
        "explore_tabs": [{
            "home_tab_metadata": { "listings_count": 42 },
            "pagination_metadata": { "has_next_page": true, "items_offset": 18 },
            "sections": [
                { "listings": [
                    { "listing": { "id": 101, "lat": -20.38, "lng": -43.50 } },
                    { "listing": { "id": 102, "lat": -20.39, "lng": -43.51 } }
                ]},
                { "listings": [] },
                { "listings": [
                    { "listing": { "id": 103, "lat": -20.40, "lng": -43.52 } }
                ]}
            ]
        }]
    }"#;

    #[test]
    fn search_page_collects_listings_from_every_section() {
        let page = parse_search_page(SEARCH_JSON).unwrap();
        let ids: Vec<i64> = page.records.iter().map(|r| r.room_id).collect();
        assert_eq!(ids, vec![101, 102, 103]);
        assert!(page.has_more);
        assert_eq!(page.total_results, Some(42));
        assert!(!page.overflow);
    }

    #[test]
    fn capped_result_count_signals_overflow() {
        let body = r#"{"explore_tabs":[{"home_tab_metadata":{"listings_count":300},"sections":[]}]}"#;
        let page = parse_search_page(body).unwrap();
        assert!(page.overflow);
        assert!(!page.has_more);
    }

    #[test]
    fn garbage_search_body_is_an_extraction_error() {
        let err = parse_search_page("<html>captcha</html>").unwrap_err();
        assert_eq!(err.transient_kind(), Some(TransientKind::Extraction));
    }

    #[test]
    fn room_page_fields_come_from_meta_and_json_ld() {
        let html = r#"<html><head>
            <meta property="og:title" content="Casa no Centro">
            <meta property="og:description" content="Perto da praca">
            <script type="application/ld+json">{
                "@type": "VacationRental",
                "name": "Casa",
                "aggregateRating": { "ratingValue": "4.85", "ratingCount": 37 },
                "containsPlace": {
                    "additionalType": "EntirePlace",
                    "occupancy": { "value": 4 },
                    "numberOfBedrooms": 2,
                    "numberOfBathroomsTotal": 1.5
                },
                "offers": { "price": "320", "priceCurrency": "BRL" }
            }</script>
        </head><body></body></html>"#;

        let detail = parse_detail_page(html).unwrap();
        assert_eq!(detail.name.as_deref(), Some("Casa no Centro"));
        assert_eq!(detail.room_type.as_deref(), Some("EntirePlace"));
        assert_eq!(detail.reviews, Some(37));
        assert_eq!(detail.accommodates, Some(4));
        assert_eq!(detail.bedrooms, Some(2.0));
        assert_eq!(detail.price, Some(320.0));
        assert_eq!(detail.currency.as_deref(), Some("BRL"));
        assert!((detail.overall_satisfaction.unwrap() - 4.85).abs() < 1e-6);
    }

    #[test]
    fn room_page_without_title_is_a_layout_mismatch() {
        let err = parse_detail_page("<html><body>loading</body></html>").unwrap_err();
        assert_eq!(err.transient_kind(), Some(TransientKind::Extraction));
    }
}
