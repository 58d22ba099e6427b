use crate::error::{CrawlError, CrawlResult, TransientKind};
use crate::models::BoundingBox;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org/search";

/// Resolves a place name to the box that encloses it.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `CrawlError::NotFound` when the place is unknown.
    async fn bounding_box(&self, place: &str) -> CrawlResult<BoundingBox>;
}

/// Geocoder backed by a Nominatim search endpoint
pub struct NominatimGeocoder {
    client: Client,
    url: String,
}

impl NominatimGeocoder {
    pub fn new(url: impl Into<String>, user_agent: &str, timeout: Duration) -> CrawlResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| CrawlError::fatal(format!("failed to create geocoder client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    /// `[south, north, west, east]` as strings
    boundingbox: Vec<String>,
}

/// Turn a Nominatim response body into the box of its first match
pub fn parse_nominatim(place: &str, body: &str) -> CrawlResult<BoundingBox> {
    let places: Vec<NominatimPlace> = serde_json::from_str(body).map_err(|e| {
        CrawlError::transient(TransientKind::Extraction, format!("geocoder JSON: {e}"))
    })?;
    let first = places
        .into_iter()
        .next()
        .ok_or_else(|| CrawlError::NotFound(format!("place '{place}'")))?;

    let edges: Vec<f64> = first
        .boundingbox
        .iter()
        .filter_map(|v| v.parse().ok())
        .collect();
    match edges.as_slice() {
        [south, north, west, east] => BoundingBox::new(*north, *south, *east, *west)
            .ok_or_else(|| CrawlError::fatal(format!("geocoder returned an inverted box for '{place}'"))),
        _ => Err(CrawlError::transient(
            TransientKind::Extraction,
            format!("geocoder box for '{place}' is malformed"),
        )),
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn bounding_box(&self, place: &str) -> CrawlResult<BoundingBox> {
        debug!(place, "Geocoding");
        let response = self
            .client
            .get(&self.url)
            .query(&[("q", place), ("format", "json"), ("limit", "1")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CrawlError::transient(
                TransientKind::Connection,
                format!("geocoder returned status {}", response.status()),
            ));
        }
        let body = response.text().await?;
        parse_nominatim(place, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominatim_box_is_reordered_into_edges() {
        let body = r#"[{"display_name":"Ouro Preto","boundingbox":["-20.4126148","-20.3699597","-43.5313676","-43.4719237"]}]"#;
        let bbox = parse_nominatim("Ouro Preto", body).unwrap();
        assert_eq!(bbox.north, -20.3699597);
        assert_eq!(bbox.south, -20.4126148);
        assert_eq!(bbox.east, -43.4719237);
        assert_eq!(bbox.west, -43.5313676);
    }

    #[test]
    fn empty_result_means_unknown_place() {
        let err = parse_nominatim("Atlantis", "[]").unwrap_err();
        assert!(matches!(err, CrawlError::NotFound(_)));
    }
}
