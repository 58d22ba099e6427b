use crate::error::CrawlResult;
use crate::models::{BoundingBox, ListingDetail};
use crate::scrapers::types::{EgressIdentity, SearchPage};
use async_trait::async_trait;

/// Contract every marketplace adapter satisfies.
/// The crawl core only talks to this trait, never to page markup.
#[async_trait]
pub trait ListingScraper: Send + Sync {
    /// Fetch one page (zero based) of map search results for a box.
    async fn search_by_bounding_box(
        &self,
        bounding_box: &BoundingBox,
        page: u32,
        egress: &EgressIdentity,
    ) -> CrawlResult<SearchPage>;

    /// Fetch the detail page of a listing.
    ///
    /// `CrawlError::NotFound` means the marketplace confirmed the listing is
    /// gone; `CrawlError::Transient` means try again later.
    async fn fetch_detail(&self, room_id: i64, egress: &EgressIdentity)
        -> CrawlResult<ListingDetail>;

    /// Get the name of the scraper source
    fn source_name(&self) -> &'static str;
}
