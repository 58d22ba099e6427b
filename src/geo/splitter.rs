//! Subdivision of areas whose search results overflow pagination.
//!
//! Child areas are named `"<label>, <parent name>"`, where labels come from a
//! [`PartitionSource`] (sublocalities first, streets/routes as fallback).
//! Children are created through the store's get-or-create, so splitting the
//! same area twice yields the same rows. Splits of one area along one
//! dimension are serialized so two concurrent surveys never race on them.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{place_label, Geocoder, SplitDimension};
use crate::error::{CrawlResult, StoreResult};
use crate::models::GeoArea;
use crate::store::Store;

/// Lists the named places known inside an area.
#[async_trait]
pub trait PartitionSource: Send + Sync {
    async fn partition_labels(
        &self,
        area: &GeoArea,
        dimension: SplitDimension,
    ) -> StoreResult<Vec<String>>;
}

/// Outcome of splitting one area
#[derive(Debug, Clone)]
pub struct Split {
    /// Dimension that produced the children, `None` when nothing did
    pub dimension: Option<SplitDimension>,
    pub areas: Vec<GeoArea>,
}

impl Split {
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}

type SplitKey = (i64, SplitDimension);

pub struct BoundingBoxSplitter {
    store: Arc<dyn Store>,
    partitions: Arc<dyn PartitionSource>,
    geocoder: Arc<dyn Geocoder>,
    in_flight: Mutex<HashMap<SplitKey, Arc<Mutex<()>>>>,
}

impl BoundingBoxSplitter {
    pub fn new(
        store: Arc<dyn Store>,
        partitions: Arc<dyn PartitionSource>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        Self {
            store,
            partitions,
            geocoder,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Split along the first dimension that yields any child area.
    pub async fn split(&self, area: &GeoArea) -> CrawlResult<Split> {
        for dimension in SplitDimension::PREFERENCE {
            let areas = self.split_along(area, dimension).await?;
            if !areas.is_empty() {
                info!(area = %area.name, %dimension, children = areas.len(), "Split area");
                return Ok(Split {
                    dimension: Some(dimension),
                    areas,
                });
            }
        }
        warn!(area = %area.name, "No finer partition exists; overflow is not mitigated");
        Ok(Split {
            dimension: None,
            areas: Vec::new(),
        })
    }

    /// Child areas of `area` along one dimension, sorted by name.
    pub async fn split_along(
        &self,
        area: &GeoArea,
        dimension: SplitDimension,
    ) -> CrawlResult<Vec<GeoArea>> {
        let gate = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry((area.id, dimension))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        let own_label = place_label(&area.name);
        let labels: BTreeSet<String> = self
            .partitions
            .partition_labels(area, dimension)
            .await?
            .into_iter()
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty() && label != own_label)
            .collect();

        let mut children = Vec::with_capacity(labels.len());
        for label in labels {
            let name = format!("{label}, {}", area.name);
            if let Some(child) = self.child_area(area, &name).await? {
                if child.id != area.id {
                    children.push(child);
                }
            }
        }
        Ok(children)
    }

    /// Existing area with this name, or a freshly geocoded one. `None` when
    /// the child cannot be placed inside the parent.
    async fn child_area(&self, parent: &GeoArea, name: &str) -> CrawlResult<Option<GeoArea>> {
        if let Some(existing) = self.store.geo_area_by_name(name).await? {
            debug!(area = name, "Reusing existing child area");
            return Ok(Some(existing));
        }

        let bbox = match self.geocoder.bounding_box(name).await {
            Ok(bbox) => bbox,
            Err(err) => {
                warn!(area = name, error = %err, "Dropping child area that could not be geocoded");
                return Ok(None);
            }
        };
        let bbox = match parent.bounding_box {
            Some(parent_box) => match parent_box.intersection(&bbox) {
                Some(clipped) => clipped,
                None => {
                    warn!(area = name, "Dropping child area outside its parent");
                    return Ok(None);
                }
            },
            None => bbox,
        };

        let (child, _) = self.store.get_or_create_geo_area(name, Some(bbox)).await?;
        Ok(Some(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrawlError;
    use crate::models::BoundingBox;
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StaticGeocoder {
        boxes: HashMap<String, BoundingBox>,
        calls: AtomicUsize,
    }

    impl StaticGeocoder {
        fn with(mut self, name: &str, bbox: BoundingBox) -> Self {
            self.boxes.insert(name.to_string(), bbox);
            self
        }
    }

    #[async_trait]
    impl Geocoder for StaticGeocoder {
        async fn bounding_box(&self, place: &str) -> CrawlResult<BoundingBox> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.boxes
                .get(place)
                .copied()
                .ok_or_else(|| CrawlError::NotFound(place.to_string()))
        }
    }

    fn bbox(n: f64, s: f64, e: f64, w: f64) -> BoundingBox {
        BoundingBox::new(n, s, e, w).unwrap()
    }

    async fn city(store: &MemoryStore) -> GeoArea {
        store
            .get_or_create_geo_area("Ouro Preto", Some(bbox(10.0, 0.0, 10.0, 0.0)))
            .await
            .unwrap()
            .0
    }

    fn splitter(store: Arc<MemoryStore>, geocoder: StaticGeocoder) -> BoundingBoxSplitter {
        BoundingBoxSplitter::new(store.clone(), store, Arc::new(geocoder))
    }

    #[tokio::test]
    async fn sublocalities_are_preferred_over_routes() {
        let store = Arc::new(MemoryStore::new());
        let parent = city(&store).await;
        store.seed_partitions("Ouro Preto", SplitDimension::Sublocality, &["Centro", "Bauxita"]);
        store.seed_partitions("Ouro Preto", SplitDimension::Route, &["Rua Direita"]);
        let geocoder = StaticGeocoder::default()
            .with("Centro, Ouro Preto", bbox(5.0, 0.0, 5.0, 0.0))
            .with("Bauxita, Ouro Preto", bbox(10.0, 5.0, 10.0, 5.0))
            .with("Rua Direita, Ouro Preto", bbox(2.0, 1.0, 2.0, 1.0));

        let split = splitter(store.clone(), geocoder).split(&parent).await.unwrap();

        assert_eq!(split.dimension, Some(SplitDimension::Sublocality));
        let names: Vec<&str> = split.areas.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Bauxita, Ouro Preto", "Centro, Ouro Preto"]);
    }

    #[tokio::test]
    async fn routes_are_used_when_no_sublocality_is_known() {
        let store = Arc::new(MemoryStore::new());
        let parent = city(&store).await;
        store.seed_partitions("Ouro Preto", SplitDimension::Route, &["Rua Direita"]);
        let geocoder =
            StaticGeocoder::default().with("Rua Direita, Ouro Preto", bbox(2.0, 1.0, 2.0, 1.0));

        let split = splitter(store.clone(), geocoder).split(&parent).await.unwrap();

        assert_eq!(split.dimension, Some(SplitDimension::Route));
        assert_eq!(split.areas.len(), 1);
    }

    #[tokio::test]
    async fn flat_locality_yields_an_empty_split() {
        let store = Arc::new(MemoryStore::new());
        let parent = city(&store).await;

        let split = splitter(store.clone(), StaticGeocoder::default())
            .split(&parent)
            .await
            .unwrap();

        assert!(split.is_empty());
        assert_eq!(split.dimension, None);
    }

    #[tokio::test]
    async fn ungeocodable_child_is_dropped_without_aborting() {
        let store = Arc::new(MemoryStore::new());
        let parent = city(&store).await;
        store.seed_partitions("Ouro Preto", SplitDimension::Sublocality, &["Centro", "Nowhere"]);
        let geocoder =
            StaticGeocoder::default().with("Centro, Ouro Preto", bbox(5.0, 0.0, 5.0, 0.0));

        let split = splitter(store.clone(), geocoder).split(&parent).await.unwrap();

        assert_eq!(split.areas.len(), 1);
        assert_eq!(split.areas[0].name, "Centro, Ouro Preto");
        assert!(store.geo_area_by_name("Nowhere, Ouro Preto").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn child_boxes_are_clipped_to_the_parent() {
        let store = Arc::new(MemoryStore::new());
        let parent = city(&store).await;
        store.seed_partitions("Ouro Preto", SplitDimension::Sublocality, &["Centro", "Far"]);
        let geocoder = StaticGeocoder::default()
            .with("Centro, Ouro Preto", bbox(15.0, 5.0, 15.0, 5.0))
            .with("Far, Ouro Preto", bbox(50.0, 40.0, 50.0, 40.0));

        let split = splitter(store.clone(), geocoder).split(&parent).await.unwrap();

        assert_eq!(split.areas.len(), 1);
        assert_eq!(split.areas[0].bounding_box, Some(bbox(10.0, 5.0, 10.0, 5.0)));
    }

    #[tokio::test]
    async fn splitting_twice_reuses_children_and_never_renames_existing_areas() {
        let store = Arc::new(MemoryStore::new());
        let parent = city(&store).await;
        // Registered earlier with a different box
        let (existing, _) = store
            .get_or_create_geo_area("Centro, Ouro Preto", Some(bbox(3.0, 1.0, 3.0, 1.0)))
            .await
            .unwrap();
        store.seed_partitions("Ouro Preto", SplitDimension::Sublocality, &["Centro", "Bauxita"]);
        let geocoder = StaticGeocoder::default()
            .with("Centro, Ouro Preto", bbox(5.0, 0.0, 5.0, 0.0))
            .with("Bauxita, Ouro Preto", bbox(10.0, 5.0, 10.0, 5.0));
        let splitter = splitter(store.clone(), geocoder);

        let first = splitter.split(&parent).await.unwrap();
        let second = splitter.split(&parent).await.unwrap();

        let ids = |s: &Split| s.areas.iter().map(|a| a.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        let centro = first.areas.iter().find(|a| a.name == "Centro, Ouro Preto").unwrap();
        assert_eq!(centro.id, existing.id);
        assert_eq!(centro.bounding_box, existing.bounding_box);
        assert_eq!(store.geo_area_count(), 3);
    }
}
