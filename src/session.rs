//! Everything one crawl run shares, passed explicitly to every operation.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::crawl::proxy::{ProxyFile, ProxyPool, ProxySource, StaticProxies};
use crate::crawl::retry::RetryPolicy;
use crate::error::{CrawlError, CrawlResult};
use crate::geo::{BoundingBoxSplitter, Geocoder, NominatimGeocoder, PartitionSource};
use crate::scrapers::{AirbnbScraper, ListingScraper};
use crate::store::{MemoryStore, PgStore, Store};

/// External collaborators a session is built from
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub partitions: Arc<dyn PartitionSource>,
    pub scraper: Arc<dyn ListingScraper>,
    pub geocoder: Arc<dyn Geocoder>,
    pub proxies: Arc<dyn ProxySource>,
}

pub struct CrawlSession {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub scraper: Arc<dyn ListingScraper>,
    pub geocoder: Arc<dyn Geocoder>,
    pub splitter: BoundingBoxSplitter,
    pub proxies: ProxyPool,
    /// Bounds how many surveys page through search results at once
    pub survey_slots: Semaphore,
    pub cancel: CancellationToken,
}

impl CrawlSession {
    pub async fn new(config: Config, parts: Collaborators, cancel: CancellationToken) -> Self {
        let proxies = ProxyPool::spawn(parts.proxies, config.re_init_sleep, cancel.clone()).await;
        let splitter = BoundingBoxSplitter::new(
            parts.store.clone(),
            parts.partitions,
            parts.geocoder.clone(),
        );
        Self {
            survey_slots: Semaphore::new(config.survey_workers),
            config,
            store: parts.store,
            scraper: parts.scraper,
            geocoder: parts.geocoder,
            splitter,
            proxies,
            cancel,
        }
    }

    /// Session wired to the production adapters. `memory` swaps PostgreSQL
    /// for the in-memory store.
    pub async fn connect(
        config: Config,
        memory: bool,
        cancel: CancellationToken,
    ) -> CrawlResult<Self> {
        let (store, partitions): (Arc<dyn Store>, Arc<dyn PartitionSource>) = if memory {
            info!("Using in-memory store; nothing will be persisted");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store)
        } else {
            let url = config.database_url.as_deref().ok_or_else(|| {
                CrawlError::fatal("DATABASE_URL is required (set via --database-url or env)")
            })?;
            let store = Arc::new(PgStore::connect(url).await?);
            store.ensure_schema().await?;
            (store.clone(), store)
        };

        let scraper = Arc::new(AirbnbScraper::new(
            config.api_key.clone(),
            config.user_agent.clone(),
            config.request_timeout,
        ));
        let geocoder = Arc::new(NominatimGeocoder::new(
            config.geocoder_url.clone(),
            &config.user_agent,
            config.request_timeout,
        )?);
        let proxies: Arc<dyn ProxySource> = match &config.proxy_file {
            Some(path) => Arc::new(ProxyFile(path.clone())),
            None => Arc::new(StaticProxies(config.proxy_list.clone())),
        };

        let parts = Collaborators {
            store,
            partitions,
            scraper,
            geocoder,
            proxies,
        };
        Ok(Self::new(config, parts, cancel).await)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_connection_attempts,
            timeout: self.config.request_timeout,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
