//! Map-search listing crawler.
//!
//! Surveys page through a marketplace's map search one area at a time,
//! splitting areas whose results overflow pagination into sublocalities or
//! streets, and a fill pass later enriches the stored listings with their
//! detail pages.

pub mod config;
pub mod crawl;
pub mod error;
pub mod geo;
pub mod models;
pub mod scrapers;
pub mod session;
pub mod store;

pub use config::Config;
pub use error::{CrawlError, CrawlResult, StoreError, StoreResult};
pub use session::{Collaborators, CrawlSession};
