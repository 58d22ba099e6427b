//! Crawl orchestration: search passes, survey trees, detail fill, and the
//! proxy pool and retry rules they share.

pub mod fetch_loop;
pub mod fill;
pub mod proxy;
pub mod retry;
pub mod surveyor;

pub use fetch_loop::{run_survey, RunMode, SurveyResult};
pub use fill::{run_fill, FillCursor, FillOutcome, FillQueue, FillReport};
pub use proxy::{PoolStats, ProxyFile, ProxyPool, ProxySource, StaticProxies};
pub use retry::RetryPolicy;
pub use surveyor::{run_survey_tree, TreeReport};
