//! Crawl tunables.
//!
//! [`Settings`] is the command-line / environment view (every flag has an
//! env var, and `.env` is loaded by the binary before parsing). [`Config`] is
//! the validated form the crawl core works with.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::geo::geocoder::DEFAULT_GEOCODER_URL;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    /// Attempts per listing (and per search page) before it is abandoned for this pass
    pub max_connection_attempts: u32,
    /// Cooldown before an exhausted proxy pool is reloaded
    pub re_init_sleep: Duration,
    /// Upper bound on fill attempts in one run
    pub fill_max_room_count: usize,
    /// Pages requested per survey before the area counts as overflowing
    pub search_max_pages: u32,
    pub request_timeout: Duration,
    /// Pause between consecutive search pages of one survey
    pub request_sleep: Duration,
    pub survey_workers: usize,
    pub fill_workers: usize,
    pub proxy_list: Vec<String>,
    /// Re-read on every pool reinit when set
    pub proxy_file: Option<PathBuf>,
    pub api_key: Option<String>,
    pub user_agent: String,
    pub geocoder_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connection_attempts: 5,
            re_init_sleep: Duration::from_secs(1800),
            fill_max_room_count: 50_000,
            search_max_pages: 20,
            request_timeout: Duration::from_secs(30),
            request_sleep: Duration::from_millis(1000),
            survey_workers: 4,
            fill_workers: 4,
            proxy_list: Vec::new(),
            proxy_file: None,
            api_key: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            geocoder_url: DEFAULT_GEOCODER_URL.to_string(),
        }
    }
}

/// Global options shared by every subcommand
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Attempts per listing before it is skipped for this pass
    #[arg(long, env = "MAX_CONNECTION_ATTEMPTS", default_value_t = 5, global = true)]
    pub max_connection_attempts: u32,

    /// Seconds to wait before reloading an exhausted proxy pool
    #[arg(long, env = "RE_INIT_SLEEP_TIME", default_value_t = 1800, global = true)]
    pub re_init_sleep_time: u64,

    /// Maximum fill attempts in one run
    #[arg(long, env = "FILL_MAX_ROOM_COUNT", default_value_t = 50_000, global = true)]
    pub fill_max_room_count: usize,

    /// Search pages per survey before the area is split
    #[arg(long, env = "SEARCH_MAX_PAGES", default_value_t = 20, global = true)]
    pub search_max_pages: u32,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = 30, global = true)]
    pub request_timeout: u64,

    /// Milliseconds between search pages
    #[arg(long, env = "REQUEST_SLEEP", default_value_t = 1000, global = true)]
    pub request_sleep: u64,

    /// Surveys fetched in parallel
    #[arg(long, env = "SURVEY_WORKERS", default_value_t = 4, global = true)]
    pub survey_workers: usize,

    /// Concurrent fill workers
    #[arg(long, env = "FILL_WORKERS", default_value_t = 4, global = true)]
    pub fill_workers: usize,

    /// Comma separated proxy URLs
    #[arg(long, env = "HTTP_PROXY_LIST", value_delimiter = ',', global = true)]
    pub proxy_list: Vec<String>,

    /// File with one proxy URL per line, re-read whenever the pool is reloaded
    #[arg(long, env = "HTTP_PROXY_FILE", global = true)]
    pub proxy_file: Option<PathBuf>,

    #[arg(long, env = "AIRBNB_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "USER_AGENT", default_value = DEFAULT_USER_AGENT, global = true)]
    pub user_agent: String,

    #[arg(long, env = "GEOCODER_URL", default_value = DEFAULT_GEOCODER_URL, global = true)]
    pub geocoder_url: String,
}

impl Settings {
    pub fn into_config(self) -> Config {
        Config {
            database_url: self.database_url,
            max_connection_attempts: self.max_connection_attempts.max(1),
            re_init_sleep: Duration::from_secs(self.re_init_sleep_time),
            fill_max_room_count: self.fill_max_room_count,
            search_max_pages: self.search_max_pages.max(1),
            request_timeout: Duration::from_secs(self.request_timeout.max(1)),
            request_sleep: Duration::from_millis(self.request_sleep),
            survey_workers: self.survey_workers.max(1),
            fill_workers: self.fill_workers.max(1),
            proxy_list: self
                .proxy_list
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            proxy_file: self.proxy_file,
            api_key: self.api_key,
            user_agent: self.user_agent,
            geocoder_url: self.geocoder_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        settings: Settings,
    }

    #[test]
    fn defaults_match_the_documented_tunables() {
        let config = Harness::parse_from(["listing-scout"]).settings.into_config();
        let defaults = Config::default();
        assert_eq!(config.max_connection_attempts, defaults.max_connection_attempts);
        assert_eq!(config.re_init_sleep, defaults.re_init_sleep);
        assert_eq!(config.fill_max_room_count, defaults.fill_max_room_count);
        assert_eq!(config.search_max_pages, defaults.search_max_pages);
        assert_eq!(config.request_sleep, defaults.request_sleep);
    }

    #[test]
    fn proxy_list_is_split_and_blank_entries_dropped() {
        let config = Harness::parse_from([
            "listing-scout",
            "--proxy-list",
            "http://a:1, ,http://b:2",
            "--survey-workers",
            "0",
        ])
        .settings
        .into_config();
        assert_eq!(config.proxy_list, vec!["http://a:1", "http://b:2"]);
        assert_eq!(config.survey_workers, 1);
    }

    #[test]
    fn zero_request_timeout_is_raised_to_one_second() {
        let config = Harness::parse_from(["listing-scout", "--request-timeout", "0"])
            .settings
            .into_config();
        assert_eq!(config.request_timeout, Duration::from_secs(1));
    }
}
