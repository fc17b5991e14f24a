//! Process configuration, read once from the environment (and `.env`) and
//! passed by reference to every component.

use std::path::PathBuf;
use std::time::Duration;

use calp_adapters::{SessionConfig, DEFAULT_LISTING_MARKER};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_SEARCH_URL: &str = "https://www.blocket.se/annonser/hela_sverige/fordon/bilar?cg=1020&q=porsche&mys=400000&st=s&is=1&l=0&md=th";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticsearchSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub index: String,
    pub mapping_file: PathBuf,
}

impl ElasticsearchSettings {
    /// Base URL; a host that already carries a scheme is used as is.
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}:{}", self.port)
        } else {
            format!("http://{host}:{}", self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub listings_table: String,
    pub elasticsearch: ElasticsearchSettings,
    pub search_url: String,
    pub listing_marker: String,
    pub page_load_timeout: Duration,
    pub element_timeout: Duration,
    pub max_scrolls: usize,
    pub user_agent: Option<String>,
    pub download_images: bool,
    pub images_dir: PathBuf,
    pub http_timeout: Duration,
    pub sync_batch_size: usize,
    pub scheduler_enabled: bool,
    pub extract_cron: String,
    pub sync_cron: String,
    pub port: u16,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        info!(
            table = %config.listings_table,
            index = %config.elasticsearch.index,
            elasticsearch = %config.elasticsearch.base_url(),
            scheduler = config.scheduler_enabled,
            download_images = config.download_images,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let string = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let batch_size: usize = parse(&var, "CALP_SYNC_BATCH_SIZE", 500)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "CALP_SYNC_BATCH_SIZE",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            database_url,
            listings_table: string("LISTINGS_TABLE", "car_ads"),
            elasticsearch: ElasticsearchSettings {
                host: string("ELASTICSEARCH_HOST", "localhost"),
                port: parse(&var, "ELASTICSEARCH_PORT", 9200)?,
                user: var("ELASTICSEARCH_USER"),
                password: var("ELASTICSEARCH_PASSWORD"),
                index: string("ELASTICSEARCH_INDEX", "car_ads"),
                mapping_file: PathBuf::from(string(
                    "ELASTICSEARCH_MAPPING_FILE",
                    "elasticsearch_mapping.json",
                )),
            },
            search_url: string("CALP_SEARCH_URL", DEFAULT_SEARCH_URL),
            listing_marker: string("CALP_LISTING_PATH_MARKER", DEFAULT_LISTING_MARKER),
            page_load_timeout: Duration::from_secs(parse(&var, "CALP_PAGE_LOAD_TIMEOUT_SECS", 60)?),
            element_timeout: Duration::from_secs(parse(&var, "CALP_ELEMENT_TIMEOUT_SECS", 15)?),
            max_scrolls: parse(&var, "CALP_MAX_SCROLLS", 5)?,
            user_agent: var("CALP_USER_AGENT"),
            download_images: flag(&var, "CALP_DOWNLOAD_IMAGES"),
            images_dir: PathBuf::from(string("CALP_IMAGES_DIR", "images")),
            http_timeout: Duration::from_secs(parse(&var, "CALP_HTTP_TIMEOUT_SECS", 10)?),
            sync_batch_size: batch_size,
            scheduler_enabled: flag(&var, "CALP_SCHEDULER_ENABLED"),
            extract_cron: string("CALP_EXTRACT_CRON", "0 0 5 * * *"),
            sync_cron: string("CALP_SYNC_CRON", "0 30 5 * * *"),
            port: parse(&var, "PORT", 8000)?,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            page_load_timeout: self.page_load_timeout,
            element_timeout: self.element_timeout,
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }
}

fn parse<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn flag(var: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    var(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
