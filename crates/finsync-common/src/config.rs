//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::{FinSyncError, Result};

/// Build tag appended to every bucket name. Bumping it regenerates all buckets
/// on the next activation.
pub const CACHE_VERSION: &str = "v1";

/// Tag registered for background replay of the offline queue.
pub const SYNC_TAG: &str = "sync-transactions";

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker controls; shell asset paths resolve against it
    pub origin: Url,

    /// Path prefix routed to the API strategy
    pub api_prefix: String,

    /// Versioned cache bucket names
    pub caches: CacheNames,

    /// Shell assets pre-cached on install and served cache-first
    pub static_assets: Vec<String>,

    /// Local durable store settings
    pub database: DatabaseConfig,

    /// Messages placed in synthesized offline responses
    pub messages: OfflineMessages,

    /// Push notification fallbacks
    pub notifications: NotificationConfig,

    /// Background sync tag for the offline queue
    pub sync_tag: String,

    /// Tag responses served from a cache or the local store with
    /// `x-finsync-source`
    pub mark_offline_responses: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheNames {
    pub static_bucket: String,
    pub dynamic_bucket: String,
    pub api_bucket: String,
}

impl CacheNames {
    /// Bucket names for a build tag.
    pub fn for_version(version: &str) -> Self {
        Self {
            static_bucket: format!("finance-static-{}", version),
            dynamic_bucket: format!("finance-dynamic-{}", version),
            api_bucket: format!("finance-api-{}", version),
        }
    }

    /// The three current names; every other bucket is stale.
    pub fn allow_list(&self) -> [&str; 3] {
        [
            self.static_bucket.as_str(),
            self.dynamic_bucket.as_str(),
            self.api_bucket.as_str(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database name
    pub name: String,

    /// Schema version requested on open
    pub version: u32,

    /// On-disk location for the SQLite backend
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineMessages {
    /// `message` of the 202 returned for a queued mutation
    pub queued: String,

    /// `error` of the 503 returned for an unavailable API read
    pub unavailable: String,

    /// Plain-text body of the 503 returned for a missing shell asset
    pub static_unavailable: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub default_title: String,
    pub default_body: String,
    pub icon: String,
    pub badge: String,

    /// Where the `open` action navigates
    pub open_url: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:3000/").expect("static origin is valid"),
            api_prefix: "/api/".to_string(),
            caches: CacheNames::default(),
            static_assets: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/favicon.ico".to_string(),
                "/logo192.png".to_string(),
                "/logo512.png".to_string(),
            ],
            database: DatabaseConfig::default(),
            messages: OfflineMessages::default(),
            notifications: NotificationConfig::default(),
            sync_tag: SYNC_TAG.to_string(),
            mark_offline_responses: true,
        }
    }
}

impl Default for CacheNames {
    fn default() -> Self {
        Self::for_version(CACHE_VERSION)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "finance-offline".to_string(),
            version: 1,
            path: data_dir().join("finsync").join("offline.sqlite3"),
        }
    }
}

impl Default for OfflineMessages {
    fn default() -> Self {
        Self {
            queued: "You are offline. The operation was saved and will be synced when the connection returns.".to_string(),
            unavailable: "You are offline and this data is not available locally.".to_string(),
            static_unavailable: "Offline - resource unavailable".to_string(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_title: "Finance Manager".to_string(),
            default_body: "You have a new notification".to_string(),
            icon: "/logo192.png".to_string(),
            badge: "/logo192.png".to_string(),
            open_url: "/".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load a configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            FinSyncError::config_with_source(format!("invalid config {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the worker relies on.
    pub fn validate(&self) -> Result<()> {
        if !self.api_prefix.starts_with('/') || !self.api_prefix.ends_with('/') {
            return Err(FinSyncError::config(format!(
                "api_prefix must start and end with '/': {:?}",
                self.api_prefix
            )));
        }

        let names = self.caches.allow_list();
        if names.iter().any(|n| n.is_empty()) {
            return Err(FinSyncError::config("cache bucket names must not be empty"));
        }
        if names[0] == names[1] || names[0] == names[2] || names[1] == names[2] {
            return Err(FinSyncError::config("cache bucket names must be distinct"));
        }

        if let Some(asset) = self.static_assets.iter().find(|a| !a.starts_with('/')) {
            return Err(FinSyncError::config(format!(
                "static asset must be an absolute path: {:?}",
                asset
            )));
        }

        if self.database.version == 0 {
            return Err(FinSyncError::config("database version must be at least 1"));
        }

        Ok(())
    }

    /// Resolve a path against the configured origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| FinSyncError::config_with_source(format!("bad path {:?}", path), e))
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."))
}
