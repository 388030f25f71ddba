//! # FinSync Common
//!
//! Shared pieces of the FinSync offline-sync worker and its tools:
//!
//! - [`FinSyncError`], the error every crate converts into at its boundary
//! - [`logging`]: tracing subscriber setup
//! - [`config`]: [`WorkerConfig`] (bucket names, shell assets, offline messages)

use thiserror::Error;

pub mod config;
pub mod logging;

pub use config::{NotificationConfig, OfflineMessages, WorkerConfig};
pub use logging::{init_logging, LogConfig, LogFormat};

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Error shared across FinSync crates.
#[derive(Error, Debug)]
pub enum FinSyncError {
    /// The local durable store failed.
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// A cache bucket rejected an operation.
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Bad or unreadable configuration.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A bug, not an environmental failure.
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl FinSyncError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Whether the same operation may succeed on the next sync trigger.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FinSyncError::Io(_))
    }

    /// Short name for the `category` log field.
    pub fn category(&self) -> &'static str {
        match self {
            FinSyncError::Storage { .. } => "storage",
            FinSyncError::Cache { .. } => "cache",
            FinSyncError::Config { .. } => "config",
            FinSyncError::Io(_) => "io",
            FinSyncError::Internal { .. } => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, FinSyncError>;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
