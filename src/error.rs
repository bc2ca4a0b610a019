//! Error types for soupsync.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=usage, 5=sync, etc.)
//! - Retryability flags
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for soupsync operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
///
/// Each code maps to a SCREAMING_SNAKE string and a category-based
/// exit code. Scripts match on the string or on the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    DatabaseError,

    // Not Found (exit 3)
    SoupNotFound,
    EntryNotFound,
    SyncNotFound,

    // Usage (exit 4)
    PathNotIndexed,
    DuplicateExternalId,
    DuplicateSyncName,
    InvalidQuery,
    InvalidArgument,
    UnknownTargetType,

    // Sync lifecycle (exit 5)
    NotAcceptingSyncs,
    SyncAlreadyRunning,
    SyncStopped,

    // Remote (exit 6)
    RemoteError,
    TransportError,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::SoupNotFound => "SOUP_NOT_FOUND",
            Self::EntryNotFound => "ENTRY_NOT_FOUND",
            Self::SyncNotFound => "SYNC_NOT_FOUND",
            Self::PathNotIndexed => "PATH_NOT_INDEXED",
            Self::DuplicateExternalId => "DUPLICATE_EXTERNAL_ID",
            Self::DuplicateSyncName => "DUPLICATE_SYNC_NAME",
            Self::InvalidQuery => "INVALID_QUERY",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::UnknownTargetType => "UNKNOWN_TARGET_TYPE",
            Self::NotAcceptingSyncs => "NOT_ACCEPTING_SYNCS",
            Self::SyncAlreadyRunning => "SYNC_ALREADY_RUNNING",
            Self::SyncStopped => "SYNC_STOPPED",
            Self::RemoteError => "REMOTE_ERROR",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::DatabaseError => 2,
            Self::SoupNotFound | Self::EntryNotFound | Self::SyncNotFound => 3,
            Self::PathNotIndexed
            | Self::DuplicateExternalId
            | Self::DuplicateSyncName
            | Self::InvalidQuery
            | Self::InvalidArgument
            | Self::UnknownTargetType => 4,
            Self::NotAcceptingSyncs | Self::SyncAlreadyRunning | Self::SyncStopped => 5,
            Self::RemoteError | Self::TransportError => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether the caller may re-invoke the same operation later and expect
    /// a different outcome.
    ///
    /// Usage errors never are. Remote failures and a stopped sync are: the
    /// engine never retries them itself.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RemoteError | Self::TransportError | Self::SyncStopped | Self::DatabaseError
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in soupsync operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: database not found at {path}")]
    NotInitialized { path: PathBuf },

    #[error("No such soup: {soup}")]
    SoupNotFound { soup: String },

    #[error("Entry {id} not found in soup {soup}")]
    EntryNotFound { soup: String, id: i64 },

    #[error("Sync not found: {id}")]
    SyncNotFound { id: String },

    #[error("Path {path} is not indexed in soup {soup}")]
    PathNotIndexed { soup: String, path: String },

    #[error("There are more than one soup elements where {path} is {value} in soup {soup}")]
    DuplicateExternalId {
        soup: String,
        path: String,
        value: String,
    },

    #[error("Sync name already in use: {name}")]
    DuplicateSyncName { name: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unknown target type: {0}")]
    UnknownTargetType(String),

    #[error("Sync manager is not accepting syncs (state: {state})")]
    NotAcceptingSyncs { state: String },

    #[error("Sync {id} is still running")]
    SyncAlreadyRunning { id: i64 },

    #[error("Sync stopped")]
    SyncStopped,

    #[error("Remote error (HTTP {status}): {body}")]
    Remote { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized { .. } => ErrorCode::NotInitialized,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::SoupNotFound { .. } => ErrorCode::SoupNotFound,
            Self::EntryNotFound { .. } => ErrorCode::EntryNotFound,
            Self::SyncNotFound { .. } => ErrorCode::SyncNotFound,
            Self::PathNotIndexed { .. } => ErrorCode::PathNotIndexed,
            Self::DuplicateExternalId { .. } => ErrorCode::DuplicateExternalId,
            Self::DuplicateSyncName { .. } => ErrorCode::DuplicateSyncName,
            Self::InvalidQuery(_) => ErrorCode::InvalidQuery,
            Self::UnknownTargetType(_) => ErrorCode::UnknownTargetType,
            Self::NotAcceptingSyncs { .. } => ErrorCode::NotAcceptingSyncs,
            Self::SyncAlreadyRunning { .. } => ErrorCode::SyncAlreadyRunning,
            Self::SyncStopped => ErrorCode::SyncStopped,
            Self::Remote { .. } => ErrorCode::RemoteError,
            Self::Transport(_) => ErrorCode::TransportError,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Whether this is the cooperative-cancellation condition.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::SyncStopped)
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized { path } => Some(format!(
                "No database at {}. Register a soup first: soupsync soup register <name> --index path:string",
                path.display()
            )),

            Self::SoupNotFound { soup } => Some(format!(
                "Soup '{soup}' is not registered. Use `soupsync soup list` to see registered soups."
            )),

            Self::PathNotIndexed { soup, path } => Some(format!(
                "Re-register '{soup}' with an index on '{path}': soupsync soup register {soup} --index {path}:string"
            )),

            Self::DuplicateExternalId { path, .. } => Some(format!(
                "Several records share the same '{path}'. Update them by entry id instead."
            )),

            Self::DuplicateSyncName { name } => Some(format!(
                "Pick another name or delete the existing sync: soupsync sync delete {name}"
            )),

            Self::SyncNotFound { .. } => {
                Some("Use `soupsync sync list` to see known syncs.".to_string())
            }

            Self::SyncAlreadyRunning { id } => Some(format!(
                "Wait for sync {id} to finish, then check it with `soupsync sync status {id}`."
            )),

            Self::SyncStopped => {
                Some("The sync was stopped and can be resumed with `soupsync sync resync`.".to_string())
            }

            Self::Remote { status: 401, .. } => {
                Some("The access token was rejected. Refresh it in ~/.soupsync/config.json.".to_string())
            }

            Self::Transport(_) => Some(
                "Check SOUPSYNC_INSTANCE_URL and network connectivity, then re-run the sync."
                    .to_string(),
            ),

            Self::UnknownTargetType(kind) => Some(format!(
                "No handler is registered for custom target type '{kind}'."
            )),

            Self::EntryNotFound { .. }
            | Self::InvalidQuery(_)
            | Self::NotAcceptingSyncs { .. }
            | Self::Remote { .. }
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::InvalidArgument(_)
            | Self::Config(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
