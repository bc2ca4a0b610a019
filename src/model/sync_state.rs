//! Sync job descriptors.
//!
//! A `SyncState` is the persisted form of one synchronization job. It lives
//! as a record in the reserved syncs soup; its entry id is the job id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::sync::target::{SyncDownTarget, SyncUpTarget};

/// Sentinel for "no known timestamp".
pub const UNKNOWN_TIME_STAMP: i64 = -1;

/// Direction of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
    #[serde(rename = "syncDown")]
    Down,
    #[serde(rename = "syncUp")]
    Up,
}

impl SyncType {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "syncDown",
            Self::Up => "syncUp",
        }
    }
}

/// Lifecycle status of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    New,
    Running,
    Stopped,
    Done,
    Failed,
}

impl SyncStatus {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "RUNNING" => Ok(Self::Running),
            "STOPPED" => Ok(Self::Stopped),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            _ => Err(Error::InvalidArgument(format!("unknown sync status: {s}"))),
        }
    }

    /// Whether a run has ended in this status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict policy between local edits and incoming server data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeMode {
    /// Server data always wins on sync down; local data always wins on sync up.
    #[default]
    Overwrite,
    /// Records changed on both sides are left untouched.
    LeaveIfChanged,
}

/// Options attached to a sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    #[serde(default)]
    pub merge_mode: MergeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fieldlist: Option<Vec<String>>,
}

impl SyncOptions {
    /// Options with the given merge mode and no field list.
    #[must_use]
    pub fn with_merge_mode(merge_mode: MergeMode) -> Self {
        Self {
            merge_mode,
            fieldlist: None,
        }
    }

    /// Options for a sync up that sends only `fieldlist`.
    #[must_use]
    pub fn with_fieldlist(merge_mode: MergeMode, fieldlist: Vec<String>) -> Self {
        Self {
            merge_mode,
            fieldlist: Some(fieldlist),
        }
    }
}

fn unknown() -> i64 {
    UNKNOWN_TIME_STAMP
}

/// A persisted sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Job id; the entry id of the descriptor in the syncs soup.
    #[serde(rename = "_soupEntryId", default)]
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub sync_type: SyncType,
    /// Serialized target; see [`SyncState::down_target`] / [`SyncState::up_target`].
    pub target: Value,
    #[serde(default)]
    pub options: SyncOptions,
    pub soup_name: String,
    pub status: SyncStatus,
    #[serde(default)]
    pub progress: i32,
    #[serde(default = "unknown")]
    pub total_size: i64,
    #[serde(default = "unknown")]
    pub max_time_stamp: i64,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncState {
    /// Build a fresh descriptor in the `NEW` status. The id is assigned when
    /// the descriptor is first saved.
    #[must_use]
    pub fn new(
        sync_type: SyncType,
        target: Value,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> Self {
        Self {
            id: 0,
            name: name.map(str::to_string),
            sync_type,
            target,
            options,
            soup_name: soup_name.to_string(),
            status: SyncStatus::New,
            progress: 0,
            total_size: UNKNOWN_TIME_STAMP,
            max_time_stamp: UNKNOWN_TIME_STAMP,
            start_time: 0,
            end_time: 0,
            error: None,
        }
    }

    /// Parse a descriptor read back from the syncs soup.
    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Serialize for storage.
    pub fn to_json(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if self.id == 0 {
            if let Some(obj) = value.as_object_mut() {
                obj.remove("_soupEntryId");
            }
        }
        Ok(value)
    }

    /// Deserialize the target of a sync down.
    pub fn down_target(&self) -> Result<SyncDownTarget> {
        if self.sync_type != SyncType::Down {
            return Err(Error::InvalidArgument(format!(
                "sync {} is not a sync down",
                self.id
            )));
        }
        Ok(serde_json::from_value(self.target.clone())?)
    }

    /// Deserialize the target of a sync up.
    pub fn up_target(&self) -> Result<SyncUpTarget> {
        if self.sync_type != SyncType::Up {
            return Err(Error::InvalidArgument(format!(
                "sync {} is not a sync up",
                self.id
            )));
        }
        Ok(serde_json::from_value(self.target.clone())?)
    }

    /// Merge mode from the options.
    #[must_use]
    pub fn merge_mode(&self) -> MergeMode {
        self.options.merge_mode
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == SyncStatus::Done
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == SyncStatus::Running
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.status == SyncStatus::Stopped
    }

    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.status == SyncStatus::Failed
    }
}
