use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier the file service assigns to an item.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Id(pub i64);

impl Id {
    /// Reserved value, never assigned to a live item.
    pub const NONE: Id = Id(0);

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id(value)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    #[default]
    File,
    /// Document that lives on the service and has no real byte size.
    Hosted,
    Directory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub stable_id: Id,
    #[serde(rename = "type", default)]
    pub item_type: ItemType,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub available_offline: bool,
    #[serde(default = "default_can_pin")]
    pub can_pin: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub starred: bool,
}

fn default_can_pin() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryItem {
    pub path: String,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParameters {
    pub page_size: u32,
}

impl Default for QueryParameters {
    fn default() -> Self {
        Self { page_size: 1000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Queued,
    InProgress,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventState::Queued => "Queued",
            EventState::InProgress => "InProgress",
            EventState::Completed => "Completed",
            EventState::Failed => "Failed",
            EventState::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Transfer status of a single item. Byte counts are negative when the
/// service does not know them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemEvent {
    pub stable_id: Id,
    pub path: String,
    pub state: EventState,
    #[serde(default = "unknown_bytes")]
    pub bytes_transferred: i64,
    #[serde(default = "unknown_bytes")]
    pub bytes_to_transfer: i64,
}

fn unknown_bytes() -> i64 {
    -1
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncingStatus {
    #[serde(default)]
    pub item_events: Vec<ItemEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Delete,
    Modify,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub stable_id: Id,
    pub path: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveErrorType {
    CantUploadStorageFull,
    PinningFailedDiskFull,
    CantUploadStorageFullOrganization,
    CantUploadSharedDriveStorageFull,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveError {
    #[serde(rename = "type")]
    pub error_type: DriveErrorType,
    pub stable_id: Id,
    pub path: String,
}

/// One message of the service's push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushEvent {
    SyncingStatus(SyncingStatus),
    FilesChanged { changes: Vec<FileChange> },
    Unmounted,
    Error(DriveError),
    #[serde(other)]
    Unknown,
}
