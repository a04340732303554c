mod client;
mod types;

pub use client::{DriveApiError, DriveClient, EventStream, ListingPage};
pub use types::{
    ChangeType, DriveError, DriveErrorType, EventState, FileChange, FileMetadata, Id, ItemEvent,
    ItemType, PushEvent, QueryItem, QueryParameters, SyncingStatus,
};
