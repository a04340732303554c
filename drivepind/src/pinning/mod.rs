//! Bulk pinning of every item of the drive for offline use.

mod manager;
mod observer;
mod progress;
mod reconcile;
mod service;
mod tracker;

pub use manager::{
    Command, CompletionCallback, MIN_FREE_SPACE, PinManager, PinManagerHandle, PinningOptions,
    can_pin_item, item_size,
};
pub use observer::Observer;
pub use progress::{
    BLOCK_SIZE, File, HOSTED_FILE_SIZE, HumanReadableSize, Progress, Stage, round_to_block,
};
pub use service::{
    DriveListing, FileService, Listing, ServiceError, SpaceGetter, default_space_getter,
    get_free_space,
};
pub use tracker::{Files, ProgressTracker};
