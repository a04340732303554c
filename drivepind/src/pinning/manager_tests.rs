use super::*;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

use drivepin_core::{ChangeType, EventState, FileChange, ItemEvent, SyncingStatus};
use futures_util::future::BoxFuture;

use crate::pinning::progress::BLOCK_SIZE;

type Page = Result<Vec<QueryItem>, ServiceError>;

#[derive(Default)]
struct FakeDrive {
    pages: Mutex<VecDeque<Page>>,
    items: Mutex<BTreeMap<Id, FileMetadata>>,
    failing_pins: Mutex<HashSet<Id>>,
    ignored_pins: Mutex<HashSet<Id>>,
    pin_requests: Mutex<Vec<Id>>,
    metadata_requests: Mutex<Vec<Id>>,
    listings: Mutex<Vec<QueryParameters>>,
}

impl FakeDrive {
    fn with_items(items: Vec<QueryItem>) -> Arc<Self> {
        let drive = Self::default();
        for item in &items {
            drive
                .items
                .lock()
                .unwrap()
                .insert(item.metadata.stable_id, item.metadata.clone());
        }
        drive.pages.lock().unwrap().push_back(Ok(items));
        Arc::new(drive)
    }

    fn set_available_offline(&self, id: i64) {
        if let Some(md) = self.items.lock().unwrap().get_mut(&Id(id)) {
            md.available_offline = true;
        }
    }

    fn pin_requests(&self) -> Vec<Id> {
        self.pin_requests.lock().unwrap().clone()
    }

    fn metadata_requests(&self) -> Vec<Id> {
        self.metadata_requests.lock().unwrap().clone()
    }
}

struct FakeListing {
    pages: VecDeque<Page>,
}

impl Listing for FakeListing {
    async fn next_page(&mut self) -> Result<Vec<QueryItem>, ServiceError> {
        self.pages.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

impl FileService for FakeDrive {
    type Listing = FakeListing;

    fn start_listing(&self, query: QueryParameters) -> FakeListing {
        self.listings.lock().unwrap().push(query);
        FakeListing {
            pages: std::mem::take(&mut *self.pages.lock().unwrap()),
        }
    }

    async fn pin_by_id(&self, id: Id, pinned: bool) -> Result<(), ServiceError> {
        self.pin_requests.lock().unwrap().push(id);
        if self.failing_pins.lock().unwrap().contains(&id) {
            return Err(ServiceError::Failed("pin rejected".to_string()));
        }
        if self.ignored_pins.lock().unwrap().contains(&id) {
            return Ok(());
        }
        if let Some(md) = self.items.lock().unwrap().get_mut(&id) {
            md.pinned = pinned;
        }
        Ok(())
    }

    async fn metadata_by_id(&self, id: Id) -> Result<FileMetadata, ServiceError> {
        self.metadata_requests.lock().unwrap().push(id);
        self.items
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(ServiceError::NotFound(id))
    }
}

fn metadata(id: i64, item_type: ItemType, size: i64) -> FileMetadata {
    FileMetadata {
        stable_id: Id(id),
        item_type,
        size,
        can_pin: true,
        ..FileMetadata::default()
    }
}

fn file(id: i64, path: &str, size: i64) -> QueryItem {
    QueryItem {
        path: path.to_string(),
        metadata: metadata(id, ItemType::File, size),
    }
}

fn hosted(id: i64, path: &str) -> QueryItem {
    QueryItem {
        path: path.to_string(),
        metadata: metadata(id, ItemType::Hosted, 0),
    }
}

fn fixed_space(free: io::Result<u64>, queried: Arc<Mutex<Vec<PathBuf>>>) -> SpaceGetter {
    let free = free.map_err(|err| (err.kind(), err.to_string()));
    Arc::new(move |path: PathBuf| -> BoxFuture<'static, io::Result<u64>> {
        queried.lock().unwrap().push(path);
        let result = free
            .clone()
            .map_err(|(kind, message)| io::Error::new(kind, message));
        Box::pin(async move { result })
    })
}

struct Harness {
    manager: PinManager<FakeDrive>,
    completed: Arc<Mutex<Vec<Stage>>>,
    queried: Arc<Mutex<Vec<PathBuf>>>,
}

fn harness(drive: &Arc<FakeDrive>, free: io::Result<u64>, options: PinningOptions) -> Harness {
    let mut manager = PinManager::with_options("/profile", Arc::clone(drive), options);
    let queried = Arc::new(Mutex::new(Vec::new()));
    manager.set_space_getter(fixed_space(free, Arc::clone(&queried)));

    let completed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&completed);
    manager.set_completion_callback(move |stage| sink.lock().unwrap().push(stage));

    Harness {
        manager,
        completed,
        queried,
    }
}

fn quiet_options() -> PinningOptions {
    PinningOptions {
        check_stalled_files: false,
        ..PinningOptions::default()
    }
}

async fn run_until_syncing(manager: &mut PinManager<FakeDrive>) {
    while matches!(
        manager.progress().stage,
        Stage::GettingFreeSpace | Stage::ListingFiles
    ) {
        manager.process_next().await;
    }
}

async fn run_to_completion(manager: &mut PinManager<FakeDrive>) -> Stage {
    while manager.progress().stage.in_progress() {
        manager.process_next().await;
    }
    manager.progress().stage
}

fn event(id: i64, path: &str, state: EventState, transferred: i64, total: i64) -> ItemEvent {
    ItemEvent {
        stable_id: Id(id),
        path: path.to_string(),
        state,
        bytes_transferred: transferred,
        bytes_to_transfer: total,
    }
}

fn status(events: Vec<ItemEvent>) -> PushEvent {
    PushEvent::SyncingStatus(SyncingStatus {
        item_events: events,
    })
}

#[derive(Default)]
struct Recorder {
    stages: Mutex<Vec<Stage>>,
    dropped: Mutex<bool>,
}

impl Observer for Recorder {
    fn on_progress(&self, progress: &Progress) {
        self.stages.lock().unwrap().push(progress.stage);
    }

    fn on_drop(&self) {
        *self.dropped.lock().unwrap() = true;
    }
}

#[test]
fn skips_items_that_cannot_be_pinned() {
    let dir = QueryItem {
        path: "/dir".to_string(),
        metadata: metadata(1, ItemType::Directory, 0),
    };
    assert!(!can_pin_item(&dir.metadata, &dir.path));

    let shortcut = file(2, "/shortcut", 0);
    assert!(!can_pin_item(&shortcut.metadata, &shortcut.path));

    let mut pinned = file(3, "/pinned", 10);
    pinned.metadata.pinned = true;
    assert!(!can_pin_item(&pinned.metadata, &pinned.path));

    let mut locked = file(4, "/locked", 10);
    locked.metadata.can_pin = false;
    assert!(!can_pin_item(&locked.metadata, &locked.path));

    let doc = hosted(5, "/doc");
    assert!(can_pin_item(&doc.metadata, &doc.path));
    assert_eq!(item_size(&doc.metadata), HOSTED_FILE_SIZE);

    let negative = file(7, "/negative", -1);
    assert!(!can_pin_item(&negative.metadata, &negative.path));

    let plain = file(6, "/plain", 10);
    assert!(can_pin_item(&plain.metadata, &plain.path));
    assert_eq!(item_size(&plain.metadata), 10);
}

#[tokio::test]
async fn cannot_get_free_space() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    let mut h = harness(
        &drive,
        Err(io::Error::new(io::ErrorKind::NotFound, "no such directory")),
        quiet_options(),
    );

    h.manager.start();
    assert_eq!(h.manager.progress().stage, Stage::GettingFreeSpace);

    assert_eq!(run_to_completion(&mut h.manager).await, Stage::CannotGetFreeSpace);
    assert_eq!(*h.completed.lock().unwrap(), vec![Stage::CannotGetFreeSpace]);
    assert_eq!(*h.queried.lock().unwrap(), vec![PathBuf::from("/profile/GCache")]);
    assert!(drive.listings.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cannot_list_files() {
    let drive = Arc::new(FakeDrive::default());
    drive
        .pages
        .lock()
        .unwrap()
        .push_back(Err(ServiceError::Failed("listing broke".to_string())));
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.start();
    assert_eq!(run_to_completion(&mut h.manager).await, Stage::CannotListFiles);
    assert_eq!(*h.completed.lock().unwrap(), vec![Stage::CannotListFiles]);
    assert_eq!(
        *drive.listings.lock().unwrap(),
        vec![QueryParameters { page_size: 1000 }]
    );
}

#[tokio::test]
async fn not_enough_space() {
    let drive = FakeDrive::with_items(vec![
        file(1, "/a", 300 << 20),
        file(2, "/b", 212 << 20),
        file(3, "/c", 1),
    ]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.start();
    assert_eq!(run_to_completion(&mut h.manager).await, Stage::NotEnoughSpace);

    let progress = h.manager.progress();
    assert_eq!(progress.free_space, 1 << 30);
    assert_eq!(progress.required_space, (512 << 20) + BLOCK_SIZE);
    assert_eq!(progress.files_to_pin, 3);
    assert!(drive.pin_requests().is_empty());
    assert!(h.manager.tracker().is_idle());
}

#[tokio::test]
async fn just_checks_required_space_when_not_pinning() {
    let drive = FakeDrive::with_items(vec![
        file(1, "/a", 300 << 20),
        file(2, "/b", 212 << 20),
        hosted(3, "/doc"),
        QueryItem {
            path: "/dir".to_string(),
            metadata: metadata(4, ItemType::Directory, 0),
        },
    ]);
    let mut h = harness(&drive, Ok(2 << 30), quiet_options());
    h.manager.should_pin(false);

    h.manager.start();
    assert_eq!(run_to_completion(&mut h.manager).await, Stage::Success);

    let progress = h.manager.progress();
    assert_eq!(progress.required_space, (512 << 20) + 2 * BLOCK_SIZE);
    assert_eq!(progress.bytes_to_pin, (512 << 20) + HOSTED_FILE_SIZE);
    assert_eq!(progress.files_to_pin, 3);
    assert_eq!(progress.pinned_files, 0);
    assert!(drive.pin_requests().is_empty());
    assert_eq!(*h.completed.lock().unwrap(), vec![Stage::Success]);
}

#[tokio::test]
async fn free_space_equal_to_the_budget_is_enough() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 300 << 20), file(2, "/b", 212 << 20)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());
    h.manager.should_pin(false);

    h.manager.start();
    assert_eq!(run_to_completion(&mut h.manager).await, Stage::Success);

    let progress = h.manager.progress();
    assert_eq!(progress.free_space, 1 << 30);
    assert_eq!(progress.required_space, 512 << 20);
    assert_eq!(progress.pinned_files, 0);
    assert!(drive.pin_requests().is_empty());
}

#[tokio::test]
async fn one_byte_short_of_the_budget_is_not_enough() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 300 << 20), file(2, "/b", 212 << 20)]);
    let mut h = harness(&drive, Ok((1 << 30) - 1), quiet_options());
    h.manager.should_pin(false);

    h.manager.start();
    assert_eq!(run_to_completion(&mut h.manager).await, Stage::NotEnoughSpace);
    assert_eq!(h.manager.progress().required_space, 512 << 20);
}

#[tokio::test]
async fn skips_items_with_a_negative_size() {
    let drive = FakeDrive::with_items(vec![file(1, "/neg", -5), file(2, "/ok", 10)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());
    h.manager.should_pin(false);

    h.manager.start();
    assert_eq!(run_to_completion(&mut h.manager).await, Stage::Success);

    let progress = h.manager.progress();
    assert_eq!(progress.files_to_pin, 1);
    assert_eq!(progress.bytes_to_pin, 10);
    assert_eq!(progress.required_space, BLOCK_SIZE);
}

#[tokio::test]
async fn huge_items_saturate_the_budget() {
    let drive = FakeDrive::with_items(vec![file(1, "/huge", i64::MAX), file(2, "/more", i64::MAX)]);
    let mut h = harness(&drive, Ok(1 << 40), quiet_options());

    h.manager.start();
    assert_eq!(run_to_completion(&mut h.manager).await, Stage::NotEnoughSpace);

    let progress = h.manager.progress();
    assert_eq!(progress.files_to_pin, 2);
    assert_eq!(progress.bytes_to_pin, i64::MAX);
    assert_eq!(progress.required_space, i64::MAX);
    assert!(drive.pin_requests().is_empty());
}

#[tokio::test]
async fn succeeds_right_away_with_nothing_to_pin() {
    let drive = Arc::new(FakeDrive::default());
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.start();
    assert_eq!(run_to_completion(&mut h.manager).await, Stage::Success);
    assert!(drive.pin_requests().is_empty());
}

#[tokio::test]
async fn events_after_completion_in_the_same_batch_are_not_counted() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.start();
    run_until_syncing(&mut h.manager).await;

    h.manager.on_push_event(status(vec![
        event(1, "/a", EventState::Completed, 10, 10),
        event(1, "/a", EventState::Completed, 10, 10),
        event(2, "/other", EventState::InProgress, 1, 10),
    ]));

    let progress = h.manager.progress();
    assert_eq!(progress.stage, Stage::Success);
    assert_eq!(progress.pinned_files, 1);
    assert_eq!(progress.useful_events, 1);
    assert_eq!(progress.duplicated_events, 0);
    assert_eq!(*h.completed.lock().unwrap(), vec![Stage::Success]);
}

#[tokio::test]
async fn events_drive_the_run_to_success() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10000)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    assert_eq!(h.manager.progress().stage, Stage::Syncing);
    assert_eq!(h.manager.tracker().files_to_track().len(), 1);
    assert!(h.manager.tracker().files_to_pin().is_empty());

    h.manager
        .on_push_event(status(vec![event(1, "/a", EventState::Queued, 0, 0)]));
    h.manager.on_push_event(status(vec![
        event(1, "/a", EventState::InProgress, 5000, 10000),
        event(1, "/a", EventState::InProgress, 5000, 10000),
    ]));
    assert_eq!(h.manager.progress().pinned_bytes, 5000);
    assert_eq!(h.manager.progress().stage, Stage::Syncing);

    h.manager.on_push_event(status(vec![event(
        1,
        "/a",
        EventState::Completed,
        10000,
        10000,
    )]));

    let progress = h.manager.progress();
    assert_eq!(progress.stage, Stage::Success);
    assert_eq!(progress.pinned_bytes, 10000);
    assert_eq!(progress.pinned_files, 1);
    assert_eq!(progress.useful_events, 3);
    assert_eq!(progress.duplicated_events, 1);
    assert_eq!(*h.completed.lock().unwrap(), vec![Stage::Success]);

    h.manager
        .on_push_event(status(vec![event(1, "/a", EventState::Completed, 0, 0)]));
    assert_eq!(h.manager.progress(), progress);
}

#[tokio::test]
async fn queued_event_ignores_reported_total() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10000)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.start();
    run_until_syncing(&mut h.manager).await;

    assert!(h.manager.on_syncing_event(&event(1, "/a", EventState::Queued, 0, 0)));
    assert_eq!(h.manager.progress().bytes_to_pin, 10000);
    assert!(!h.manager.on_syncing_event(&event(1, "/a", EventState::Queued, 0, 0)));
    assert!(!h.manager.on_syncing_event(&event(9, "/z", EventState::InProgress, 1, 2)));
    assert!(!h.manager.on_syncing_event(&event(1, "/a", EventState::Unknown, 1, 2)));
}

#[tokio::test]
async fn failed_event_counts_a_failure() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10000), file(2, "/b", 20)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.start();
    run_until_syncing(&mut h.manager).await;

    h.manager.on_push_event(status(vec![
        event(1, "/a", EventState::InProgress, 4000, 10000),
        event(1, "/a", EventState::Failed, -1, -1),
    ]));

    let progress = h.manager.progress();
    assert_eq!(progress.failed_files, 1);
    assert_eq!(progress.pinned_bytes, 0);
    assert_eq!(progress.bytes_to_pin, 20);
    assert_eq!(progress.stage, Stage::Syncing);

    h.manager
        .on_push_event(status(vec![event(2, "/b", EventState::Completed, -1, -1)]));
    assert_eq!(h.manager.progress().stage, Stage::Success);
    assert_eq!(h.manager.progress().pinned_files, 1);
}

#[tokio::test]
async fn rejected_pin_counts_a_failure() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10), file(2, "/b", 20)]);
    drive.failing_pins.lock().unwrap().insert(Id(1));
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    h.manager.process_next().await;
    h.manager.process_next().await;

    assert_eq!(drive.pin_requests().len(), 2);
    assert_eq!(h.manager.progress().failed_files, 1);
    assert!(!h.manager.tracker().is_tracked(Id(1)));
    assert!(h.manager.tracker().is_tracked(Id(2)));

    h.manager
        .on_push_event(status(vec![event(2, "/b", EventState::Completed, -1, -1)]));
    assert_eq!(h.manager.progress().stage, Stage::Success);
}

#[tokio::test]
async fn pins_in_batches_up_to_the_in_flight_limit() {
    let items = (1..=5).map(|id| file(id, &format!("/f{id}"), 10)).collect();
    let drive = FakeDrive::with_items(items);
    let options = PinningOptions {
        max_in_flight: 2,
        ..quiet_options()
    };
    let mut h = harness(&drive, Ok(1 << 30), options);

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    assert_eq!(h.manager.tracker().files_to_track().len(), 2);
    assert_eq!(h.manager.tracker().files_to_pin().len(), 3);

    h.manager
        .on_push_event(status(vec![event(1, "/f1", EventState::Completed, -1, -1)]));
    assert_eq!(h.manager.tracker().files_to_track().len(), 2);
    assert_eq!(h.manager.tracker().files_to_pin().len(), 2);
    assert!(h.manager.tracker().is_tracked(Id(3)));

    for id in 2..=5 {
        let path = format!("/f{id}");
        h.manager
            .on_push_event(status(vec![event(id, &path, EventState::Completed, -1, -1)]));
    }
    assert_eq!(h.manager.progress().stage, Stage::Success);
    assert_eq!(h.manager.progress().pinned_files, 5);
    assert_eq!(h.manager.progress().pinned_bytes, 50);
}

#[tokio::test(start_paused = true)]
async fn stalled_sweep_completes_items_without_events() {
    let mut doc = hosted(2, "/doc");
    doc.metadata.available_offline = true;
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10), doc]);
    let mut h = harness(&drive, Ok(1 << 30), PinningOptions::default());

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    h.manager.on_push_event(status(vec![
        event(1, "/a", EventState::Queued, 0, 0),
        event(1, "/a", EventState::InProgress, 5, 10),
        event(1, "/a", EventState::Completed, 10, 10),
    ]));
    assert_eq!(h.manager.progress().stage, Stage::Syncing);

    assert_eq!(run_to_completion(&mut h.manager).await, Stage::Success);
    assert_eq!(drive.metadata_requests(), vec![Id(2)]);

    let progress = h.manager.progress();
    assert_eq!(progress.pinned_files, 2);
    assert_eq!(progress.pinned_bytes, 10 + HOSTED_FILE_SIZE);
    assert_eq!(progress.failed_files, 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_item_stays_tracked_until_available_offline() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    let mut h = harness(&drive, Ok(1 << 30), PinningOptions::default());

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    while drive.metadata_requests().is_empty() {
        h.manager.process_next().await;
    }

    assert_eq!(h.manager.progress().stage, Stage::Syncing);
    assert!(h.manager.tracker().is_tracked(Id(1)));

    drive.set_available_offline(1);
    assert_eq!(run_to_completion(&mut h.manager).await, Stage::Success);
    assert_eq!(drive.metadata_requests(), vec![Id(1), Id(1)]);
    assert_eq!(h.manager.progress().pinned_bytes, 10);
}

#[tokio::test(start_paused = true)]
async fn unexpectedly_unpinned_item_fails() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    drive.ignored_pins.lock().unwrap().insert(Id(1));
    let mut h = harness(&drive, Ok(1 << 30), PinningOptions::default());

    h.manager.start();
    assert_eq!(run_to_completion(&mut h.manager).await, Stage::Success);
    assert_eq!(h.manager.progress().failed_files, 1);
    assert_eq!(h.manager.progress().pinned_files, 0);
}

#[tokio::test(start_paused = true)]
async fn vanished_item_fails() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    let mut h = harness(&drive, Ok(1 << 30), PinningOptions::default());

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    drive.items.lock().unwrap().clear();

    assert_eq!(run_to_completion(&mut h.manager).await, Stage::Success);
    assert_eq!(h.manager.progress().failed_files, 1);
}

#[tokio::test]
async fn file_change_renames_and_checks_metadata() {
    let mut item = file(1, "/a", 10);
    item.metadata.available_offline = true;
    let drive = FakeDrive::with_items(vec![item]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.on_push_event(PushEvent::FilesChanged {
        changes: vec![FileChange {
            stable_id: Id(1),
            path: "/ignored".to_string(),
            change_type: ChangeType::Modify,
        }],
    });

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    h.manager.process_next().await;
    assert_eq!(drive.pin_requests(), vec![Id(1)]);

    h.manager.on_push_event(PushEvent::FilesChanged {
        changes: vec![
            FileChange {
                stable_id: Id(1),
                path: "/renamed".to_string(),
                change_type: ChangeType::Modify,
            },
            FileChange {
                stable_id: Id(7),
                path: "/other".to_string(),
                change_type: ChangeType::Create,
            },
        ],
    });
    assert_eq!(h.manager.tracker().files_to_track()[&Id(1)].path, "/renamed");

    assert_eq!(run_to_completion(&mut h.manager).await, Stage::Success);
    assert_eq!(drive.metadata_requests(), vec![Id(1)]);
    assert_eq!(h.manager.progress().pinned_files, 1);
}

#[tokio::test]
async fn stop_discards_pending_results() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    drive.failing_pins.lock().unwrap().insert(Id(1));
    let mut h = harness(&drive, Ok(1 << 30), PinningOptions::default());

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    h.manager.stop();

    assert_eq!(h.manager.progress().stage, Stage::Stopped);
    assert!(h.manager.tracker().is_idle());
    assert_eq!(*h.completed.lock().unwrap(), vec![Stage::Stopped]);

    h.manager.process_next().await;
    assert_eq!(h.manager.progress().failed_files, 0);

    h.manager.stop();
    h.manager
        .on_push_event(status(vec![event(1, "/a", EventState::Completed, -1, -1)]));
    assert_eq!(h.manager.progress().stage, Stage::Stopped);
    assert_eq!(h.manager.progress().pinned_files, 0);
    assert_eq!(h.completed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn start_while_running_is_ignored() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    h.manager.start();

    assert_eq!(h.manager.progress().stage, Stage::Syncing);
    assert!(h.manager.tracker().is_tracked(Id(1)));
    assert_eq!(h.queried.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn enable_toggles_the_run() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.enable(false);
    assert_eq!(h.manager.progress().stage, Stage::NotStarted);

    h.manager.enable(true);
    assert_eq!(h.manager.progress().stage, Stage::GettingFreeSpace);
    h.manager.enable(true);
    assert_eq!(h.queried.lock().unwrap().len(), 1);

    h.manager.enable(false);
    assert_eq!(h.manager.progress().stage, Stage::Stopped);
}

#[tokio::test]
async fn restart_after_stop_begins_a_fresh_run() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());

    h.manager.start();
    h.manager.stop();

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    assert_eq!(h.manager.progress().stage, Stage::Syncing);
    assert_eq!(h.manager.progress().files_to_pin, 1);
    assert_eq!(drive.listings.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn observers_see_every_stage_and_the_drop() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());
    let recorder = Arc::new(Recorder::default());
    h.manager.add_observer(&recorder);

    h.manager.start();
    run_until_syncing(&mut h.manager).await;
    h.manager
        .on_push_event(status(vec![event(1, "/a", EventState::Completed, -1, -1)]));

    let stages = recorder.stages.lock().unwrap().clone();
    assert_eq!(stages.first(), Some(&Stage::GettingFreeSpace));
    assert!(stages.contains(&Stage::ListingFiles));
    assert!(stages.contains(&Stage::Syncing));
    assert_eq!(stages.last(), Some(&Stage::Success));

    drop(h);
    assert!(*recorder.dropped.lock().unwrap());
}

#[tokio::test]
async fn removed_observer_is_not_notified() {
    let drive = Arc::new(FakeDrive::default());
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());
    let recorder = Arc::new(Recorder::default());
    h.manager.add_observer(&recorder);
    h.manager.remove_observer(&recorder);

    h.manager.start();
    run_to_completion(&mut h.manager).await;
    drop(h);

    assert!(recorder.stages.lock().unwrap().is_empty());
    assert!(!*recorder.dropped.lock().unwrap());
}

#[tokio::test]
async fn run_serves_commands_until_the_run_ends() {
    let drive = Arc::new(FakeDrive::default());
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());
    let (handle, mut commands) = PinManagerHandle::channel();

    assert!(handle.start());
    assert_eq!(h.manager.run(&mut commands).await, Stage::Success);
}

#[tokio::test]
async fn run_answers_progress_queries_and_stops() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());
    let (handle, mut commands) = PinManagerHandle::channel();
    handle.start();

    let client = handle.clone();
    let watcher = tokio::spawn(async move {
        let progress = client.progress().await;
        client.stop();
        progress
    });

    assert_eq!(h.manager.run(&mut commands).await, Stage::Stopped);
    let progress = watcher.await.unwrap().unwrap();
    assert!(progress.stage.in_progress());
    assert_eq!(*h.completed.lock().unwrap(), vec![Stage::Stopped]);
}

#[tokio::test]
async fn run_stops_when_every_handle_is_gone() {
    let drive = FakeDrive::with_items(vec![file(1, "/a", 10)]);
    let mut h = harness(&drive, Ok(1 << 30), quiet_options());
    let (handle, mut commands) = PinManagerHandle::channel();
    handle.start();
    drop(handle);

    assert_eq!(h.manager.run(&mut commands).await, Stage::Stopped);
}
