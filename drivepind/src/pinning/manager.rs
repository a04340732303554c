use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use drivepin_core::{FileMetadata, Id, ItemType, PushEvent, QueryItem, QueryParameters};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use super::observer::{Observer, ObserverList};
use super::progress::{HOSTED_FILE_SIZE, HumanReadableSize, Progress, Stage, percentage};
use super::service::{FileService, Listing, ServiceError, SpaceGetter, default_space_getter};
use super::tracker::ProgressTracker;

/// Free space that must remain after everything is pinned.
pub const MIN_FREE_SPACE: i64 = 512 << 20;

#[derive(Debug, Clone)]
pub struct PinningOptions {
    pub page_size: u32,
    /// Upper bound on items with an outstanding pin request.
    pub max_in_flight: usize,
    pub stalled_check_interval: Duration,
    pub min_free_space: i64,
    pub should_pin: bool,
    pub check_stalled_files: bool,
}

impl Default for PinningOptions {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_in_flight: 50,
            stalled_check_interval: Duration::from_secs(10),
            min_free_space: MIN_FREE_SPACE,
            should_pin: true,
            check_stalled_files: true,
        }
    }
}

pub type CompletionCallback = Box<dyn FnOnce(Stage) + Send>;

/// Requests an owner can send to a running [`PinManager`].
#[derive(Debug)]
pub enum Command {
    Start,
    Stop,
    Enable(bool),
    GetProgress(oneshot::Sender<Progress>),
    Push(PushEvent),
}

#[derive(Clone)]
pub struct PinManagerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl PinManagerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn start(&self) -> bool {
        self.tx.send(Command::Start).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.tx.send(Command::Stop).is_ok()
    }

    pub fn enable(&self, enabled: bool) -> bool {
        self.tx.send(Command::Enable(enabled)).is_ok()
    }

    pub fn push(&self, event: PushEvent) -> bool {
        self.tx.send(Command::Push(event)).is_ok()
    }

    pub async fn progress(&self) -> Option<Progress> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::GetProgress(reply)).ok()?;
        rx.await.ok()
    }
}

/// Result of an asynchronous operation, posted back to the manager.
enum Message<L> {
    FreeSpace {
        generation: u64,
        result: io::Result<u64>,
    },
    Page {
        generation: u64,
        listing: L,
        result: Result<Vec<QueryItem>, ServiceError>,
    },
    Pinned {
        generation: u64,
        id: Id,
        path: String,
        result: Result<(), ServiceError>,
    },
    Metadata {
        generation: u64,
        id: Id,
        path: String,
        result: Result<FileMetadata, ServiceError>,
    },
    CheckStalledFiles {
        generation: u64,
    },
}

impl<L> Message<L> {
    fn generation(&self) -> u64 {
        match self {
            Message::FreeSpace { generation, .. }
            | Message::Page { generation, .. }
            | Message::Pinned { generation, .. }
            | Message::Metadata { generation, .. }
            | Message::CheckStalledFiles { generation } => *generation,
        }
    }
}

enum Input<L> {
    Message(Message<L>),
    Command(Option<Command>),
}

/// Makes every item of the drive available offline.
///
/// A run goes through `GettingFreeSpace`, `ListingFiles` and `Syncing` and
/// ends in one of the terminal stages. All state is owned by the manager and
/// mutated through `&mut self`; asynchronous work runs in spawned tasks whose
/// results come back through an internal channel and are applied by
/// [`process_next`](Self::process_next) or [`run`](Self::run). Results that
/// belong to an earlier run are discarded.
pub struct PinManager<S: FileService> {
    profile_path: PathBuf,
    service: Arc<S>,
    space_getter: SpaceGetter,
    pub(super) options: PinningOptions,
    pub(super) tracker: ProgressTracker,
    observers: ObserverList,
    completion: Option<CompletionCallback>,
    generation: u64,
    timer: Instant,
    stall_timer: Option<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<Message<S::Listing>>,
    rx: mpsc::UnboundedReceiver<Message<S::Listing>>,
}

impl<S: FileService> PinManager<S> {
    pub fn new(profile_path: impl Into<PathBuf>, service: Arc<S>) -> Self {
        Self::with_options(profile_path, service, PinningOptions::default())
    }

    pub fn with_options(
        profile_path: impl Into<PathBuf>,
        service: Arc<S>,
        options: PinningOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            profile_path: profile_path.into(),
            service,
            space_getter: default_space_getter(),
            options,
            tracker: ProgressTracker::new(),
            observers: ObserverList::default(),
            completion: None,
            generation: 0,
            timer: Instant::now(),
            stall_timer: None,
            tx,
            rx,
        }
    }

    pub fn progress(&self) -> Progress {
        *self.tracker.progress()
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn add_observer<O: Observer + 'static>(&mut self, observer: &Arc<O>) {
        self.observers.add(observer);
    }

    pub fn remove_observer<O: Observer + 'static>(&mut self, observer: &Arc<O>) {
        self.observers.remove(observer);
    }

    /// Called once with the terminal stage of the next run to finish.
    pub fn set_completion_callback(&mut self, callback: impl FnOnce(Stage) + Send + 'static) {
        self.completion = Some(Box::new(callback));
    }

    pub fn set_space_getter(&mut self, space_getter: SpaceGetter) {
        self.space_getter = space_getter;
    }

    /// With pinning disabled a run only checks that there is enough space.
    pub fn should_pin(&mut self, should_pin: bool) {
        self.options.should_pin = should_pin;
    }

    pub fn should_check_stalled_files(&mut self, check: bool) {
        self.options.check_stalled_files = check;
    }

    pub fn start(&mut self) {
        if self.tracker.stage().in_progress() {
            error!(stage = %self.tracker.stage(), "pin manager is already running");
            return;
        }

        self.tracker.reset();
        self.generation += 1;

        debug!("calculating free space");
        self.timer = Instant::now();
        self.tracker.set_stage(Stage::GettingFreeSpace);
        self.notify_progress();

        let generation = self.generation;
        let free_space = (self.space_getter)(self.profile_path.join("GCache"));
        self.post(async move {
            Message::FreeSpace {
                generation,
                result: free_space.await,
            }
        });
    }

    pub fn stop(&mut self) {
        if self.tracker.stage().in_progress() {
            info!("stopping");
            self.complete(Stage::Stopped);
        }
    }

    pub fn enable(&mut self, enabled: bool) {
        if enabled == self.tracker.stage().in_progress() {
            debug!(
                "pin manager is already {}",
                if enabled { "enabled" } else { "disabled" }
            );
            return;
        }

        if enabled {
            info!("starting");
            self.start();
        } else {
            self.stop();
        }
    }

    /// Waits for the next asynchronous result and applies it.
    pub async fn process_next(&mut self) {
        if let Some(message) = self.rx.recv().await {
            self.dispatch(message);
        }
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::Enable(enabled) => self.enable(enabled),
            Command::GetProgress(reply) => {
                let _ = reply.send(self.progress());
            }
            Command::Push(event) => self.on_push_event(event),
        }
    }

    /// Serves commands and asynchronous results until a started run reaches a
    /// terminal stage. Closing the command channel stops the run.
    pub async fn run(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Stage {
        loop {
            let stage = self.tracker.stage();
            if stage != Stage::NotStarted && !stage.in_progress() {
                return stage;
            }

            let input = tokio::select! {
                Some(message) = self.rx.recv() => Input::Message(message),
                command = commands.recv() => Input::Command(command),
            };

            match input {
                Input::Message(message) => self.dispatch(message),
                Input::Command(Some(command)) => self.handle_command(command),
                Input::Command(None) => {
                    debug!("command channel closed");
                    self.stop();
                    return self.tracker.stage();
                }
            }
        }
    }

    fn dispatch(&mut self, message: Message<S::Listing>) {
        if message.generation() != self.generation {
            trace!("discarded result of a finished run");
            return;
        }

        match message {
            Message::FreeSpace { result, .. } => self.on_free_space_retrieved(result),
            Message::Page {
                listing, result, ..
            } => self.on_search_result(listing, result),
            Message::Pinned {
                id, path, result, ..
            } => self.on_file_pinned(id, path, result),
            Message::Metadata {
                id, path, result, ..
            } => self.on_metadata_retrieved(id, path, result),
            Message::CheckStalledFiles { .. } => self.check_stalled_files(),
        }
    }

    fn post<F>(&self, task: F)
    where
        F: Future<Output = Message<S::Listing>> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let message = task.await;
            let _ = tx.send(message);
        });
    }

    fn on_free_space_retrieved(&mut self, result: io::Result<u64>) {
        let free_space = match result {
            Ok(bytes) => i64::try_from(bytes).unwrap_or(i64::MAX),
            Err(err) => {
                error!(error = %err, "cannot calculate free space");
                return self.complete(Stage::CannotGetFreeSpace);
            }
        };

        self.tracker.progress_mut().free_space = free_space;
        info!(
            free_space = %HumanReadableSize(free_space),
            elapsed_ms = self.timer.elapsed().as_millis() as u64,
            "calculated free space"
        );

        debug!("calculating required space");
        self.timer = Instant::now();
        self.tracker.set_stage(Stage::ListingFiles);
        self.notify_progress();

        let listing = self.service.start_listing(QueryParameters {
            page_size: self.options.page_size,
        });
        self.request_next_page(listing);
    }

    fn request_next_page(&self, mut listing: S::Listing) {
        let generation = self.generation;
        self.post(async move {
            let result = listing.next_page().await;
            Message::Page {
                generation,
                listing,
                result,
            }
        });
    }

    fn on_search_result(
        &mut self,
        listing: S::Listing,
        result: Result<Vec<QueryItem>, ServiceError>,
    ) {
        let items = match result {
            Ok(items) => items,
            Err(err) => {
                error!(error = %err, "cannot list files");
                return self.complete(Stage::CannotListFiles);
            }
        };

        if items.is_empty() {
            drop(listing);
            return self.start_pinning();
        }

        debug!(count = items.len(), "iterating over items for space calculation");
        for item in &items {
            let md = &item.metadata;
            let id = md.stable_id;
            trace!(%id, path = %item.path, metadata = ?md, "considering");

            if !can_pin_item(md, &item.path) {
                continue;
            }

            if md.available_offline {
                debug!(%id, path = %item.path, "not pinned yet but already available offline");
            }

            self.tracker.add(id, &item.path, item_size(md));
        }

        self.notify_progress();
        self.request_next_page(listing);
    }

    fn start_pinning(&mut self) {
        let progress = *self.tracker.progress();
        info!(
            required_space = %HumanReadableSize(progress.required_space),
            elapsed_ms = self.timer.elapsed().as_millis() as u64,
            "calculated required space"
        );
        debug!(
            free_space = %HumanReadableSize(progress.free_space),
            to_download = %HumanReadableSize(progress.bytes_to_pin),
            to_pin = self.tracker.files_to_pin().len(),
            to_track = self.tracker.files_to_track().len(),
            "space budget"
        );

        let margin = self.options.min_free_space;
        let required_with_margin = progress.required_space.saturating_add(margin);
        if progress.free_space < required_with_margin {
            error!(
                free_space = %HumanReadableSize(progress.free_space),
                required_space = %HumanReadableSize(progress.required_space),
                margin = %HumanReadableSize(margin),
                "not enough space"
            );
            return self.complete(Stage::NotEnoughSpace);
        }

        if !self.options.should_pin {
            info!("should not pin files");
            return self.complete(Stage::Success);
        }

        if self.tracker.is_idle() {
            info!("nothing to pin or track");
            return self.complete(Stage::Success);
        }

        info!(
            files = self.tracker.files_to_pin().len() + self.tracker.files_to_track().len(),
            "pinning and tracking files"
        );
        self.timer = Instant::now();
        self.tracker.set_stage(Stage::Syncing);
        self.notify_progress();

        if self.options.check_stalled_files {
            self.schedule_stalled_files_check();
        }

        self.pin_some_files();
    }

    /// Issues pin requests until the in-flight limit is reached, or finishes
    /// the run once nothing is left to pin or track.
    pub(super) fn pin_some_files(&mut self) {
        if self.tracker.stage() != Stage::Syncing {
            return;
        }

        if self.tracker.is_idle() {
            info!("nothing left to pin or track");
            return self.complete(Stage::Success);
        }

        let mut issued = 0usize;
        while self.tracker.files_to_track().len() < self.options.max_in_flight {
            let Some((id, path)) = self.tracker.start_tracking_next() else {
                break;
            };

            debug!(%id, %path, "pinning");
            let generation = self.generation;
            let service = Arc::clone(&self.service);
            self.post(async move {
                let result = service.pin_by_id(id, true).await;
                Message::Pinned {
                    generation,
                    id,
                    path,
                    result,
                }
            });
            issued += 1;
        }

        if issued > 0 {
            self.notify_progress();
        }

        let progress = self.tracker.progress();
        debug!(
            percent = percentage(progress.pinned_bytes, progress.bytes_to_pin),
            synced = %HumanReadableSize(progress.pinned_bytes),
            pinned_files = progress.pinned_files,
            syncing = self.tracker.files_to_track().len(),
            "progress"
        );
    }

    fn on_file_pinned(&mut self, id: Id, path: String, result: Result<(), ServiceError>) {
        if let Err(err) = result {
            error!(%id, %path, error = %err, "cannot pin");
            if self.tracker.remove(id, &path, Some(0)) {
                self.tracker.progress_mut().failed_files += 1;
                self.notify_progress();
                self.pin_some_files();
            }
            return;
        }

        debug!(%id, %path, "pinned");
    }

    pub(super) fn schedule_stalled_files_check(&mut self) {
        if let Some(previous) = self.stall_timer.take() {
            previous.abort();
        }

        let generation = self.generation;
        let interval = self.options.stalled_check_interval;
        let tx = self.tx.clone();
        self.stall_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(Message::CheckStalledFiles { generation });
        }));
    }

    pub(super) fn request_metadata(&self, id: Id, path: String) {
        let generation = self.generation;
        let service = Arc::clone(&self.service);
        self.post(async move {
            let result = service.metadata_by_id(id).await;
            Message::Metadata {
                generation,
                id,
                path,
                result,
            }
        });
    }

    pub(super) fn notify_progress(&mut self) {
        let progress = *self.tracker.progress();
        self.observers.notify(&progress);
    }

    /// Enters a terminal stage. Pending results of this run are discarded
    /// from here on.
    pub(super) fn complete(&mut self, stage: Stage) {
        debug_assert!(!stage.in_progress(), "{stage} is not a terminal stage");

        self.tracker.set_stage(stage);
        let progress = *self.tracker.progress();
        match stage {
            Stage::Success => {
                if progress.failed_files > 0 {
                    error!(failed_files = progress.failed_files, "failed to pin some files");
                }
                info!(
                    pinned_files = progress.pinned_files,
                    downloaded = %HumanReadableSize(progress.pinned_bytes),
                    elapsed_ms = self.timer.elapsed().as_millis() as u64,
                    "finished with success"
                );
                debug!(
                    useful_events = progress.useful_events,
                    duplicated_events = progress.duplicated_events,
                    "event statistics"
                );
            }
            Stage::Stopped => info!("stopped"),
            _ => error!(%stage, "finished with error"),
        }

        self.generation += 1;
        if let Some(timer) = self.stall_timer.take() {
            timer.abort();
        }
        self.tracker.clear_files();
        self.notify_progress();

        if let Some(callback) = self.completion.take() {
            callback(stage);
        }
    }
}

impl<S: FileService> Drop for PinManager<S> {
    fn drop(&mut self) {
        if self.tracker.stage().in_progress() {
            error!(stage = %self.tracker.stage(), "pin manager dropped while running");
        }
        if let Some(timer) = self.stall_timer.take() {
            timer.abort();
        }
        self.observers.drop_all();
    }
}

/// Bytes budgeted for an item. Hosted documents get a nominal size.
pub fn item_size(metadata: &FileMetadata) -> i64 {
    match metadata.item_type {
        ItemType::Hosted => HOSTED_FILE_SIZE,
        _ => metadata.size,
    }
}

pub fn can_pin_item(metadata: &FileMetadata, path: &str) -> bool {
    let id = metadata.stable_id;

    if metadata.item_type == ItemType::Directory {
        trace!(%id, path, "skipped directory");
        return false;
    }

    if metadata.item_type != ItemType::Hosted && metadata.size < 0 {
        error!(%id, path, size = metadata.size, "skipped item with a negative size");
        return false;
    }

    // Shortcuts show up as empty files.
    if metadata.item_type == ItemType::File && metadata.size == 0 {
        trace!(%id, path, "skipped empty file or shortcut");
        return false;
    }

    if metadata.pinned {
        trace!(%id, path, "skipped already pinned item");
        if !metadata.available_offline {
            trace!(%id, path, "already pinned but not available offline yet");
        }
        return false;
    }

    if !metadata.can_pin {
        trace!(%id, path, "skipped item that cannot be pinned");
        return false;
    }

    true
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
