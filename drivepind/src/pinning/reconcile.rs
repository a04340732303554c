//! Folding push notifications and metadata lookups into the tracked state.

use drivepin_core::{
    DriveError, EventState, FileChange, FileMetadata, Id, ItemEvent, PushEvent, SyncingStatus,
};
use tracing::{debug, error, trace, warn};

use super::manager::{PinManager, item_size};
use super::progress::Stage;
use super::service::{FileService, ServiceError};

fn known(value: i64) -> Option<i64> {
    (value >= 0).then_some(value)
}

impl<S: FileService> PinManager<S> {
    pub fn on_push_event(&mut self, event: PushEvent) {
        match event {
            PushEvent::SyncingStatus(status) => self.on_syncing_status_update(&status),
            PushEvent::FilesChanged { changes } => self.on_files_changed(&changes),
            PushEvent::Unmounted => self.on_unmounted(),
            PushEvent::Error(err) => self.on_error(&err),
            PushEvent::Unknown => debug!("ignored unknown push event"),
        }
    }

    /// Applies a batch of item events in order. Each useful event notifies
    /// observers and tops up the pinning batch.
    pub fn on_syncing_status_update(&mut self, status: &SyncingStatus) {
        if self.tracker.stage() != Stage::Syncing {
            debug!("ignored syncing status update");
            return;
        }

        for event in &status.item_events {
            // Counters are final once the run completes, so the rest of the
            // batch is counted as neither useful nor duplicated.
            if self.tracker.stage() != Stage::Syncing {
                debug!("run finished, ignoring the remaining events");
                break;
            }

            if self.on_syncing_event(event) {
                self.tracker.progress_mut().useful_events += 1;
                self.notify_progress();
                self.pin_some_files();
            } else {
                self.tracker.progress_mut().duplicated_events += 1;
                trace!(?event, "duplicated event");
            }
        }
    }

    /// Returns whether the event changed any tracked state.
    pub(crate) fn on_syncing_event(&mut self, event: &ItemEvent) -> bool {
        let id = event.stable_id;
        let path = event.path.as_str();

        match event.state {
            EventState::Queued | EventState::InProgress => {
                // Queued events report a bogus zero total.
                let total = match event.state {
                    EventState::Queued => None,
                    _ => known(event.bytes_to_transfer),
                };
                if !self
                    .tracker
                    .update(id, path, known(event.bytes_transferred), total)
                {
                    return false;
                }
                debug!(%id, path, state = %event.state, "transfer update");
                true
            }
            EventState::Completed => {
                if !self.tracker.remove(id, path, None) {
                    return false;
                }
                debug!(%id, path, "synced");
                self.tracker.progress_mut().pinned_files += 1;
                true
            }
            EventState::Failed => {
                if !self.tracker.remove(id, path, Some(0)) {
                    return false;
                }
                error!(%id, path, ?event, "failed to sync");
                self.tracker.progress_mut().failed_files += 1;
                true
            }
            EventState::Unknown => {
                error!(?event, "unexpected event state");
                false
            }
        }
    }

    /// Updates the path of renamed tracked items and checks their metadata.
    pub fn on_files_changed(&mut self, changes: &[FileChange]) {
        if self.tracker.stage() != Stage::Syncing {
            for change in changes {
                debug!(id = %change.stable_id, path = %change.path, "ignored file change");
            }
            return;
        }

        for change in changes {
            let id = change.stable_id;
            if self.tracker.repath(id, &change.path).is_none() {
                debug!(%id, path = %change.path, "ignored file change");
                continue;
            }

            debug!(%id, path = %change.path, change = ?change.change_type, "got file change");
            self.request_metadata(id, change.path.clone());
        }
    }

    pub fn on_unmounted(&mut self) {
        error!("file service got unmounted");
    }

    pub fn on_error(&mut self, err: &DriveError) {
        error!(
            kind = ?err.error_type,
            id = %err.stable_id,
            path = %err.path,
            "file service reported an error"
        );
    }

    /// Looks up the metadata of tracked items that never reported any
    /// transfer activity, then re-arms itself.
    pub(super) fn check_stalled_files(&mut self) {
        if !self.options.check_stalled_files {
            return;
        }

        for (id, path) in self.tracker.stalled() {
            debug!(%id, %path, "checking unstarted");
            self.request_metadata(id, path);
        }

        self.schedule_stalled_files_check();
        self.pin_some_files();
    }

    pub(super) fn on_metadata_retrieved(
        &mut self,
        id: Id,
        path: String,
        result: Result<FileMetadata, ServiceError>,
    ) {
        if self.tracker.stage() != Stage::Syncing {
            debug!(%id, %path, "ignored metadata");
            return;
        }

        let metadata = match result {
            Ok(metadata) => metadata,
            Err(err) => {
                error!(%id, %path, error = %err, "cannot get metadata");
                return self.stop_tracking_as_failed(id, &path);
            }
        };

        if metadata.stable_id != id {
            warn!(%id, got = %metadata.stable_id, "metadata for a different item");
        }
        trace!(%id, %path, ?metadata, "got metadata");

        if !metadata.pinned {
            error!(%id, %path, "got unexpectedly unpinned");
            return self.stop_tracking_as_failed(id, &path);
        }

        if !metadata.available_offline {
            return;
        }

        if !self.tracker.remove(id, &path, Some(item_size(&metadata))) {
            warn!(%id, %path, "not tracked");
            return;
        }

        debug!(%id, %path, "synced");
        self.tracker.progress_mut().pinned_files += 1;
        self.notify_progress();
        self.pin_some_files();
    }

    fn stop_tracking_as_failed(&mut self, id: Id, path: &str) {
        if !self.tracker.remove(id, path, Some(0)) {
            warn!(%id, path, "not tracked");
            return;
        }

        debug!(%id, path, "stopped tracking");
        self.tracker.progress_mut().failed_files += 1;
        self.notify_progress();
        self.pin_some_files();
    }
}
