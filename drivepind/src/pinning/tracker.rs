use std::collections::BTreeMap;

use drivepin_core::Id;
use tracing::{debug, error, trace};

use super::progress::{File, HumanReadableSize, Progress, Stage, round_to_block};

pub type Files = BTreeMap<Id, File>;

/// Byte and file accounting of a pinning run.
///
/// Items found while listing wait in `files_to_pin`. When a pin request is
/// issued for one of them it moves to `files_to_track`, where it stays until
/// the service reports it complete or failed. An id is never in both maps.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    progress: Progress,
    files_to_pin: Files,
    files_to_track: Files,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub(crate) fn progress_mut(&mut self) -> &mut Progress {
        &mut self.progress
    }

    pub fn stage(&self) -> Stage {
        self.progress.stage
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.progress.stage = stage;
    }

    pub fn files_to_pin(&self) -> &Files {
        &self.files_to_pin
    }

    pub fn files_to_track(&self) -> &Files {
        &self.files_to_track
    }

    pub fn is_idle(&self) -> bool {
        self.files_to_pin.is_empty() && self.files_to_track.is_empty()
    }

    pub fn is_tracked(&self, id: Id) -> bool {
        self.files_to_track.contains_key(&id)
    }

    /// Drops all counters and entries, ready for a new run.
    pub(crate) fn reset(&mut self) {
        self.progress = Progress::default();
        self.clear_files();
    }

    pub(crate) fn clear_files(&mut self) {
        self.files_to_pin.clear();
        self.files_to_track.clear();
    }

    /// Queues an item for pinning. Returns `false` without touching anything
    /// if the id is already queued.
    pub fn add(&mut self, id: Id, path: &str, size: i64) -> bool {
        debug_assert!(size >= 0, "negative size {size} for {id} '{path}'");

        if let Some(existing) = self.files_to_pin.get(&id) {
            error!(
                %id,
                path,
                size = %HumanReadableSize(size),
                conflicting = %existing,
                "cannot add to the files to pin: conflicting entry"
            );
            return false;
        }

        self.files_to_pin.insert(id, File::new(path, size));
        trace!(%id, path, size = %HumanReadableSize(size), "added to the files to pin");
        self.progress.bytes_to_pin = self.progress.bytes_to_pin.saturating_add(size);
        self.progress.required_space = self
            .progress
            .required_space
            .saturating_add(round_to_block(size));
        self.progress.files_to_pin += 1;
        debug_assert_eq!(self.progress.files_to_pin as usize, self.files_to_pin.len());
        true
    }

    /// Applies a progress report to a tracked item. `None` leaves the
    /// corresponding field alone. Returns whether anything changed.
    pub fn update(
        &mut self,
        id: Id,
        path: &str,
        transferred: Option<i64>,
        total: Option<i64>,
    ) -> bool {
        let Some(file) = self.files_to_track.get_mut(&id) else {
            trace!(%id, path, "not tracked");
            return false;
        };
        apply_update(&mut self.progress, id, file, path, transferred, total)
    }

    /// Stops tracking an item. With `transferred` unset the item counts as
    /// fully delivered; otherwise exactly `transferred` bytes are accounted.
    pub fn remove(&mut self, id: Id, path: &str, transferred: Option<i64>) -> bool {
        let Some(mut file) = self.files_to_track.remove(&id) else {
            trace!(%id, path, "not tracked");
            return false;
        };

        match transferred {
            None => {
                let total = file.total;
                apply_update(&mut self.progress, id, &mut file, path, Some(total), None);
            }
            Some(bytes) => {
                apply_update(
                    &mut self.progress,
                    id,
                    &mut file,
                    path,
                    Some(bytes),
                    Some(bytes),
                );
            }
        }

        trace!(%id, path, "stopped tracking");
        true
    }

    /// Moves the first queued item into tracking and returns its id and path.
    pub(crate) fn start_tracking_next(&mut self) -> Option<(Id, String)> {
        let (id, file) = self.files_to_pin.pop_first()?;
        let path = file.path.clone();
        let previous = self.files_to_track.insert(id, file);
        debug_assert!(previous.is_none(), "{id} was already tracked");
        Some((id, path))
    }

    /// Renames a tracked item. Returns `None` if the id is not tracked,
    /// otherwise whether the path changed.
    pub(crate) fn repath(&mut self, id: Id, path: &str) -> Option<bool> {
        let file = self.files_to_track.get_mut(&id)?;
        if file.path == path {
            return Some(false);
        }
        error!(%id, from = %file.path, to = path, "changed path");
        file.path = path.to_string();
        Some(true)
    }

    /// Tracked items that have not reported any transfer activity yet.
    pub(crate) fn stalled(&self) -> Vec<(Id, String)> {
        self.files_to_track
            .iter()
            .filter(|(_, file)| !file.in_progress)
            .map(|(id, file)| (*id, file.path.clone()))
            .collect()
    }
}

fn apply_update(
    progress: &mut Progress,
    id: Id,
    file: &mut File,
    path: &str,
    transferred: Option<i64>,
    total: Option<i64>,
) -> bool {
    let mut modified = false;

    if file.path != path {
        debug!(%id, from = %file.path, to = path, "changed path");
        file.path = path.to_string();
        modified = true;
    }

    if !file.in_progress {
        if file.transferred > 0 {
            error!(
                %id,
                path,
                transferred = %HumanReadableSize(file.transferred),
                "queued item already has transferred bytes"
            );
        }
        file.in_progress = true;
        modified = true;
    }

    if let Some(transferred) = transferred.filter(|t| *t >= 0 && *t != file.transferred) {
        if transferred < file.transferred {
            error!(
                %id,
                path,
                from = %HumanReadableSize(file.transferred),
                to = %HumanReadableSize(transferred),
                "progress went backwards"
            );
        }
        progress.pinned_bytes = progress
            .pinned_bytes
            .saturating_add(transferred - file.transferred);
        file.transferred = transferred;
        modified = true;
    }

    if let Some(total) = total.filter(|t| *t >= 0 && *t != file.total) {
        error!(
            %id,
            path,
            from = %HumanReadableSize(file.total),
            to = %HumanReadableSize(total),
            "changed expected size"
        );
        progress.bytes_to_pin = progress.bytes_to_pin.saturating_add(total - file.total);
        progress.required_space = progress
            .required_space
            .saturating_add(round_to_block(total) - round_to_block(file.total));
        file.total = total;
        modified = true;
    }

    modified
}
