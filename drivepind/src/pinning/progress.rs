use std::fmt;

use serde::Serialize;

/// Allocation unit used to estimate the disk space a file will occupy.
pub const BLOCK_SIZE: i64 = 4 << 10;

/// Nominal size budgeted for hosted documents, which report no byte size.
pub const HOSTED_FILE_SIZE: i64 = 7800;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Stage {
    #[default]
    NotStarted,
    GettingFreeSpace,
    ListingFiles,
    Syncing,
    Success,
    Stopped,
    CannotGetFreeSpace,
    CannotListFiles,
    NotEnoughSpace,
}

impl Stage {
    pub fn in_progress(self) -> bool {
        matches!(
            self,
            Stage::GettingFreeSpace | Stage::ListingFiles | Stage::Syncing
        )
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Stage::CannotGetFreeSpace | Stage::CannotListFiles | Stage::NotEnoughSpace
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counters of a single pinning run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub free_space: i64,
    pub required_space: i64,
    pub bytes_to_pin: i64,
    pub pinned_bytes: i64,
    pub files_to_pin: i32,
    pub pinned_files: i32,
    pub failed_files: i32,
    pub useful_events: i32,
    pub duplicated_events: i32,
    pub stage: Stage,
}

/// Transfer state of an item that is queued for pinning or being tracked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct File {
    pub path: String,
    pub transferred: i64,
    pub total: i64,
    pub in_progress: bool,
}

impl File {
    pub fn new(path: impl Into<String>, total: i64) -> Self {
        Self {
            path: path.into(),
            total,
            ..Self::default()
        }
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{path: '{}', transferred: {}, total: {}, in_progress: {}}}",
            self.path,
            HumanReadableSize(self.transferred),
            HumanReadableSize(self.total),
            self.in_progress
        )
    }
}

/// Rounds up to a whole number of blocks, saturating at `i64::MAX`.
pub fn round_to_block(size: i64) -> i64 {
    let mask = BLOCK_SIZE - 1;
    size.checked_add(mask).map_or(i64::MAX, |size| size & !mask)
}

pub(crate) fn percentage(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        (100 * i128::from(part) / i128::from(whole)) as i64
    } else {
        0
    }
}

/// Byte count formatted for logs, e.g. `1,536 bytes (1.50 K)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanReadableSize(pub i64);

impl fmt::Display for HumanReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;
        if value == 0 {
            return f.write_str("zilch");
        }
        if value < 0 {
            f.write_str("-")?;
        }

        let magnitude = value.unsigned_abs();
        write!(f, "{} bytes", group_thousands(magnitude))?;
        if magnitude < 1024 {
            return Ok(());
        }

        let mut scaled = magnitude as f64 / 1024.0;
        let mut units = ['M', 'G', 'T'].into_iter();
        let mut unit = 'K';
        while scaled >= 1024.0 {
            match units.next() {
                Some(next) => {
                    scaled /= 1024.0;
                    unit = next;
                }
                None => break,
            }
        }

        let precision: usize = if scaled < 10.0 {
            2
        } else if scaled < 100.0 {
            1
        } else {
            0
        };
        write!(f, " ({scaled:.precision$} {unit})")
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
