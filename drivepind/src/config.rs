use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use url::Url;

use crate::pinning::PinningOptions;

const DEFAULT_PROFILE_DIR_NAME: &str = "drivepin";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8787";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub profile_dir: PathBuf,
    pub api_url: Url,
    pub token: String,
    pub pinning: PinningOptions,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let profile_dir = std::env::var("DRIVEPIN_PROFILE_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_profile_dir);
        let api_url =
            std::env::var("DRIVEPIN_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let api_url = Url::parse(&api_url)
            .with_context(|| format!("DRIVEPIN_API_URL is not a valid url: {api_url}"))?;
        let token = std::env::var("DRIVEPIN_TOKEN").context("DRIVEPIN_TOKEN is not set")?;

        Ok(Self {
            profile_dir,
            api_url,
            token,
            pinning: pinning_options_from_env(),
        })
    }

    /// Directory whose file system receives the pinned content.
    pub fn cache_dir(&self) -> PathBuf {
        self.profile_dir.join("GCache")
    }
}

fn pinning_options_from_env() -> PinningOptions {
    let defaults = PinningOptions::default();
    let page_size = read_u64_env("DRIVEPIN_PAGE_SIZE", u64::from(defaults.page_size))
        .clamp(1, u64::from(u32::MAX)) as u32;
    let max_in_flight =
        read_u64_env("DRIVEPIN_MAX_IN_FLIGHT", defaults.max_in_flight as u64).max(1) as usize;
    let stalled_check_interval = Duration::from_secs(
        read_u64_env(
            "DRIVEPIN_STALL_CHECK_SECS",
            defaults.stalled_check_interval.as_secs(),
        )
        .max(1),
    );
    let min_free_space = read_u64_env("DRIVEPIN_MIN_FREE_SPACE", defaults.min_free_space as u64)
        .min(i64::MAX as u64) as i64;
    let check_stalled_files =
        read_bool_env("DRIVEPIN_CHECK_STALLED_FILES", defaults.check_stalled_files);

    PinningOptions {
        page_size,
        max_in_flight,
        stalled_check_interval,
        min_free_space,
        check_stalled_files,
        ..defaults
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_profile_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_PROFILE_DIR_NAME)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
