pub mod backoff;
pub mod config;
pub mod daemon;
pub mod pinning;
