use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use drivepin_core::{DriveApiError, DriveClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::DaemonConfig;
use crate::pinning::{HumanReadableSize, Observer, PinManager, PinManagerHandle, Progress, Stage};

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: DriveClient,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let cache_dir = config.cache_dir();
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .with_context(|| format!("failed to create cache dir at {cache_dir:?}"))?;

        let client = DriveClient::with_base_url(config.api_url.as_str(), config.token.clone())
            .context("failed to create file service client")?;

        Ok(Self { config, client })
    }

    /// Pins everything, following push events until the run ends.
    pub async fn run(self) -> anyhow::Result<Progress> {
        self.pin(true).await
    }

    /// Only computes the space budget.
    pub async fn check(self) -> anyhow::Result<Progress> {
        self.pin(false).await
    }

    async fn pin(self, should_pin: bool) -> anyhow::Result<Progress> {
        info!(
            profile_dir = %self.config.profile_dir.display(),
            api_url = %self.config.api_url,
            should_pin,
            "starting pinning run"
        );

        let service = Arc::new(self.client.clone());
        let mut manager = PinManager::with_options(
            self.config.profile_dir.clone(),
            Arc::clone(&service),
            self.config.pinning.clone(),
        );
        manager.should_pin(should_pin);
        manager.set_completion_callback(|stage| debug!(%stage, "completion callback"));

        let logger = Arc::new(LogObserver::default());
        manager.add_observer(&logger);

        let (handle, mut commands) = PinManagerHandle::channel();
        let shutdown = CancellationToken::new();

        let pump = should_pin.then(|| {
            tokio::spawn(pump_events(
                self.client.clone(),
                handle.clone(),
                shutdown.clone(),
            ))
        });
        let signals = tokio::spawn(stop_on_ctrl_c(handle.clone(), shutdown.clone()));

        handle.start();
        drop(handle);
        let stage = manager.run(&mut commands).await;

        shutdown.cancel();
        if let Some(pump) = pump {
            if let Err(err) = pump.await {
                warn!(error = %err, "push event pump panicked");
            }
        }
        signals.abort();

        let progress = manager.progress();
        drop(manager);
        info!(%stage, "pinning run finished");
        Ok(progress)
    }
}

/// Forwards push events to the manager, resubscribing whenever the stream
/// drops.
async fn pump_events(client: DriveClient, handle: PinManagerHandle, shutdown: CancellationToken) {
    let mut backoff = Backoff::reconnect();
    loop {
        let subscription = tokio::select! {
            _ = shutdown.cancelled() => return,
            subscription = client.subscribe_events() => subscription,
        };

        match subscription {
            Ok(mut events) => {
                debug!("subscribed to push events");
                backoff.reset();
                loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        next = events.next_event() => next,
                    };
                    match next {
                        Ok(Some(event)) => {
                            if !handle.push(event) {
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!("push event stream closed");
                            break;
                        }
                        // The bad line is already consumed, the stream stays usable.
                        Err(DriveApiError::Decode(err)) => {
                            warn!(error = %err, "skipped undecodable push event");
                        }
                        Err(err) => {
                            warn!(error = %err, "push event stream failed");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, attempt = backoff.attempt(), "cannot subscribe to push events");
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "resubscribing to push events");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn stop_on_ctrl_c(handle: PinManagerHandle, shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => {
                info!("interrupted, stopping");
                handle.stop();
            }
            Err(err) => error!(error = %err, "failed waiting for shutdown signal"),
        },
    }
}

/// Logs stage transitions and a progress line for every update.
#[derive(Default)]
struct LogObserver {
    last_stage: Mutex<Stage>,
}

impl Observer for LogObserver {
    fn on_progress(&self, progress: &Progress) {
        let mut last = self
            .last_stage
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *last != progress.stage {
            let previous = std::mem::replace(&mut *last, progress.stage);
            info!(from = %previous, to = %progress.stage, "stage changed");
        }
        debug!(
            pinned_files = progress.pinned_files,
            failed_files = progress.failed_files,
            pinned = %HumanReadableSize(progress.pinned_bytes),
            to_pin = %HumanReadableSize(progress.bytes_to_pin),
            "progress"
        );
    }

    fn on_drop(&self) {
        debug!("pin manager dropped");
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
