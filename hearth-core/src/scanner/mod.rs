//! Polling change detection.
//!
//! A [`Scan`] implementation owns a watched target and a snapshot of its
//! last-known state; the [`ScanDriver`] polls it on a fixed interval. Ticks
//! for one scanner are strictly sequential: the action triggered by a
//! detected change always completes before the next snapshot is taken, so
//! two actions for the same target can never overlap.

use std::{future::Future, io, path::PathBuf, time::Duration};

use tracing::{error, info, warn};

use crate::AnyResult;

pub mod deployment;
pub mod snapshot;

pub use deployment::DeploymentScanner;
pub use snapshot::DirectorySnapshot;

/// Snapshot capture failed. The stored snapshot stays untouched and the
/// next tick retries.
#[derive(Debug, thiserror::Error)]
#[error("scan of {path:?} failed: {source}")]
pub struct ScanError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// A pollable change detector.
///
/// `scan` takes a fresh snapshot and diffs it against the stored one; when
/// it reports a change it must already have advanced the stored snapshot,
/// so that a failing `act` is not replayed against an unchanged target on
/// the next tick.
pub trait Scan {
    type Change;

    /// Name used in log lines.
    fn describe(&self) -> &str;

    fn scan(&mut self) -> Result<Option<Self::Change>, ScanError>;

    fn act(&mut self, change: Self::Change) -> impl Future<Output = AnyResult<()>>;
}

/// Drives a [`Scan`] on a fixed interval.
pub struct ScanDriver<S> {
    scanner: S,
    interval: Duration,
}

impl<S: Scan> ScanDriver<S> {
    pub fn new(scanner: S, interval: Duration) -> Self {
        Self { scanner, interval }
    }

    /// One scan/act cycle. Scan failures and action failures are contained
    /// here: a missed scan is silent apart from the log line (the next tick
    /// recovers), a failed action is surfaced in the log but not retried.
    pub async fn tick(&mut self) {
        let change = match self.scanner.scan() {
            Ok(Some(change)) => change,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    "{} scan failed, keeping previous snapshot: {e}",
                    self.scanner.describe()
                );
                return;
            }
        };
        info!("{} change detected", self.scanner.describe());
        if let Err(e) = self.scanner.act(change).await {
            error!("{} action failed: {e:?}", self.scanner.describe());
        }
    }

    pub async fn run(mut self) {
        info!(
            "{} scanner started, polling every {:?}",
            self.scanner.describe(),
            self.interval
        );
        loop {
            self.tick().await;
            monoio::time::sleep(self.interval).await;
        }
    }
}
