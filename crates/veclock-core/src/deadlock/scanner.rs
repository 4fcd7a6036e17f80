//! Background deadlock scan thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Sender};

use super::DeadlockDetector;
use crate::error::{Error, Result};

/// Runs [`DeadlockDetector::scan`] every `interval` on a dedicated thread.
///
/// Dropping the scanner stops the thread and waits for it to exit.
#[derive(Debug)]
pub struct DeadlockScanner {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl DeadlockScanner {
    /// Starts the scan thread.
    pub fn spawn(detector: Arc<DeadlockDetector>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let ticker = crossbeam_channel::tick(interval);

        let handle = thread::Builder::new()
            .name("veclock-deadlock-scan".to_string())
            .spawn(move || {
                tracing::debug!(interval_ms = interval.as_millis(), "Deadlock scanner started");
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let report = detector.scan();
                            if report.skipped {
                                tracing::trace!("Deadlock scan skipped, previous pass still running");
                            }
                        }
                    }
                }
                tracing::debug!("Deadlock scanner stopped");
            })
            .map_err(|e| Error::Init(format!("failed to spawn deadlock scanner: {e}")))?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
            interval,
        })
    }

    /// Scan period.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stops the thread and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Disconnecting the channel wakes the select.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Deadlock scanner thread panicked");
            }
        }
    }
}

impl Drop for DeadlockScanner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
