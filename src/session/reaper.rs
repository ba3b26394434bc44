//! Background expiry of abandoned sessions.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::store::SessionStore;

/// Periodically resolves sessions older than the expiry with a timeout.
///
/// Stops when [`Reaper::stop`] is called or the reaper is dropped.
pub struct Reaper {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn start(store: SessionStore, interval: Duration, expiry: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            debug!(?interval, ?expiry, "Reaper started");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let reaped = store.reap_expired(Instant::now(), expiry);
                        if !reaped.is_empty() {
                            info!(count = reaped.len(), "Reaped expired sessions");
                        }
                    }
                    // Stop requested or the reaper was dropped.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Reaper stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stop the reaper and wait for its thread to finish.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}
