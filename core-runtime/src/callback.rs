//! # Serialized Callback Context
//!
//! Observers of task state and QR status are never invoked from the worker
//! that produced the change. Work is posted to one dedicated thread and run
//! in posting order, so observers need no synchronization of their own and
//! a transfer's notifications are never reordered.

use crate::error::{Error, Result};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, warn};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the callback thread. Cloning shares the same thread.
///
/// The thread exits once every handle has been dropped and the queue has
/// drained.
#[derive(Clone)]
pub struct CallbackContext {
    sender: mpsc::Sender<Callback>,
}

impl CallbackContext {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Callback>();

        thread::Builder::new()
            .name("alipan-callbacks".to_string())
            .spawn(move || {
                while let Ok(callback) = receiver.recv() {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)).is_err() {
                        warn!("Observer callback panicked");
                    }
                }
                debug!("Callback context stopped");
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn callback thread: {}", e)))?;

        Ok(Self { sender })
    }

    /// Queue `callback` behind everything posted before it.
    ///
    /// Returns `false` if the callback thread is gone.
    pub fn post<F>(&self, callback: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.send(Box::new(callback)).is_ok()
    }

    /// Resolves once every callback posted before this call has run.
    pub async fn flush(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.post(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackContext").finish_non_exhaustive()
    }
}
