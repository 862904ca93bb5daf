//! The panic button: a process-wide latch for the first fatal error.
//!
//! Any component that hits a non-recoverable failure presses the button.
//! Only the first press is retained; later presses are logged and
//! discarded. The supervisor blocks on [`PanicButton::wait`] and tears the
//! system down once the button fires. Because the fatal path bypasses the
//! graceful-shutdown checkpoint save, the connector never checkpoints past
//! an unhandled failure.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::{error, warn};

/// A fatal, non-recoverable connector failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    message: String,
}

impl FatalError {
    /// Creates a fatal error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Human-readable description of the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FatalError {}

/// Latches the first fatal error and wakes everyone waiting for it.
#[derive(Debug, Default)]
pub struct PanicButton {
    slot: Mutex<Option<FatalError>>,
    notify: Notify,
}

impl PanicButton {
    /// Creates an unpressed button.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches `message` as the fatal error, unless one is already latched.
    pub fn press(&self, message: impl Into<String>) {
        let fatal = FatalError::new(message);
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(first) = slot.as_ref() {
            warn!(
                first = %first,
                subsequent = %fatal,
                "fatal error reported after the first; keeping the first"
            );
            return;
        }
        error!(error = %fatal, "fatal error latched");
        *slot = Some(fatal);
        drop(slot);
        self.notify.notify_waiters();
    }

    /// Whether the button has been pressed.
    #[must_use]
    pub fn is_pressed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The latched fatal error, if any.
    #[must_use]
    pub fn fatal_error(&self) -> Option<FatalError> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Blocks until the button is pressed, then returns the fatal error.
    pub async fn wait(&self) -> FatalError {
        loop {
            let notified = self.notify.notified();
            if let Some(fatal) = self.fatal_error() {
                return fatal;
            }
            notified.await;
        }
    }
}
