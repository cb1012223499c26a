//! Cooperative cancellation.
//!
//! A [`Controller`] owns the abort switch; any number of [`Token`]s observe it.
//! The switch flips once: the first `abort` wins, later calls are no-ops and
//! keep the original reason. Waiters are woken through a `watch` channel, so a
//! task parked in [`Token::cancelled`] resumes on the next scheduling pass
//! instead of polling.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cancelled: {reason}")]
pub struct CancelledError {
    pub reason: String,
}

impl CancelledError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

type Slot = Option<Arc<str>>;

#[derive(Debug, Clone)]
pub struct Controller {
    tx: Arc<watch::Sender<Slot>>,
}

impl Controller {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn token(&self) -> Token {
        Token { rx: self.tx.subscribe() }
    }

    /// Flip the switch. Returns `true` only for the call that actually aborted.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let reason: Arc<str> = Arc::from(reason.into());
        self.tx.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        })
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().as_deref().map(str::to_string)
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    rx: watch::Receiver<Slot>,
}

impl Token {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().as_deref().map(str::to_string)
    }

    /// Fail fast at a suspend point.
    pub fn check(&self) -> Result<(), CancelledError> {
        match self.reason() {
            Some(reason) => Err(CancelledError::new(reason)),
            None => Ok(()),
        }
    }

    /// Resolves with the abort reason. Never resolves if the controller is
    /// dropped without aborting.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.as_deref().map(str::to_string),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}
