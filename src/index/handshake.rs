//! Background build start handshake
//!
//! A single-slot signal from a background build to the task that launched it.
//! The build fires it once it has released the exclusive database lock (or
//! once it knows it never will), and the launcher consumes it, resetting the
//! slot. The signal carries what happened so a launcher is never left waiting
//! on a build that failed before reaching the downgrade.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::HandshakeError;

/// What a background build reports to its launcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartSignal {
    /// Exclusive lock downgraded; the scan is running
    Started,
    /// The index was already present; the build finished without scanning
    AlreadySatisfied,
    /// Initialisation failed or the build exited before reaching the downgrade
    Aborted(String),
}

#[derive(Debug, Default)]
pub struct BackgroundStartSignal {
    slot: Mutex<Option<StartSignal>>,
    notify: Notify,
}

impl BackgroundStartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `signal` and wake the waiter
    ///
    /// Fails with `SlotOccupied` if an earlier signal was never consumed.
    pub fn signal(&self, signal: StartSignal) -> Result<(), HandshakeError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slot.as_ref() {
            warn!(
                "BackgroundStartSignal: refusing {:?}, {:?} still pending",
                signal, pending
            );
            return Err(HandshakeError::SlotOccupied);
        }
        debug!("BackgroundStartSignal: signalled {:?}", signal);
        *slot = Some(signal);
        drop(slot);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next signal and consume it
    ///
    /// The slot is empty again when this returns `Ok`.
    pub async fn wait(&self, timeout: Duration) -> Result<StartSignal, HandshakeError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(signal) = self.take() {
                trace!("BackgroundStartSignal: consumed {:?}", signal);
                return Ok(signal);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // A signal may have landed between the last check and the deadline
                if let Some(signal) = self.take() {
                    return Ok(signal);
                }
                warn!("BackgroundStartSignal: no signal after {:?}", timeout);
                return Err(HandshakeError::Timeout { waited: timeout });
            }
        }
    }

    fn take(&self) -> Option<StartSignal> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether a signal is waiting to be consumed
    #[allow(dead_code)]
    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Fires the start signal exactly once from a background build
///
/// A guard dropped without firing reports `Aborted`, so every exit path of
/// initialisation releases the launcher.
pub struct StartSignalGuard {
    signal: Arc<BackgroundStartSignal>,
    fired: bool,
}

impl StartSignalGuard {
    pub fn new(signal: Arc<BackgroundStartSignal>) -> Self {
        Self {
            signal,
            fired: false,
        }
    }

    pub fn fire(&mut self, signal: StartSignal) {
        if self.fired {
            return;
        }
        self.fired = true;
        if let Err(e) = self.signal.signal(signal) {
            warn!("StartSignalGuard: {}", e);
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired
    }
}

impl Drop for StartSignalGuard {
    fn drop(&mut self) {
        if !self.fired {
            self.fire(StartSignal::Aborted(
                "background build exited before signalling start".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_signal_before_wait_is_not_lost() {
        let handshake = BackgroundStartSignal::new();
        handshake.signal(StartSignal::Started).unwrap();
        assert!(handshake.is_pending());

        let signal = handshake.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(signal, StartSignal::Started);
        assert!(!handshake.is_pending());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_signal() {
        let handshake = Arc::new(BackgroundStartSignal::new());
        let signaller = Arc::clone(&handshake);
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            signaller.signal(StartSignal::Started).unwrap();
        });

        let signal = handshake.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(signal, StartSignal::Started);
        assert!(!handshake.is_pending());
    }

    #[tokio::test]
    async fn test_each_signal_consumed_exactly_once() {
        let handshake = BackgroundStartSignal::new();
        handshake.signal(StartSignal::Started).unwrap();
        handshake.wait(Duration::from_millis(50)).await.unwrap();

        // Nothing left for a second waiter
        let second = handshake.wait(Duration::from_millis(20)).await;
        assert!(matches!(second, Err(HandshakeError::Timeout { .. })));
    }

    #[test]
    fn test_second_pending_signal_rejected() {
        let handshake = BackgroundStartSignal::new();
        handshake.signal(StartSignal::Started).unwrap();
        assert_eq!(
            handshake.signal(StartSignal::Started),
            Err(HandshakeError::SlotOccupied)
        );
    }

    #[tokio::test]
    async fn test_dropped_guard_reports_abort() {
        let handshake = Arc::new(BackgroundStartSignal::new());
        {
            let _guard = StartSignalGuard::new(Arc::clone(&handshake));
        }
        let signal = handshake.wait(Duration::from_millis(50)).await.unwrap();
        assert!(matches!(signal, StartSignal::Aborted(_)));
    }

    #[tokio::test]
    async fn test_guard_fires_once() {
        let handshake = Arc::new(BackgroundStartSignal::new());
        {
            let mut guard = StartSignalGuard::new(Arc::clone(&handshake));
            guard.fire(StartSignal::AlreadySatisfied);
            guard.fire(StartSignal::Started);
            assert!(guard.is_fired());
        }
        let signal = handshake.wait(Duration::from_millis(50)).await.unwrap();
        assert_eq!(signal, StartSignal::AlreadySatisfied);
        assert!(!handshake.is_pending());
    }
}
