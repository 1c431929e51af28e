//! Cooperative cancellation of an in-flight sync.

use tokio::sync::watch;

/// Create a connected trigger and signal.
pub fn cancellation() -> (CancelTrigger, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelTrigger(tx), CancelSignal(rx))
}

/// Sending side, held by whoever may cancel.
#[derive(Debug)]
pub struct CancelTrigger(watch::Sender<bool>);

impl CancelTrigger {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Clear a previous request before a new attempt starts.
    pub fn reset(&self) {
        self.0.send_replace(false);
    }

    /// Another signal observing this trigger.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal(self.0.subscribe())
    }
}

/// Receiving side, checked at checkpoints.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self(rx)
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_reaches_every_signal_and_resets() {
        let (trigger, signal) = cancellation();
        let other = trigger.signal();
        assert!(!signal.is_cancelled());

        trigger.cancel();
        assert!(signal.is_cancelled());
        assert!(other.is_cancelled());

        trigger.reset();
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn test_never_stays_quiet() {
        assert!(!CancelSignal::never().is_cancelled());
    }
}
