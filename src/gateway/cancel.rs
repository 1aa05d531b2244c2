//! Global "cancel everything" signal with generation-based renewal.
//!
//! Each trip cancels the current token and bumps the generation. A deferred
//! task installs a fresh token after the grace interval, but only if no
//! later trip happened in between: with overlapping trips the renewal is
//! pushed back to one grace interval after the *last* trip. Once closed,
//! the switch never renews.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Generation {
    token: CancellationToken,
    number: u64,
    closed: bool,
}

#[derive(Clone)]
pub struct CancelSwitch {
    state: Arc<Mutex<Generation>>,
    grace: Duration,
}

impl CancelSwitch {
    pub fn new(grace: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(Generation {
                token: CancellationToken::new(),
                number: 0,
                closed: false,
            })),
            grace,
        }
    }

    /// Token of the active generation. Invocations capture this once, at
    /// admission.
    pub fn current(&self) -> CancellationToken {
        self.lock().token.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().number
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().token.is_cancelled()
    }

    /// Cancels the active token and schedules its replacement.
    /// Returns the generation number that the renewal is waiting on.
    pub fn trip(&self) -> u64 {
        let number = {
            let mut state = self.lock();
            state.token.cancel();
            state.number += 1;
            state.number
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let switch = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(switch.grace).await;
                    switch.renew(number);
                });
            }
            // Outside a runtime there is nothing to defer onto.
            Err(_) => self.renew(number),
        }
        number
    }

    /// Cancels for good; no fresh token will ever be installed.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.token.cancel();
    }

    fn renew(&self, number: u64) {
        let mut state = self.lock();
        if state.closed || state.number != number {
            debug!(
                "Skipping cancellation renewal for generation {number} (current {}, closed {})",
                state.number, state.closed
            );
            return;
        }
        state.token = CancellationToken::new();
        debug!("Installed fresh cancellation token (generation {number})");
    }

    fn lock(&self) -> MutexGuard<'_, Generation> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_not_cancelled_initially() {
        let switch = CancelSwitch::new(GRACE);
        assert!(!switch.is_cancelled());
        assert_eq!(switch.generation(), 0);
    }

    #[tokio::test]
    async fn test_trip_cancels_captured_token() {
        let switch = CancelSwitch::new(GRACE);
        let captured = switch.current();
        switch.trip();
        assert!(captured.is_cancelled());
        assert!(switch.is_cancelled());
        assert_eq!(switch.generation(), 1);
    }

    #[tokio::test]
    async fn test_fresh_token_after_grace() {
        let switch = CancelSwitch::new(GRACE);
        let old = switch.current();
        switch.trip();
        tokio::time::sleep(GRACE * 4).await;

        assert!(!switch.is_cancelled());
        assert!(old.is_cancelled());
        assert!(!switch.current().is_cancelled());
    }

    #[tokio::test]
    async fn test_overlapping_trips_renew_after_last() {
        let switch = CancelSwitch::new(Duration::from_millis(200));
        switch.trip();
        tokio::time::sleep(Duration::from_millis(120)).await;
        switch.trip();

        // First renewal is due now but must be skipped
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(switch.is_cancelled());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!switch.is_cancelled());
        assert_eq!(switch.generation(), 2);
    }

    #[tokio::test]
    async fn test_closed_switch_never_renews() {
        let switch = CancelSwitch::new(GRACE);
        switch.trip();
        switch.close();
        tokio::time::sleep(GRACE * 4).await;
        assert!(switch.is_cancelled());
    }

    #[test]
    fn test_trip_outside_runtime_renews_immediately() {
        let switch = CancelSwitch::new(GRACE);
        let old = switch.current();
        switch.trip();
        assert!(old.is_cancelled());
        assert!(!switch.is_cancelled());
    }
}
