//! Blade state flags and confirmation rendezvous.
//!
//! The state is mutated only by the event dispatcher; every other caller
//! gets read-only access or blocks on one of the rendezvous primitives.

use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::events::Event;
use crate::metrics;

/// Error returned by the rendezvous waiters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    /// The caller's context ended before the confirmation arrived. This
    /// is the normal shutdown path, never a failure.
    #[error("wait cancelled")]
    Cancelled,
}

#[derive(Debug, Default)]
struct Flags {
    identify_active: bool,
    critical_active: bool,
}

/// Boolean blade state plus wake-up primitives for waiters.
///
/// Each flag is paired with a broadcast one-shot: on confirmation all
/// current waiters are released and the rendezvous re-arms for the next
/// cycle (`Notify::notify_waiters` gives exactly these semantics).
pub struct BladeState {
    flags: Mutex<Flags>,
    identify_confirm: Notify,
    critical_clear: Notify,
}

impl BladeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flags: Mutex::new(Flags::default()),
            identify_confirm: Notify::new(),
            critical_clear: Notify::new(),
        })
    }

    /// Applies the state transition for an event and refreshes the
    /// tri-state gauge. Unknown-to-state events (`Noop`, `EdgeButton`)
    /// change nothing but still refresh the gauge, which initialises the
    /// metric family at startup.
    pub fn register_event(&self, event: Event) {
        let mut flags = self.flags.lock().expect("blade state mutex poisoned");

        match event {
            Event::Identify => flags.identify_active = true,
            Event::IdentifyConfirm => {
                flags.identify_active = false;
                self.identify_confirm.notify_waiters();
            }
            Event::Critical => {
                flags.critical_active = true;
                flags.identify_active = false;
            }
            Event::CriticalReset => {
                flags.critical_active = false;
                self.critical_clear.notify_waiters();
            }
            Event::Noop | Event::EdgeButton => {}
        }

        let label = Self::label_for(&flags);
        for candidate in ["critical", "identify", "normal"] {
            metrics::BLADE_STATE.set(candidate, u64::from(candidate == label));
        }
    }

    fn label_for(flags: &Flags) -> &'static str {
        if flags.critical_active {
            "critical"
        } else if flags.identify_active {
            "identify"
        } else {
            "normal"
        }
    }

    /// Current gauge label; exactly one label carries the value 1.
    pub fn state_label(&self) -> &'static str {
        Self::label_for(&self.flags.lock().expect("blade state mutex poisoned"))
    }

    pub fn identify_active(&self) -> bool {
        self.flags
            .lock()
            .expect("blade state mutex poisoned")
            .identify_active
    }

    pub fn critical_active(&self) -> bool {
        self.flags
            .lock()
            .expect("blade state mutex poisoned")
            .critical_active
    }

    /// Blocks until the next `IdentifyConfirm` registered after this
    /// call, or until the token is cancelled. All concurrent waiters are
    /// released by a single confirmation.
    pub async fn wait_for_identify_confirm(
        &self,
        token: &CancellationToken,
    ) -> Result<(), WaitError> {
        let confirmed = self.identify_confirm.notified();
        tokio::select! {
            () = token.cancelled() => Err(WaitError::Cancelled),
            () = confirmed => Ok(()),
        }
    }

    /// Symmetric wait for the next `CriticalReset`.
    pub async fn wait_for_critical_clear(
        &self,
        token: &CancellationToken,
    ) -> Result<(), WaitError> {
        let cleared = self.critical_clear.notified();
        tokio::select! {
            () = token.cancelled() => Err(WaitError::Cancelled),
            () = cleared => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::sleep;

    #[test]
    fn register_event_identify_round_trip() {
        let state = BladeState::new();

        state.register_event(Event::Identify);
        assert!(state.identify_active());
        state.register_event(Event::IdentifyConfirm);
        assert!(!state.identify_active());
    }

    #[test]
    fn register_event_critical_round_trip() {
        let state = BladeState::new();

        state.register_event(Event::Critical);
        assert!(state.critical_active());
        state.register_event(Event::CriticalReset);
        assert!(!state.critical_active());
    }

    #[test]
    fn critical_clears_identify() {
        let state = BladeState::new();

        state.register_event(Event::Identify);
        state.register_event(Event::Critical);
        assert!(state.critical_active());
        assert!(!state.identify_active());
    }

    #[test]
    fn register_event_mixed_sequence() {
        let state = BladeState::new();

        for event in [
            Event::Critical,
            Event::CriticalReset,
            Event::Noop,
            Event::Critical,
            Event::Noop,
            Event::Identify,
            Event::Identify,
            Event::CriticalReset,
            Event::Identify,
        ] {
            state.register_event(event);
        }

        assert!(!state.critical_active());
        assert!(state.identify_active());
    }

    #[test]
    fn exactly_one_state_label_after_every_event() {
        let state = BladeState::new();

        let sequence = [
            Event::Noop,
            Event::Identify,
            Event::Critical,
            Event::EdgeButton,
            Event::CriticalReset,
            Event::IdentifyConfirm,
            Event::Identify,
            Event::IdentifyConfirm,
        ];
        let mut seen = Vec::new();
        for event in sequence {
            state.register_event(event);
            seen.push(state.state_label());
        }

        assert_eq!(
            seen,
            vec![
                "normal", "identify", "critical", "critical", "normal", "normal", "identify",
                "normal",
            ]
        );
    }

    #[tokio::test]
    async fn wait_for_identify_confirm_releases_waiter() {
        let state = BladeState::new();
        let token = CancellationToken::new();

        state.register_event(Event::Identify);

        let waiter = {
            let state = state.clone();
            let token = token.clone();
            tokio::spawn(async move { state.wait_for_identify_confirm(&token).await })
        };

        // Give the waiter time to register with the rendezvous.
        sleep(Duration::from_millis(50)).await;
        state.register_event(Event::IdentifyConfirm);

        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert!(!state.identify_active());
    }

    #[tokio::test]
    async fn wait_for_identify_confirm_releases_all_waiters() {
        let state = BladeState::new();
        let token = CancellationToken::new();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                let token = token.clone();
                tokio::spawn(async move { state.wait_for_identify_confirm(&token).await })
            })
            .collect();

        sleep(Duration::from_millis(50)).await;
        state.register_event(Event::IdentifyConfirm);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(()));
        }
    }

    #[tokio::test]
    async fn wait_for_critical_clear_cancelled_by_deadline() {
        let state = BladeState::new();
        let token = CancellationToken::new();

        state.register_event(Event::Critical);

        let deadline_token = token.clone();
        let state_for_waiter = state.clone();
        let waiter = tokio::spawn(async move {
            state_for_waiter
                .wait_for_critical_clear(&deadline_token)
                .await
        });

        sleep(Duration::from_millis(1)).await;
        token.cancel();

        assert_eq!(waiter.await.unwrap(), Err(WaitError::Cancelled));
        assert!(state.critical_active());
    }

    #[tokio::test]
    async fn wait_for_critical_clear_releases_waiter() {
        let state = BladeState::new();
        let token = CancellationToken::new();

        state.register_event(Event::Critical);

        let waiter = {
            let state = state.clone();
            let token = token.clone();
            tokio::spawn(async move { state.wait_for_critical_clear(&token).await })
        };

        sleep(Duration::from_millis(50)).await;
        state.register_event(Event::CriticalReset);

        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert!(!state.critical_active());
    }

    #[tokio::test]
    async fn rendezvous_rearms_for_next_cycle() {
        let state = BladeState::new();
        let token = CancellationToken::new();

        // First cycle.
        let first = {
            let state = state.clone();
            let token = token.clone();
            tokio::spawn(async move { state.wait_for_identify_confirm(&token).await })
        };
        sleep(Duration::from_millis(20)).await;
        state.register_event(Event::IdentifyConfirm);
        assert_eq!(first.await.unwrap(), Ok(()));

        // A waiter registered after the first confirmation must block
        // until the next one.
        let second = {
            let state = state.clone();
            let token = token.clone();
            tokio::spawn(async move { state.wait_for_identify_confirm(&token).await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        state.register_event(Event::IdentifyConfirm);
        assert_eq!(second.await.unwrap(), Ok(()));
    }
}
