use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Remembers when the target was last accepted and decides whether a new
/// sighting falls outside the cooldown window.
///
/// One gate exists per process. It is handed to the ingestion loop at
/// construction and shared by reference, never through a global.
#[derive(Debug, Default)]
pub struct DebounceGate {
    last_accepted: Mutex<Option<Instant>>,
}

impl DebounceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `now` if nothing was accepted yet or at least `cooldown` has
    /// passed since the last accepted sighting. The compare and the update
    /// happen under one lock so concurrent callers can't both win.
    pub fn try_accept(&self, now: Instant, cooldown: Duration) -> bool {
        // A poisoned lock still holds a valid timestamp.
        let mut last_accepted = self
            .last_accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let accepted = match *last_accepted {
            None => true,
            Some(last) => now
                .checked_duration_since(last)
                .is_some_and(|elapsed| elapsed >= cooldown),
        };

        if accepted {
            *last_accepted = Some(now);
        }
        accepted
    }

    pub fn last_accepted(&self) -> Option<Instant> {
        *self
            .last_accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
