use std::time::Duration;

/// Exponential backoff with a cap on total time spent waiting. Once the cap
/// is reached, [`next_delay`](Backoff::next_delay) returns `None` and the
/// caller is expected to give up.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    multiplier: f64,
    max_elapsed: Duration,
    next: Duration,
    elapsed: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, multiplier: f64, max_elapsed: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max_elapsed,
            next: initial,
            elapsed: Duration::ZERO,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.elapsed >= self.max_elapsed {
            return None;
        }
        let delay = self.next.min(self.max_elapsed - self.elapsed);
        self.elapsed += delay;
        self.next = Duration::from_secs_f64(self.next.as_secs_f64() * self.multiplier);
        Some(delay)
    }

    pub(crate) fn reset(&mut self) {
        self.next = self.initial;
        self.elapsed = Duration::ZERO;
    }
}
