use std::time::Duration;

use rand::Rng;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Bounded exponential backoff with jitter.
///
/// Delays start at `initial` and double on each step until they reach `max`, where they stay. Up
/// to 10% uniform jitter is added to each delay so synchronized pollers spread out.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// The first delay handed out after a reset.
    initial: Duration,

    /// The ceiling no delay will exceed (before jitter).
    max: Duration,

    /// The next base delay to hand out.
    current: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Backoff {
    /// Creates a backoff schedule starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the next delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let jitter_cap = base.as_millis() as u64 / 10;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };

        base + Duration::from_millis(jitter)
    }

    /// Resets the schedule back to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
