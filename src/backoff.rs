// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use rand::Rng;

/// Exponential delay between retries, doubling up to `max` with optional
/// random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max,
            jitter: false,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Backoff {
        self.jitter = jitter;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        let delay = self
            .initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter && delay.as_millis() > 0 {
            let ms = delay.as_millis() as u64;
            let extra = rand::thread_rng().gen_range(0..=ms / 2);
            (delay + Duration::from_millis(extra)).min(self.max)
        } else {
            delay
        }
    }
}
