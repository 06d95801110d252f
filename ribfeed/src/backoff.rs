//
// Copyright (c) The Ribfeed Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use rand::Rng;

pub(crate) const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;
pub(crate) const DEFAULT_MULTIPLIER: f64 = 1.5;

// Exponential backoff with randomized intervals.
//
// Each call to `next` yields the current interval jittered by the
// randomization factor, then grows the interval by the multiplier up to
// the configured cap. `reset` returns to the initial interval.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    initial: Duration,
    randomization: f64,
    multiplier: f64,
    max: Duration,
    current: Duration,
}

// ===== impl ExponentialBackoff =====

impl ExponentialBackoff {
    pub(crate) fn with_max_interval(max: Duration) -> ExponentialBackoff {
        ExponentialBackoff {
            initial: DEFAULT_INITIAL_INTERVAL,
            randomization: DEFAULT_RANDOMIZATION_FACTOR,
            multiplier: DEFAULT_MULTIPLIER,
            max,
            current: DEFAULT_INITIAL_INTERVAL,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }

    pub(crate) fn next(&mut self) -> Duration {
        let interval = self.current;
        self.current = interval.mul_f64(self.multiplier).min(self.max);

        // Pick uniformly from [interval * (1 - r), interval * (1 + r)].
        let delta = interval.mul_f64(self.randomization);
        interval - delta + delta.mul_f64(2.0).mul_f64(rand::rng().random::<f64>())
    }
}

// ===== tests =====
