// Copyright (c) 2023 - 2025 Flotilla contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry policies for remote operations, used by the reachability protocol
//! and anywhere a bounded wait-and-retry loop is needed.

use std::cmp;
use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;

const DEFAULT_JITTER_MULTIPLIER: f32 = 0.3;

// The floor avoids landing on round values (0, 10, 100ms, ...), a common
// source of harmonics when many loops wake in lockstep.
const MIN_JITTER: Duration = Duration::from_millis(3);

/// Policy driving a bounded retry loop. Iterating it yields the sleep before
/// each subsequent attempt, with jitter applied.
#[derive(Debug, Default, Clone, PartialEq)]
pub enum RetryPolicy {
    /// No retries.
    #[default]
    None,
    FixedDelay {
        interval: Duration,
        /// Infinite when unset.
        max_attempts: Option<NonZeroUsize>,
    },
    /// The next interval is `min(last_interval * factor, max_interval)`.
    Exponential {
        initial_interval: Duration,
        factor: f32,
        /// Infinite when unset.
        max_attempts: Option<NonZeroUsize>,
        max_interval: Option<Duration>,
    },
}

impl RetryPolicy {
    pub fn fixed_delay(interval: Duration, max_attempts: Option<usize>) -> Self {
        Self::FixedDelay {
            interval,
            max_attempts: max_attempts.map(|m| NonZeroUsize::new(m).expect("non-zero")),
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<usize>,
        max_interval: Option<Duration>,
    ) -> Self {
        Self::Exponential {
            initial_interval,
            factor,
            max_attempts: max_attempts.map(|m| NonZeroUsize::new(m).expect("non-zero")),
            max_interval,
        }
    }

    pub fn max_attempts(&self) -> Option<NonZeroUsize> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    pub fn iter(&self) -> RetryIter {
        self.clone().into_iter()
    }

    /// Runs `operation` until it succeeds or the policy is exhausted,
    /// sleeping between attempts. The error of the final attempt is returned.
    pub async fn retry<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut pauses = self.iter();
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => match pauses.next() {
                    Some(pause) => tokio::time::sleep(pause).await,
                    None => return Err(err),
                },
            }
        }
    }
}

impl IntoIterator for RetryPolicy {
    type Item = Duration;
    type IntoIter = RetryIter;

    fn into_iter(self) -> Self::IntoIter {
        RetryIter {
            policy: self,
            attempts: 0,
            last_interval: None,
        }
    }
}

#[derive(Debug)]
pub struct RetryIter {
    policy: RetryPolicy,
    attempts: usize,
    last_interval: Option<Duration>,
}

impl RetryIter {
    /// Attempts drawn from this iterator so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl Iterator for RetryIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.attempts += 1;
        let (base, limit) = match &self.policy {
            RetryPolicy::None => return None,
            RetryPolicy::FixedDelay {
                interval,
                max_attempts,
            } => (*interval, *max_attempts),
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_attempts,
                max_interval,
            } => {
                let next = match self.last_interval {
                    None => *initial_interval,
                    Some(last) => cmp::min(
                        last.mul_f32(*factor),
                        max_interval.unwrap_or(Duration::MAX),
                    ),
                };
                self.last_interval = Some(next);
                (next, *max_attempts)
            }
        };
        if limit.is_some_and(|limit| self.attempts > limit.get()) {
            return None;
        }
        Some(with_jitter(base, DEFAULT_JITTER_MULTIPLIER))
    }
}

fn with_jitter(base: Duration, multiplier: f32) -> Duration {
    let span = base.mul_f32(multiplier);
    if span <= MIN_JITTER {
        base + MIN_JITTER
    } else {
        base + rand::rng().random_range(MIN_JITTER..span)
    }
}
