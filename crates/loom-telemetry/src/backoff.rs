// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Retry delays for the upload stage.
//!
//! [`ExponentialBackoff`] computes `interval * base^attempt` plus a jitter drawn
//! uniformly from `[0, delay)`. [`MaxAttemptsExponentialBackoff`] bounds it:
//! after `max_attempts` consecutive delays the next one is a fixed cool-off
//! period and the exponential sequence starts over.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default first retry delay.
pub const DEFAULT_INTERVAL_MS: u64 = 3_000;
/// Intervals below this fall back to [`DEFAULT_INTERVAL_MS`].
pub const MIN_INTERVAL_MS: u64 = 100;
/// Default growth factor.
pub const DEFAULT_BASE: f64 = 2.0;
/// Largest accepted growth factor.
pub const MAX_BASE: f64 = 5.0;
/// Default number of exponential delays before cooling off.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default cool-off period.
pub const DEFAULT_COOL_OFF: Duration = Duration::from_secs(30 * 60);

const MAX_DELAY_MS: f64 = (u64::MAX / 4) as f64;

/// Produces the delay before the next retry.
pub trait BackoffPolicy: Send + Sync {
	/// Returns the next delay and advances the attempt counter.
	fn next_delay_in_millis(&mut self) -> u64;

	/// Starts the delay sequence over.
	fn reset_backoff(&mut self);
}

/// Settings for the upload backoff, as loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
	pub interval_ms: u64,
	pub base: f64,
	pub max_attempts: u32,
	pub cool_off: Duration,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			interval_ms: DEFAULT_INTERVAL_MS,
			base: DEFAULT_BASE,
			max_attempts: DEFAULT_MAX_ATTEMPTS,
			cool_off: DEFAULT_COOL_OFF,
		}
	}
}

impl BackoffConfig {
	pub fn build(&self) -> MaxAttemptsExponentialBackoff {
		MaxAttemptsExponentialBackoff::new(
			ExponentialBackoff::new(self.interval_ms, self.base),
			self.max_attempts,
			self.cool_off,
		)
	}
}

/// Exponential delay with uniform jitter.
#[derive(Debug)]
pub struct ExponentialBackoff {
	interval_ms: u64,
	base: f64,
	attempt: u32,
	rng: fastrand::Rng,
}

impl ExponentialBackoff {
	/// Creates a policy, replacing out-of-range settings with the defaults.
	pub fn new(interval_ms: u64, base: f64) -> Self {
		let interval_ms = if interval_ms < MIN_INTERVAL_MS {
			DEFAULT_INTERVAL_MS
		} else {
			interval_ms
		};
		let base = if base.is_finite() && base > 1.0 && base <= MAX_BASE {
			base
		} else {
			DEFAULT_BASE
		};
		Self {
			interval_ms,
			base,
			attempt: 0,
			rng: fastrand::Rng::new(),
		}
	}

	/// The delay for the current attempt before jitter is added.
	pub fn base_delay_in_millis(&self) -> u64 {
		let delay = self.interval_ms as f64 * self.base.powi(self.attempt.min(i32::MAX as u32) as i32);
		delay.min(MAX_DELAY_MS) as u64
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}
}

impl Default for ExponentialBackoff {
	fn default() -> Self {
		Self::new(DEFAULT_INTERVAL_MS, DEFAULT_BASE)
	}
}

impl BackoffPolicy for ExponentialBackoff {
	fn next_delay_in_millis(&mut self) -> u64 {
		let delay = self.base_delay_in_millis();
		self.attempt = self.attempt.saturating_add(1);
		let jitter = if delay > 0 {
			self.rng.u64(0..delay)
		} else {
			0
		};
		delay.saturating_add(jitter)
	}

	fn reset_backoff(&mut self) {
		self.attempt = 0;
	}
}

/// Bounds an exponential policy with a cool-off after `max_attempts`.
pub struct MaxAttemptsExponentialBackoff {
	policy: Box<dyn BackoffPolicy>,
	max_attempts: u32,
	cool_off: Duration,
	attempt: u32,
}

impl MaxAttemptsExponentialBackoff {
	pub fn new(policy: impl BackoffPolicy + 'static, max_attempts: u32, cool_off: Duration) -> Self {
		Self {
			policy: Box::new(policy),
			max_attempts: max_attempts.max(1),
			cool_off,
			attempt: 0,
		}
	}

	/// Consecutive delays handed out since the last reset.
	pub fn attempt(&self) -> u32 {
		self.attempt
	}
}

impl Default for MaxAttemptsExponentialBackoff {
	fn default() -> Self {
		BackoffConfig::default().build()
	}
}

impl BackoffPolicy for MaxAttemptsExponentialBackoff {
	fn next_delay_in_millis(&mut self) -> u64 {
		self.attempt += 1;
		if self.attempt > self.max_attempts {
			debug!(
				cool_off_ms = self.cool_off.as_millis() as u64,
				"max upload attempts reached, cooling off"
			);
			self.reset_backoff();
			return self.cool_off.as_millis() as u64;
		}

		let delay = self.policy.next_delay_in_millis();
		debug!(
			delay_ms = delay,
			attempt = self.attempt,
			max_attempts = self.max_attempts,
			"backing off before next upload"
		);
		delay
	}

	fn reset_backoff(&mut self) {
		self.attempt = 0;
		self.policy.reset_backoff();
	}
}
