// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flush policies decide when the event queue forces an upload.
//!
//! - [`CountFlushPolicy`] fires once a number of events has been persisted.
//! - [`FrequencyFlushPolicy`] requests a flush on a fixed interval from a
//!   background task.
//! - [`StartupFlushPolicy`] fires on the first check after the queue starts.
//!
//! [`FlushPolicies`] composes them: it flushes if any policy says so, and
//! routes state updates and scheduling to the policies that care.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

/// Default number of events per flush.
pub const DEFAULT_FLUSH_AT: usize = 30;
/// Smallest accepted count threshold.
pub const MIN_FLUSH_AT: usize = 1;
/// Largest accepted count threshold.
pub const MAX_FLUSH_AT: usize = 100;
/// Default flush interval.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10_000;
/// Smallest accepted flush interval.
pub const MIN_FLUSH_INTERVAL_MS: u64 = 1;

/// Invoked by the frequency policy each time its interval elapses.
pub type FlushCallback = Arc<dyn Fn() + Send + Sync>;

/// Serializable description of a flush policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlushPolicyConfig {
	Count { threshold: usize },
	Frequency { interval_ms: u64 },
	Startup,
}

impl FlushPolicyConfig {
	/// Count(30) and Frequency(10s).
	pub fn defaults() -> Vec<FlushPolicyConfig> {
		vec![
			FlushPolicyConfig::Count {
				threshold: DEFAULT_FLUSH_AT,
			},
			FlushPolicyConfig::Frequency {
				interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
			},
		]
	}

	pub fn build(&self) -> FlushPolicy {
		match self {
			FlushPolicyConfig::Count { threshold } => FlushPolicy::Count(CountFlushPolicy::new(*threshold)),
			FlushPolicyConfig::Frequency { interval_ms } => {
				FlushPolicy::Frequency(FrequencyFlushPolicy::new(*interval_ms))
			}
			FlushPolicyConfig::Startup => FlushPolicy::Startup(StartupFlushPolicy::new()),
		}
	}
}

/// Flushes once `threshold` events have been persisted since the last reset.
#[derive(Debug, Clone)]
pub struct CountFlushPolicy {
	threshold: usize,
	count: usize,
}

impl CountFlushPolicy {
	/// Thresholds outside `1..=100` fall back to [`DEFAULT_FLUSH_AT`].
	pub fn new(threshold: usize) -> Self {
		let threshold = if (MIN_FLUSH_AT..=MAX_FLUSH_AT).contains(&threshold) {
			threshold
		} else {
			DEFAULT_FLUSH_AT
		};
		Self { threshold, count: 0 }
	}

	pub fn threshold(&self) -> usize {
		self.threshold
	}

	pub fn should_flush(&self) -> bool {
		self.count >= self.threshold
	}

	pub fn update_state(&mut self) {
		self.count += 1;
	}

	pub fn reset(&mut self) {
		self.count = 0;
	}
}

impl Default for CountFlushPolicy {
	fn default() -> Self {
		Self::new(DEFAULT_FLUSH_AT)
	}
}

/// Requests a flush every `interval` while scheduled.
#[derive(Debug)]
pub struct FrequencyFlushPolicy {
	interval: Duration,
	job: Option<JoinHandle<()>>,
}

impl FrequencyFlushPolicy {
	/// Intervals below [`MIN_FLUSH_INTERVAL_MS`] fall back to the default.
	pub fn new(interval_ms: u64) -> Self {
		let interval_ms = if interval_ms < MIN_FLUSH_INTERVAL_MS {
			DEFAULT_FLUSH_INTERVAL_MS
		} else {
			interval_ms
		};
		Self {
			interval: Duration::from_millis(interval_ms),
			job: None,
		}
	}

	pub fn interval(&self) -> Duration {
		self.interval
	}

	pub fn is_scheduled(&self) -> bool {
		self.job.as_ref().is_some_and(|job| !job.is_finished())
	}

	/// Starts the timer task. Does nothing if it is already running.
	///
	/// Must be called from within a tokio runtime.
	pub fn schedule(&mut self, on_flush: FlushCallback) {
		if self.is_scheduled() {
			return;
		}

		let interval = self.interval;
		debug!(interval_ms = interval.as_millis() as u64, "scheduling periodic flush");
		self.job = Some(tokio::spawn(async move {
			loop {
				tokio::time::sleep(interval).await;
				on_flush();
			}
		}));
	}

	/// Stops the timer task. Does nothing if it is not running.
	pub fn cancel_schedule(&mut self) {
		if let Some(job) = self.job.take() {
			job.abort();
			debug!("cancelled periodic flush");
		}
	}
}

impl Default for FrequencyFlushPolicy {
	fn default() -> Self {
		Self::new(DEFAULT_FLUSH_INTERVAL_MS)
	}
}

impl Drop for FrequencyFlushPolicy {
	fn drop(&mut self) {
		self.cancel_schedule();
	}
}

/// Flushes on the first check after construction or re-arming.
#[derive(Debug, Clone)]
pub struct StartupFlushPolicy {
	pending: bool,
}

impl StartupFlushPolicy {
	pub fn new() -> Self {
		Self { pending: true }
	}

	/// Returns true exactly once until [`StartupFlushPolicy::rearm`] is called.
	pub fn should_flush(&mut self) -> bool {
		std::mem::replace(&mut self.pending, false)
	}

	pub fn rearm(&mut self) {
		self.pending = true;
	}
}

impl Default for StartupFlushPolicy {
	fn default() -> Self {
		Self::new()
	}
}

/// One of the supported flush policies.
#[derive(Debug)]
pub enum FlushPolicy {
	Count(CountFlushPolicy),
	Frequency(FrequencyFlushPolicy),
	Startup(StartupFlushPolicy),
}

impl FlushPolicy {
	pub fn should_flush(&mut self) -> bool {
		match self {
			FlushPolicy::Count(policy) => policy.should_flush(),
			FlushPolicy::Frequency(_) => false,
			FlushPolicy::Startup(policy) => policy.should_flush(),
		}
	}
}

/// The set of flush policies owned by one event queue.
#[derive(Debug, Default)]
pub struct FlushPolicies {
	policies: Vec<FlushPolicy>,
}

impl FlushPolicies {
	pub fn new(policies: Vec<FlushPolicy>) -> Self {
		Self { policies }
	}

	pub fn from_config(configs: &[FlushPolicyConfig]) -> Self {
		Self::new(configs.iter().map(FlushPolicyConfig::build).collect())
	}

	pub fn policies(&self) -> &[FlushPolicy] {
		&self.policies
	}

	/// True if any policy wants a flush. Every policy is checked so one-shot
	/// policies are consumed even when another one already fired.
	pub fn should_flush(&mut self) -> bool {
		self
			.policies
			.iter_mut()
			.fold(false, |flush, policy| policy.should_flush() | flush)
	}

	/// Records one persisted event.
	pub fn update_state(&mut self) {
		for policy in &mut self.policies {
			if let FlushPolicy::Count(count) = policy {
				count.update_state();
			}
		}
	}

	/// Called after a flush has been dispatched.
	pub fn reset(&mut self) {
		for policy in &mut self.policies {
			if let FlushPolicy::Count(count) = policy {
				count.reset();
			}
		}
	}

	/// Starts periodic timers and re-arms startup policies.
	pub fn schedule(&mut self, on_flush: FlushCallback) {
		for policy in &mut self.policies {
			match policy {
				FlushPolicy::Frequency(frequency) => frequency.schedule(Arc::clone(&on_flush)),
				FlushPolicy::Startup(startup) => startup.rearm(),
				FlushPolicy::Count(_) => {}
			}
		}
	}

	pub fn cancel_schedule(&mut self) {
		for policy in &mut self.policies {
			if let FlushPolicy::Frequency(frequency) = policy {
				frequency.cancel_schedule();
			}
		}
	}
}
