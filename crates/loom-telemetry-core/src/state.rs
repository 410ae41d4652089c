// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! A small observable state container driven by reducer actions.
//!
//! `dispatch` runs the reducer and notifies subscribers while holding the
//! dispatch lock, so two dispatches never interleave and subscribers see
//! transitions in order. Subscribers receive the current value as soon as
//! they subscribe. A subscriber must not call `dispatch` on the same state.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// A pure transition from one state value to the next.
pub trait StateAction<T>: Send + Sync {
	fn reduce(&self, current: &T) -> T;
}

/// Identifies a subscription so it can be removed again.
pub type SubscriptionId = u64;

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscribers<T> {
	next_id: SubscriptionId,
	entries: Vec<(SubscriptionId, Subscriber<T>)>,
}

/// Holds a value of type `T` that only changes through [`State::dispatch`].
pub struct State<T> {
	value: RwLock<T>,
	dispatch_lock: Mutex<()>,
	subscribers: Mutex<Subscribers<T>>,
}

fn lock<G>(mutex: &Mutex<G>) -> MutexGuard<'_, G> {
	mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: Clone + Send + Sync + 'static> State<T> {
	pub fn new(initial: T) -> Self {
		Self {
			value: RwLock::new(initial),
			dispatch_lock: Mutex::new(()),
			subscribers: Mutex::new(Subscribers {
				next_id: 0,
				entries: Vec::new(),
			}),
		}
	}

	/// Returns a snapshot of the current value.
	pub fn value(&self) -> T {
		self.value.read().unwrap_or_else(|e| e.into_inner()).clone()
	}

	/// Applies `action` to the current value and notifies subscribers.
	///
	/// Returns the new value.
	pub fn dispatch<A: StateAction<T>>(&self, action: A) -> T {
		let _dispatch = lock(&self.dispatch_lock);

		let next = {
			let mut value = self.value.write().unwrap_or_else(|e| e.into_inner());
			let next = action.reduce(&value);
			*value = next.clone();
			next
		};

		let subscribers: Vec<Subscriber<T>> = lock(&self.subscribers)
			.entries
			.iter()
			.map(|(_, s)| Arc::clone(s))
			.collect();
		for subscriber in subscribers {
			subscriber(&next);
		}

		next
	}

	/// Registers a subscriber and immediately calls it with the current value.
	pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
	where
		F: Fn(&T) + Send + Sync + 'static,
	{
		let _dispatch = lock(&self.dispatch_lock);
		let subscriber: Subscriber<T> = Arc::new(subscriber);

		let id = {
			let mut subscribers = lock(&self.subscribers);
			let id = subscribers.next_id;
			subscribers.next_id += 1;
			subscribers.entries.push((id, Arc::clone(&subscriber)));
			id
		};

		subscriber(&self.value());
		id
	}

	/// Removes a subscriber. Returns false if it was not registered.
	pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
		let mut subscribers = lock(&self.subscribers);
		let before = subscribers.entries.len();
		subscribers.entries.retain(|(entry_id, _)| *entry_id != id);
		subscribers.entries.len() != before
	}
}

impl<T: std::fmt::Debug> std::fmt::Debug for State<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("State")
			.field("value", &self.value)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct Add(i64);

	impl StateAction<i64> for Add {
		fn reduce(&self, current: &i64) -> i64 {
			current + self.0
		}
	}

	#[test]
	fn test_dispatch_updates_value() {
		let state = State::new(1i64);
		assert_eq!(state.dispatch(Add(2)), 3);
		assert_eq!(state.value(), 3);
	}

	#[test]
	fn test_subscribe_receives_initial_value() {
		let state = State::new(7i64);
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		state.subscribe(move |v| sink.lock().unwrap().push(*v));
		assert_eq!(*seen.lock().unwrap(), vec![7]);
	}

	#[test]
	fn test_subscribers_see_every_transition_in_order() {
		let state = State::new(0i64);
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		state.subscribe(move |v| sink.lock().unwrap().push(*v));

		state.dispatch(Add(1));
		state.dispatch(Add(10));
		assert_eq!(*seen.lock().unwrap(), vec![0, 1, 11]);
	}

	#[test]
	fn test_unsubscribe_stops_notifications() {
		let state = State::new(0i64);
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&calls);
		let id = state.subscribe(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
		});

		assert!(state.unsubscribe(id));
		assert!(!state.unsubscribe(id));
		state.dispatch(Add(1));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_subscriber_may_read_value() {
		let state = Arc::new(State::new(0i64));
		let observed = Arc::new(Mutex::new(Vec::new()));
		let (reader, sink) = (Arc::clone(&state), Arc::clone(&observed));
		state.subscribe(move |_| sink.lock().unwrap().push(reader.value()));
		state.dispatch(Add(5));
		assert_eq!(*observed.lock().unwrap(), vec![0, 5]);
	}

	#[test]
	fn test_concurrent_dispatch_is_serialized() {
		let state = Arc::new(State::new(0i64));
		let handles: Vec<_> = (0..8)
			.map(|_| {
				let state = Arc::clone(&state);
				std::thread::spawn(move || {
					for _ in 0..100 {
						state.dispatch(Add(1));
					}
				})
			})
			.collect();
		for handle in handles {
			handle.join().unwrap();
		}
		assert_eq!(state.value(), 800);
	}
}
