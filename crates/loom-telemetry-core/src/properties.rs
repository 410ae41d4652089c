// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Helper for building event properties and user traits.

use serde_json::Value;

use crate::json::JsonMap;

/// A builder for event properties, group traits or user traits.
///
/// # Example
///
/// ```
/// use loom_telemetry_core::Properties;
///
/// let props = Properties::new()
///     .insert("screen", "settings")
///     .insert("duration_ms", 1200)
///     .insert("dark_mode", true);
/// assert_eq!(props.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
	inner: JsonMap,
}

impl Properties {
	pub fn new() -> Self {
		Self {
			inner: JsonMap::new(),
		}
	}

	/// Inserts a key-value pair, replacing any previous value for the key.
	pub fn insert<K, V>(mut self, key: K, value: V) -> Self
	where
		K: Into<String>,
		V: Into<Value>,
	{
		self.inner.insert(key.into(), value.into());
		self
	}

	/// Merges `other` into these properties; `other` wins on key collision.
	pub fn merge(mut self, other: Properties) -> Self {
		self.inner.extend(other.inner);
		self
	}

	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}

	pub fn len(&self) -> usize {
		self.inner.len()
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.inner.get(key)
	}

	pub fn into_map(self) -> JsonMap {
		self.inner
	}
}

impl From<Properties> for JsonMap {
	fn from(props: Properties) -> Self {
		props.inner
	}
}

impl From<Properties> for Value {
	fn from(props: Properties) -> Self {
		Value::Object(props.inner)
	}
}

impl From<JsonMap> for Properties {
	fn from(map: JsonMap) -> Self {
		Self { inner: map }
	}
}

impl From<Value> for Properties {
	fn from(value: Value) -> Self {
		match value {
			Value::Object(map) => Self { inner: map },
			_ => Self::new(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use serde_json::json;

	#[test]
	fn test_properties_new_is_empty() {
		let props = Properties::new();
		assert!(props.is_empty());
		assert_eq!(props.len(), 0);
	}

	#[test]
	fn test_properties_merge_other_wins() {
		let base = Properties::new().insert("plan", "free").insert("seats", 1);
		let update = Properties::new().insert("plan", "pro");
		let merged = base.merge(update);
		assert_eq!(merged.get("plan"), Some(&json!("pro")));
		assert_eq!(merged.get("seats"), Some(&json!(1)));
	}

	#[test]
	fn test_properties_from_non_object_is_empty() {
		let props = Properties::from(json!([1, 2, 3]));
		assert!(props.is_empty());
	}

	#[test]
	fn test_properties_into_map() {
		let map: JsonMap = Properties::new().insert("k", "v").into();
		assert_eq!(Value::Object(map), json!({"k": "v"}));
	}

	proptest! {
		#[test]
		fn merge_keeps_every_key(
			left in proptest::collection::btree_map("[a-z]{1,8}", 0i64..100, 0..10),
			right in proptest::collection::btree_map("[a-z]{1,8}", 0i64..100, 0..10),
		) {
			let l = left.iter().fold(Properties::new(), |p, (k, v)| p.insert(k.clone(), *v));
			let r = right.iter().fold(Properties::new(), |p, (k, v)| p.insert(k.clone(), *v));
			let merged = l.merge(r);

			for (k, v) in &right {
				prop_assert_eq!(merged.get(k), Some(&json!(v)));
			}
			for (k, v) in &left {
				if !right.contains_key(k) {
					prop_assert_eq!(merged.get(k), Some(&json!(v)));
				}
			}
		}
	}
}
