// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! User identity and the actions that transition it.
//!
//! The anonymous id is never empty. Identifying as a different user replaces
//! traits and external ids; identifying as the same user merges them with the
//! new values winning.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::json::{merge_with_priority, JsonMap};
use crate::state::StateAction;

/// Generates a fresh anonymous id.
pub fn generate_anonymous_id() -> String {
	Uuid::new_v4().to_string()
}

/// An identifier for the user in an external system, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalId {
	pub id: String,
	#[serde(rename = "type")]
	pub id_type: String,
}

impl ExternalId {
	pub fn new(id_type: impl Into<String>, id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			id_type: id_type.into(),
		}
	}
}

/// Merges external id lists keeping one entry per type.
///
/// Entries keep the position of their first appearance; a later entry of the
/// same type replaces the earlier value.
pub fn merge_external_ids(current: &[ExternalId], incoming: &[ExternalId]) -> Vec<ExternalId> {
	let mut merged: Vec<ExternalId> = Vec::with_capacity(current.len() + incoming.len());
	for external_id in current.iter().chain(incoming) {
		match merged.iter_mut().find(|e| e.id_type == external_id.id_type) {
			Some(existing) => existing.id = external_id.id.clone(),
			None => merged.push(external_id.clone()),
		}
	}
	merged
}

/// Who the events are attributed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
	pub anonymous_id: String,
	#[serde(default)]
	pub user_id: String,
	#[serde(default)]
	pub traits: JsonMap,
	#[serde(default)]
	pub external_ids: Vec<ExternalId>,
}

impl UserIdentity {
	/// Creates an identity with a freshly generated anonymous id.
	pub fn new() -> Self {
		Self::with_anonymous_id(String::new())
	}

	/// Creates an identity with the given anonymous id, generating one if empty.
	pub fn with_anonymous_id(anonymous_id: impl Into<String>) -> Self {
		let anonymous_id = anonymous_id.into();
		Self {
			anonymous_id: if anonymous_id.is_empty() {
				generate_anonymous_id()
			} else {
				anonymous_id
			},
			user_id: String::new(),
			traits: JsonMap::new(),
			external_ids: Vec::new(),
		}
	}
}

impl Default for UserIdentity {
	fn default() -> Self {
		Self::new()
	}
}

/// Which parts of the identity a reset clears. Everything by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetEntries {
	pub anonymous_id: bool,
	pub user_id: bool,
	pub traits: bool,
}

impl Default for ResetEntries {
	fn default() -> Self {
		Self {
			anonymous_id: true,
			user_id: true,
			traits: true,
		}
	}
}

/// Transitions of [`UserIdentity`].
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityAction {
	/// Replace the anonymous id. An empty id regenerates one.
	SetAnonymousId(String),
	/// Identify a user, with replace-or-merge semantics for traits and ids.
	SetUserIdTraitsAndExternalIds {
		user_id: String,
		traits: JsonMap,
		external_ids: Vec<ExternalId>,
	},
	/// Record the new user id from an alias call.
	SetUserIdForAlias(String),
	/// Clear the selected parts of the identity.
	Reset(ResetEntries),
}

impl IdentityAction {
	pub fn set_user(
		user_id: impl Into<String>,
		traits: JsonMap,
		external_ids: Vec<ExternalId>,
	) -> Self {
		Self::SetUserIdTraitsAndExternalIds {
			user_id: user_id.into(),
			traits,
			external_ids,
		}
	}
}

impl StateAction<UserIdentity> for IdentityAction {
	fn reduce(&self, current: &UserIdentity) -> UserIdentity {
		match self {
			IdentityAction::SetAnonymousId(anonymous_id) => UserIdentity {
				anonymous_id: if anonymous_id.is_empty() {
					generate_anonymous_id()
				} else {
					anonymous_id.clone()
				},
				..current.clone()
			},
			IdentityAction::SetUserIdTraitsAndExternalIds {
				user_id,
				traits,
				external_ids,
			} => {
				if *user_id == current.user_id {
					UserIdentity {
						traits: merge_with_priority(traits, &current.traits),
						external_ids: merge_external_ids(&current.external_ids, external_ids),
						..current.clone()
					}
				} else {
					UserIdentity {
						anonymous_id: current.anonymous_id.clone(),
						user_id: user_id.clone(),
						traits: traits.clone(),
						external_ids: merge_external_ids(&[], external_ids),
					}
				}
			}
			IdentityAction::SetUserIdForAlias(user_id) => UserIdentity {
				user_id: user_id.clone(),
				..current.clone()
			},
			IdentityAction::Reset(entries) => {
				let mut next = current.clone();
				if entries.anonymous_id {
					next.anonymous_id = generate_anonymous_id();
				}
				if entries.user_id {
					next.user_id.clear();
					next.external_ids.clear();
				}
				if entries.traits {
					next.traits.clear();
				}
				next
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use serde_json::{json, Value};

	fn traits(value: Value) -> JsonMap {
		value.as_object().unwrap().clone()
	}

	#[test]
	fn test_new_identity_has_anonymous_id() {
		let identity = UserIdentity::new();
		assert!(!identity.anonymous_id.is_empty());
		assert!(identity.user_id.is_empty());
	}

	#[test]
	fn test_empty_anonymous_id_is_regenerated() {
		let identity = UserIdentity::with_anonymous_id("");
		assert!(!identity.anonymous_id.is_empty());

		let next = IdentityAction::SetAnonymousId(String::new()).reduce(&identity);
		assert!(!next.anonymous_id.is_empty());
		assert_ne!(next.anonymous_id, identity.anonymous_id);
	}

	#[test]
	fn test_same_user_merges_traits_new_wins() {
		let identity = IdentityAction::set_user("u1", traits(json!({"a": 1, "b": 1})), vec![
			ExternalId::new("brazeId", "b-1"),
		])
		.reduce(&UserIdentity::new());

		let next = IdentityAction::set_user("u1", traits(json!({"b": 2, "c": 3})), vec![
			ExternalId::new("brazeId", "b-2"),
			ExternalId::new("amplitudeId", "a-1"),
		])
		.reduce(&identity);

		assert_eq!(Value::Object(next.traits), json!({"a": 1, "b": 2, "c": 3}));
		assert_eq!(next.external_ids, vec![
			ExternalId::new("brazeId", "b-2"),
			ExternalId::new("amplitudeId", "a-1"),
		]);
	}

	#[test]
	fn test_different_user_replaces_traits() {
		let identity = IdentityAction::set_user("u1", traits(json!({"a": 1})), vec![
			ExternalId::new("brazeId", "b-1"),
		])
		.reduce(&UserIdentity::new());

		let next = IdentityAction::set_user("u2", traits(json!({"z": 9})), Vec::new()).reduce(&identity);

		assert_eq!(next.user_id, "u2");
		assert_eq!(next.anonymous_id, identity.anonymous_id);
		assert_eq!(Value::Object(next.traits), json!({"z": 9}));
		assert!(next.external_ids.is_empty());
	}

	#[test]
	fn test_alias_sets_user_id_only() {
		let identity =
			IdentityAction::set_user("u1", traits(json!({"a": 1})), Vec::new()).reduce(&UserIdentity::new());
		let next = IdentityAction::SetUserIdForAlias("u9".to_string()).reduce(&identity);
		assert_eq!(next.user_id, "u9");
		assert_eq!(next.traits, identity.traits);
	}

	#[test]
	fn test_reset_all() {
		let identity = IdentityAction::set_user("u1", traits(json!({"a": 1})), vec![
			ExternalId::new("t", "1"),
		])
		.reduce(&UserIdentity::new());

		let next = IdentityAction::Reset(ResetEntries::default()).reduce(&identity);
		assert_ne!(next.anonymous_id, identity.anonymous_id);
		assert!(next.user_id.is_empty());
		assert!(next.traits.is_empty());
		assert!(next.external_ids.is_empty());
	}

	#[test]
	fn test_reset_keeps_unselected_entries() {
		let identity =
			IdentityAction::set_user("u1", traits(json!({"a": 1})), Vec::new()).reduce(&UserIdentity::new());
		let entries = ResetEntries {
			anonymous_id: false,
			user_id: true,
			traits: false,
		};
		let next = IdentityAction::Reset(entries).reduce(&identity);
		assert_eq!(next.anonymous_id, identity.anonymous_id);
		assert!(next.user_id.is_empty());
		assert_eq!(next.traits, identity.traits);
	}

	#[test]
	fn test_identity_serde_camel_case() {
		let identity = UserIdentity {
			anonymous_id: "anon".to_string(),
			user_id: "u".to_string(),
			traits: JsonMap::new(),
			external_ids: vec![ExternalId::new("brazeId", "1")],
		};
		let value = serde_json::to_value(&identity).unwrap();
		assert_eq!(value["anonymousId"], "anon");
		assert_eq!(value["externalIds"][0]["type"], "brazeId");
	}

	proptest! {
		#[test]
		fn same_user_new_value_wins(
			old in proptest::collection::btree_map("[a-z]{1,6}", 0i64..1000, 0..8),
			new in proptest::collection::btree_map("[a-z]{1,6}", 0i64..1000, 0..8),
		) {
			let to_map = |m: &std::collections::BTreeMap<String, i64>| {
				m.iter().map(|(k, v)| (k.clone(), json!(v))).collect::<JsonMap>()
			};
			let identity = IdentityAction::set_user("same", to_map(&old), Vec::new())
				.reduce(&UserIdentity::new());
			let next = IdentityAction::set_user("same", to_map(&new), Vec::new()).reduce(&identity);

			for (k, v) in &new {
				prop_assert_eq!(next.traits.get(k), Some(&json!(v)));
			}
			for (k, v) in &old {
				if !new.contains_key(k) {
					prop_assert_eq!(next.traits.get(k), Some(&json!(v)));
				}
			}
		}

		#[test]
		fn different_user_discards_previous(
			old in proptest::collection::btree_map("[a-z]{1,6}", 0i64..1000, 1..8),
		) {
			let old_map: JsonMap = old.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
			let identity = IdentityAction::set_user("first", old_map, vec![ExternalId::new("t", "1")])
				.reduce(&UserIdentity::new());
			let next = IdentityAction::set_user("second", JsonMap::new(), Vec::new()).reduce(&identity);
			prop_assert!(next.traits.is_empty());
			prop_assert!(next.external_ids.is_empty());
		}
	}
}
