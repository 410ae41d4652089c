// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! A JSON key-value file saved with write-to-temp then rename.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use loom_telemetry_core::JsonMap;

use super::{StorageKey, StorageValue};
use crate::error::Result;

pub struct PropertiesStore {
	path: PathBuf,
	values: Mutex<JsonMap>,
}

impl PropertiesStore {
	/// Opens the store at `path`, starting empty if the file is missing or unreadable.
	pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
		let path = path.into();
		let values = match tokio::fs::read_to_string(&path).await {
			Ok(content) => match serde_json::from_str::<JsonMap>(&content) {
				Ok(values) => values,
				Err(e) => {
					warn!(path = %path.display(), error = %e, "discarding corrupt properties file");
					JsonMap::new()
				}
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => JsonMap::new(),
			Err(e) => return Err(e.into()),
		};

		debug!(path = %path.display(), keys = values.len(), "opened properties store");
		Ok(Self {
			path,
			values: Mutex::new(values),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub async fn write(&self, key: StorageKey, value: StorageValue) -> Result<()> {
		let value = match value {
			StorageValue::Bool(v) => Value::Bool(v),
			StorageValue::Int(v) => Value::from(v),
			StorageValue::Long(v) => Value::from(v),
			StorageValue::String(v) => Value::String(v),
		};

		let mut values = self.values.lock().await;
		values.insert(key.as_str().to_string(), value);
		self.save(&values).await
	}

	pub async fn remove(&self, key: StorageKey) -> Result<()> {
		let mut values = self.values.lock().await;
		if values.remove(key.as_str()).is_some() {
			self.save(&values).await?;
		}
		Ok(())
	}

	pub async fn clear(&self) -> Result<()> {
		let mut values = self.values.lock().await;
		values.clear();
		match tokio::fs::remove_file(&self.path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	async fn get(&self, key: StorageKey) -> Option<Value> {
		self.values.lock().await.get(key.as_str()).cloned()
	}

	pub async fn read_string(&self, key: StorageKey, default: &str) -> String {
		match self.get(key).await {
			Some(Value::String(s)) => s,
			_ => default.to_string(),
		}
	}

	pub async fn read_int(&self, key: StorageKey, default: i32) -> i32 {
		self
			.get(key)
			.await
			.and_then(|v| v.as_i64())
			.and_then(|v| i32::try_from(v).ok())
			.unwrap_or(default)
	}

	pub async fn read_long(&self, key: StorageKey, default: i64) -> i64 {
		self
			.get(key)
			.await
			.and_then(|v| v.as_i64())
			.unwrap_or(default)
	}

	pub async fn read_boolean(&self, key: StorageKey, default: bool) -> bool {
		self
			.get(key)
			.await
			.and_then(|v| v.as_bool())
			.unwrap_or(default)
	}

	async fn save(&self, values: &JsonMap) -> Result<()> {
		let content = serde_json::to_vec_pretty(values)?;
		let tmp_path = self.path.with_extension("json.tmp");
		tokio::fs::write(&tmp_path, &content).await?;
		tokio::fs::rename(&tmp_path, &self.path).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[tokio::test]
	async fn test_values_survive_reopen() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("properties.json");

		let store = PropertiesStore::open(&path).await.unwrap();
		store.write(StorageKey::UserId, "u-1".into()).await.unwrap();
		store.write(StorageKey::FileIndex, 7i64.into()).await.unwrap();
		store.write(StorageKey::SourceIsEnabled, false.into()).await.unwrap();
		drop(store);

		let store = PropertiesStore::open(&path).await.unwrap();
		assert_eq!(store.read_string(StorageKey::UserId, "").await, "u-1");
		assert_eq!(store.read_long(StorageKey::FileIndex, 0).await, 7);
		assert!(!store.read_boolean(StorageKey::SourceIsEnabled, true).await);
	}

	#[tokio::test]
	async fn test_defaults_for_missing_or_mistyped_keys() {
		let dir = tempdir().unwrap();
		let store = PropertiesStore::open(dir.path().join("p.json")).await.unwrap();
		store.write(StorageKey::Traits, "not a number".into()).await.unwrap();

		assert_eq!(store.read_int(StorageKey::Traits, 3).await, 3);
		assert_eq!(store.read_string(StorageKey::AnonymousId, "dflt").await, "dflt");
		assert!(store.read_boolean(StorageKey::SourceIsEnabled, true).await);
	}

	#[tokio::test]
	async fn test_remove_and_clear() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("p.json");
		let store = PropertiesStore::open(&path).await.unwrap();
		store.write(StorageKey::UserId, "u".into()).await.unwrap();
		store.remove(StorageKey::UserId).await.unwrap();
		assert_eq!(store.read_string(StorageKey::UserId, "none").await, "none");

		store.write(StorageKey::UserId, "u".into()).await.unwrap();
		store.clear().await.unwrap();
		assert!(!path.exists());
	}

	#[tokio::test]
	async fn test_corrupt_file_starts_empty() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("p.json");
		std::fs::write(&path, "{not json").unwrap();
		let store = PropertiesStore::open(&path).await.unwrap();
		assert_eq!(store.read_long(StorageKey::FileIndex, 0).await, 0);
	}
}
