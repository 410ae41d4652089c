// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{BatchFileStore, PropertiesStore, Storage, StorageKey, StorageValue};
use crate::error::{ConfigError, Result};

const PROPERTIES_FILE: &str = "properties.json";

/// File-backed [`Storage`] rooted at `{base_dir}/{write_key}`.
pub struct FileStorage {
	dir: PathBuf,
	properties: Arc<PropertiesStore>,
	batches: BatchFileStore,
}

impl FileStorage {
	pub async fn open(base_dir: impl AsRef<Path>, write_key: &str) -> Result<Self> {
		let dir = base_dir.as_ref().join(write_key);
		tokio::fs::create_dir_all(&dir).await?;

		let properties = Arc::new(PropertiesStore::open(dir.join(PROPERTIES_FILE)).await?);
		let batches = BatchFileStore::new(&dir, write_key, Arc::clone(&properties));

		info!(dir = %dir.display(), "initialized telemetry storage");
		Ok(Self {
			dir,
			properties,
			batches,
		})
	}

	/// Opens storage under `$XDG_DATA_HOME/loom/telemetry`.
	pub async fn from_xdg(write_key: &str) -> Result<Self> {
		let data_dir = dirs::data_dir().ok_or(ConfigError::DataDirNotFound)?;
		Self::open(data_dir.join("loom").join("telemetry"), write_key).await
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}
}

#[async_trait]
impl Storage for FileStorage {
	async fn write(&self, key: StorageKey, value: StorageValue) -> Result<()> {
		self.properties.write(key, value).await
	}

	async fn remove(&self, key: StorageKey) -> Result<()> {
		self.properties.remove(key).await
	}

	async fn read_string(&self, key: StorageKey, default: &str) -> String {
		self.properties.read_string(key, default).await
	}

	async fn read_int(&self, key: StorageKey, default: i32) -> i32 {
		self.properties.read_int(key, default).await
	}

	async fn read_long(&self, key: StorageKey, default: i64) -> i64 {
		self.properties.read_long(key, default).await
	}

	async fn read_boolean(&self, key: StorageKey, default: bool) -> bool {
		self.properties.read_boolean(key, default).await
	}

	async fn append_event(&self, payload: &str) -> Result<()> {
		self.batches.append(payload).await
	}

	async fn read_file_list(&self) -> Result<Vec<PathBuf>> {
		self.batches.read().await
	}

	async fn remove_file(&self, path: &Path) -> bool {
		self.batches.remove(path).await
	}

	async fn rollover(&self) -> Result<()> {
		self.batches.rollover().await
	}

	async fn close(&self) -> Result<()> {
		self.batches.rollover().await
	}

	async fn delete(&self) -> Result<()> {
		self.batches.delete_all().await?;
		self.properties.clear().await
	}
}
