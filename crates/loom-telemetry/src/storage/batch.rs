// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Append-only batch files.
//!
//! Events are appended to a single open file named `{write_key}-{index}.tmp`.
//! Sealing writes the `sentAt` suffix, renames the file to
//! `{write_key}-{index}` and bumps the persisted index. Only sealed files are
//! listed for upload, so a `.tmp` left behind by a crash is never sent.
//!
//! All mutation goes through one async mutex: the size check, the write and a
//! possible rollover happen as a unit.
//!
//! A `.tmp` at the persisted index survives a restart: it is reopened and
//! appended to, after any torn trailing record has been cut off.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::IgnoredAny;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use loom_telemetry_core::json::{batch_suffix, iso8601_now, BATCH_PREFIX, BATCH_SEPARATOR};

use super::{PropertiesStore, StorageKey};
use crate::error::{Result, TelemetryError};

/// Serialized events at or above this size are rejected.
pub const MAX_EVENT_SIZE: usize = 32 * 1024;

/// An open batch over this size is sealed before the next append.
pub const MAX_BATCH_SIZE: u64 = 500 * 1024;

const TMP_SUFFIX: &str = ".tmp";

struct OpenBatch {
	index: i64,
	path: PathBuf,
	file: File,
	size: u64,
	events: usize,
}

impl OpenBatch {
	async fn write_event(&mut self, payload: &str) -> Result<()> {
		let mut bytes = Vec::with_capacity(payload.len() + 1);
		if self.events > 0 {
			bytes.extend_from_slice(BATCH_SEPARATOR.as_bytes());
		}
		bytes.extend_from_slice(payload.as_bytes());

		if let Err(e) = self.write_all(&bytes).await {
			self.truncate_to_size().await;
			return Err(e);
		}
		self.size += bytes.len() as u64;
		self.events += 1;
		Ok(())
	}

	async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
		self.file.write_all(bytes).await?;
		self.file.flush().await?;
		Ok(())
	}

	/// Cuts off anything written past the last complete record.
	async fn truncate_to_size(&mut self) {
		if let Err(e) = self.file.set_len(self.size).await {
			warn!(path = %self.path.display(), error = %e, "failed to truncate batch file");
		}
	}
}

/// Length of the longest valid prefix of an open batch and the number of
/// events in it. `None` if the file does not start with the batch prefix.
fn resume_point(contents: &[u8]) -> Option<(usize, usize)> {
	let body = contents.strip_prefix(BATCH_PREFIX.as_bytes())?;
	let separator = BATCH_SEPARATOR.as_bytes();

	let mut valid = 0;
	let mut events = 0;
	loop {
		let start = if events == 0 { 0 } else { valid + separator.len() };
		if events > 0 && !body[valid..].starts_with(separator) {
			break;
		}
		if body.get(start) != Some(&b'{') {
			break;
		}
		let mut values = serde_json::Deserializer::from_slice(&body[start..]).into_iter::<IgnoredAny>();
		match values.next() {
			Some(Ok(_)) => {
				valid = start + values.byte_offset();
				events += 1;
			}
			_ => break,
		}
	}
	Some((BATCH_PREFIX.len() + valid, events))
}

pub struct BatchFileStore {
	dir: PathBuf,
	write_key: String,
	properties: Arc<PropertiesStore>,
	current: Mutex<Option<OpenBatch>>,
}

impl BatchFileStore {
	pub fn new(dir: impl Into<PathBuf>, write_key: impl Into<String>, properties: Arc<PropertiesStore>) -> Self {
		Self {
			dir: dir.into(),
			write_key: write_key.into(),
			properties,
			current: Mutex::new(None),
		}
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	/// Appends one serialized event, sealing the open batch first if it is full.
	pub async fn append(&self, payload: &str) -> Result<()> {
		if payload.len() >= MAX_EVENT_SIZE {
			return Err(TelemetryError::PayloadTooLarge {
				size: payload.len(),
				limit: MAX_EVENT_SIZE,
			});
		}

		let mut current = self.current.lock().await;

		if current.as_ref().is_some_and(|open| open.size > MAX_BATCH_SIZE) {
			self.seal_current(&mut current).await?;
		}
		if current.is_none() {
			*current = Some(self.open_batch().await?);
		}
		if let Some(open) = current.as_mut() {
			open.write_event(payload).await?;
		}
		Ok(())
	}

	/// Seals the open batch, if any.
	pub async fn rollover(&self) -> Result<()> {
		let mut current = self.current.lock().await;
		self.seal_current(&mut current).await
	}

	/// Sealed batch files ordered by index.
	pub async fn read(&self) -> Result<Vec<PathBuf>> {
		let mut entries = match tokio::fs::read_dir(&self.dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(e.into()),
		};

		let mut sealed = Vec::new();
		while let Some(entry) = entries.next_entry().await? {
			let name = entry.file_name();
			if let Some(index) = name.to_str().and_then(|n| self.sealed_index(n)) {
				sealed.push((index, entry.path()));
			}
		}

		sealed.sort_by_key(|(index, _)| *index);
		Ok(sealed.into_iter().map(|(_, path)| path).collect())
	}

	/// Deletes a batch file. A missing file is not an error.
	pub async fn remove(&self, path: &Path) -> bool {
		match tokio::fs::remove_file(path).await {
			Ok(()) => {
				debug!(path = %path.display(), "removed batch file");
				true
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
			Err(e) => {
				warn!(path = %path.display(), error = %e, "failed to remove batch file");
				false
			}
		}
	}

	/// Deletes every batch file for this write key, open or sealed.
	pub async fn delete_all(&self) -> Result<()> {
		let mut current = self.current.lock().await;
		*current = None;

		let mut entries = match tokio::fs::read_dir(&self.dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e.into()),
		};
		while let Some(entry) = entries.next_entry().await? {
			let name = entry.file_name();
			let Some(name) = name.to_str() else {
				continue;
			};
			let stem = name.strip_suffix(TMP_SUFFIX).unwrap_or(name);
			if self.sealed_index(stem).is_some() {
				self.remove(&entry.path()).await;
			}
		}
		Ok(())
	}

	fn sealed_index(&self, file_name: &str) -> Option<i64> {
		let index = file_name
			.strip_prefix(self.write_key.as_str())?
			.strip_prefix('-')?;
		if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
			return None;
		}
		index.parse().ok()
	}

	fn sealed_path(&self, index: i64) -> PathBuf {
		self.dir.join(format!("{}-{index}", self.write_key))
	}

	fn open_path(&self, index: i64) -> PathBuf {
		self.dir.join(format!("{}-{index}{TMP_SUFFIX}", self.write_key))
	}

	async fn open_batch(&self) -> Result<OpenBatch> {
		tokio::fs::create_dir_all(&self.dir).await?;

		let mut index = self.properties.read_long(StorageKey::FileIndex, 0).await;
		while tokio::fs::try_exists(self.sealed_path(index)).await? {
			warn!(index, "batch index already sealed, skipping ahead");
			index += 1;
		}

		let path = self.open_path(index);
		let resumed = match tokio::fs::read(&path).await {
			Ok(contents) => {
				let point = resume_point(&contents);
				if point.is_none() {
					warn!(path = %path.display(), "discarding unreadable batch file");
				}
				point.map(|(len, events)| (len, events, contents.len()))
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
			Err(e) => return Err(e.into()),
		};

		let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
		let (size, events) = match resumed {
			Some((len, events, on_disk)) => {
				if len < on_disk {
					warn!(path = %path.display(), dropped = on_disk - len, "cut torn record from batch file");
					file.set_len(len as u64).await?;
				}
				info!(path = %path.display(), events, "resumed batch file");
				(len as u64, events)
			}
			None => {
				file.set_len(0).await?;
				file.write_all(BATCH_PREFIX.as_bytes()).await?;
				file.flush().await?;
				debug!(path = %path.display(), "opened batch file");
				(BATCH_PREFIX.len() as u64, 0)
			}
		};

		Ok(OpenBatch {
			index,
			path,
			file,
			size,
			events,
		})
	}

	/// Seals the open batch and clears it. On failure the batch stays open
	/// with its contents intact.
	async fn seal_current(&self, current: &mut Option<OpenBatch>) -> Result<()> {
		let Some(open) = current.as_mut() else {
			return Ok(());
		};
		self.seal(open).await?;
		*current = None;
		Ok(())
	}

	async fn seal(&self, open: &mut OpenBatch) -> Result<()> {
		let suffix = batch_suffix(&iso8601_now());
		let sealed = self.sealed_path(open.index);
		let finished = async {
			open.write_all(suffix.as_bytes()).await?;
			open.file.sync_all().await?;
			tokio::fs::rename(&open.path, &sealed).await?;
			Ok::<_, TelemetryError>(())
		}
		.await;
		if let Err(e) = finished {
			open.truncate_to_size().await;
			return Err(e);
		}

		// The sealed name is already taken, so a lost index write is skipped over on the next open.
		if let Err(e) = self
			.properties
			.write(StorageKey::FileIndex, (open.index + 1).into())
			.await
		{
			warn!(index = open.index + 1, error = %e, "failed to persist batch index");
		}

		info!(
			path = %sealed.display(),
			events = open.events,
			bytes = open.size,
			"sealed batch file"
		);
		Ok(())
	}
}
