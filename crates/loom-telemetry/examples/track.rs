// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Records a few events and flushes them.
//!
//! ```sh
//! LOOM_TELEMETRY_WRITE_KEY=... \
//! LOOM_TELEMETRY_DATA_PLANE_URL=https://hosted.rudderlabs.com \
//! RUST_LOG=loom_telemetry=debug \
//! cargo run -p loom-telemetry --example track
//! ```

use loom_telemetry::{load_config, Analytics, EventOptions, Properties};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> loom_telemetry::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let config = load_config()?;
	let analytics = Analytics::new(config).await?;

	analytics.identify(
		"demo-user",
		Properties::new().insert("plan", "free"),
		EventOptions::new(),
	)?;
	analytics.screen("Settings", "Preferences", Properties::new(), EventOptions::new())?;
	analytics.track(
		"Thread Created",
		Properties::new().insert("model", "opus").insert("tools", 3),
		EventOptions::new().integration("Amplitude", false),
	)?;

	analytics.flush()?;
	tokio::time::sleep(std::time::Duration::from_secs(2)).await;
	analytics.shutdown().await
}
