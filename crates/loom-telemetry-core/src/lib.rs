// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom telemetry SDK.
//!
//! This crate holds the pieces of the telemetry pipeline that need no async
//! runtime: the event model, user identity and its transitions, the cached
//! source configuration, a small observable state container, and the JSON
//! helpers used to build and patch on-disk batch files. The async client in
//! `loom-telemetry` builds on these types.
//!
//! # Example
//!
//! ```
//! use loom_telemetry_core::{Event, Properties, State, UserIdentity, IdentityAction};
//!
//! let identity = State::new(UserIdentity::new());
//! identity.dispatch(IdentityAction::set_user(
//!     "user-1",
//!     Properties::new().insert("plan", "pro").into(),
//!     Vec::new(),
//! ));
//!
//! let mut event = Event::track("Checkout Started", Properties::new().insert("total", 42).into());
//! event.prepare(&identity.value());
//! assert_eq!(event.user_id, "user-1");
//! ```

pub mod error;
pub mod event;
pub mod identity;
pub mod json;
pub mod options;
pub mod properties;
pub mod source_config;
pub mod state;

pub use error::{CoreError, Result};
pub use event::{Event, EventKind, DEFAULT_CHANNEL};
pub use identity::{generate_anonymous_id, ExternalId, IdentityAction, ResetEntries, UserIdentity};
pub use json::JsonMap;
pub use options::EventOptions;
pub use properties::Properties;
pub use source_config::{Destination, Source, SourceConfig, SourceConfigAction};
pub use state::{State, StateAction, SubscriptionId};
