// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Plugins installed by [`crate::Analytics`].

mod dataplane;
mod library_info;

pub use dataplane::{DataplanePlugin, DATAPLANE_PLUGIN_KEY};
pub use library_info::{LibraryInfoPlugin, LIBRARY_INFO_PLUGIN_KEY};
