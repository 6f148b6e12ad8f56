/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Ingests web-origin error/telemetry reports and per-origin endpoint
//! configuration, and delivers batched reports to reporting endpoints.
//!
//! The [`Service`] facade is the crate's entry point: it backlogs mutating
//! calls behind the initial asynchronous [`Store`](capability::Store) load,
//! then serializes them against the in-memory [`Cache`](cache::Cache).

pub mod arena;
pub mod browsing_data;
pub mod cache;
pub mod capability;
pub mod delivery;
pub mod header;
pub mod model;
pub mod origin;
pub mod policy;
pub mod service;
pub mod status;

#[cfg(feature = "test-util")]
pub mod test_util;

#[cfg(test)]
mod test_support;

pub use arena::ReportId;
pub use capability::{Clock, Delegate, Store, Uploader};
pub use model::{Endpoint, EndpointGroup, EndpointGroupKey, ReportStatus};
pub use policy::Policy;
pub use service::Service;
