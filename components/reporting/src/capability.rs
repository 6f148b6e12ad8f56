/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The abstract capabilities the core consumes (spec §9 "Polymorphism"):
//! Uploader (one operation), Store (two), Delegate (one), Clock (one).
//! `Store::load_clients`/`flush` and `Uploader::upload` cross an async
//! boundary, so they return a boxed future the way `components/net` already
//! pulls in `futures::future::BoxFuture` for its own async backends; the
//! synchronous capabilities (`Delegate`, `Clock`) are plain trait methods.

use std::fmt;

use futures::future::BoxFuture;

use crate::model::{EndpointGroupKey, EndpointGroup, PartitionKey, Tick};
use crate::origin::ReportUrl;

/// A loaded or to-be-flushed snapshot of endpoint configuration. The
/// on-disk encoding is out of scope (spec §1); this is simply the in-memory
/// model the Store hands back or is handed to persist.
pub type ClientSnapshot = Vec<(EndpointGroupKey, EndpointGroup)>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreError;

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "persistent store operation failed")
    }
}

impl std::error::Error for StoreError {}

/// The persistent endpoint/group snapshot (spec §2 "Store").
pub trait Store: Send + Sync {
    /// Loads the persisted snapshot once, at Service startup. A failure is
    /// treated as starting from an empty cache (see `SPEC_FULL.md` §1).
    fn load_clients(&self) -> BoxFuture<'static, Result<ClientSnapshot, StoreError>>;

    /// Writes the current dirty set. Failures are logged and left for the
    /// next dirty flush; they never panic or block ingress.
    fn flush(&self, snapshot: ClientSnapshot) -> BoxFuture<'static, Result<(), StoreError>>;
}

/// Outcome of one upload attempt (spec §4.4, §7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UploadOutcome {
    /// The endpoint accepted the batch.
    Success,
    /// The endpoint is gone (HTTP 410); remove it and requeue the batch
    /// against any remaining endpoints in the group.
    RemoveEndpoint,
    /// Transient or non-410 permanent failure; retry with backoff up to
    /// `Policy.max_report_attempts`.
    Failure,
}

/// POSTs a JSON payload to an endpoint URL and yields an outcome (spec §2
/// "Uploader").
pub trait Uploader: Send + Sync {
    fn upload(
        &self,
        endpoint_url: url::Url,
        partition: PartitionKey,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, UploadOutcome>;
}

/// Per-origin permission predicate (spec §2 "Delegate").
pub trait Delegate: Send + Sync {
    fn can_queue(&self, origin: &ReportUrl) -> bool;
}

/// Monotonic tick source (spec §2 "Clock").
pub trait Clock: Send + Sync {
    fn now(&self) -> Tick;
}
