/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Public test doubles for embedders exercising [`crate::Service`] against
//! fakes instead of real transport/persistence, behind the `test-util`
//! feature. Mirrors this crate's own internal `test_support` module, kept
//! separate so the public surface can evolve independently of the fakes
//! used by this crate's own `#[cfg(test)]` suite.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use url::Url;

use crate::capability::{ClientSnapshot, Clock, Delegate, Store, StoreError, UploadOutcome, Uploader};
use crate::model::{PartitionKey, Tick};
use crate::origin::ReportUrl;

/// A [`Store`] that never persists anything: `load_clients` always yields an
/// empty snapshot, `flush` is a no-op that records what it was given.
#[derive(Default)]
pub struct NullStore {
    pub flushed: Mutex<Vec<ClientSnapshot>>,
}

impl Store for NullStore {
    fn load_clients(&self) -> BoxFuture<'static, Result<ClientSnapshot, StoreError>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn flush(&self, snapshot: ClientSnapshot) -> BoxFuture<'static, Result<(), StoreError>> {
        self.flushed.lock().push(snapshot);
        Box::pin(async { Ok(()) })
    }
}

/// A [`Delegate`] that allows every origin.
#[derive(Default)]
pub struct AllowAllDelegate;

impl Delegate for AllowAllDelegate {
    fn can_queue(&self, _origin: &ReportUrl) -> bool {
        true
    }
}

/// A [`Clock`] whose tick an embedder's test advances explicitly, instead of
/// tracking wall-clock time.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Tick) -> Self {
        ManualClock {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, by: Tick) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new(0)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        self.now.load(Ordering::SeqCst)
    }
}

/// An [`Uploader`] that yields scripted outcomes in order (falling back to
/// `Failure` once the script is exhausted) and records every call it
/// receives, for asserting on payload shape in embedder tests.
#[derive(Default)]
pub struct RecordingUploader {
    outcomes: Mutex<Vec<UploadOutcome>>,
    pub calls: Mutex<Vec<(Url, PartitionKey, Vec<u8>)>>,
}

impl RecordingUploader {
    pub fn new(outcomes: Vec<UploadOutcome>) -> Self {
        RecordingUploader {
            outcomes: Mutex::new(outcomes),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always(outcome: UploadOutcome) -> Self {
        RecordingUploader::new(vec![outcome; 1024])
    }
}

impl Uploader for RecordingUploader {
    fn upload(
        &self,
        endpoint_url: Url,
        partition: PartitionKey,
        payload: Vec<u8>,
    ) -> BoxFuture<'static, UploadOutcome> {
        self.calls.lock().push((endpoint_url, partition, payload));
        let outcome = {
            let mut outcomes = self.outcomes.lock();
            if outcomes.is_empty() {
                UploadOutcome::Failure
            } else {
                outcomes.remove(0)
            }
        };
        Box::pin(async move { outcome })
    }
}
