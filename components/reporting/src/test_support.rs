/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Internal fakes shared by this crate's own `#[cfg(test)]` modules. Not
//! part of the public API; see [`crate::test_util`] (behind the
//! `test-util` feature) for the equivalent surface embedders can use.

#![cfg(test)]

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use url::Url;

use crate::capability::{ClientSnapshot, Clock, Delegate, Store, StoreError, UploadOutcome, Uploader};
use crate::model::{PartitionKey, Tick};
use crate::origin::ReportUrl;

pub fn report_url(s: &str) -> ReportUrl {
    ReportUrl::sanitize(&Url::parse(s).unwrap()).unwrap()
}

pub fn clock_tick(ms: u64) -> Tick {
    ms
}

#[derive(Default)]
pub struct FakeStore {
    pub loaded: Mutex<ClientSnapshot>,
    pub flushed: Mutex<Vec<ClientSnapshot>>,
}

pub fn noop_store() -> FakeStore {
    FakeStore::default()
}

impl Store for FakeStore {
    fn load_clients(&self) -> BoxFuture<'static, Result<ClientSnapshot, StoreError>> {
        let snapshot = self.loaded.lock().clone();
        Box::pin(async move { Ok(snapshot) })
    }

    fn flush(&self, snapshot: ClientSnapshot) -> BoxFuture<'static, Result<(), StoreError>> {
        self.flushed.lock().push(snapshot);
        Box::pin(async { Ok(()) })
    }
}

/// Always allows; counts calls made to the Delegate.
#[derive(Default)]
pub struct FakeDelegate {
    pub denied_hosts: Vec<String>,
}

impl Delegate for FakeDelegate {
    fn can_queue(&self, origin: &ReportUrl) -> bool {
        match origin.host_str() {
            Some(host) => !self.denied_hosts.iter().any(|h| h == host),
            None => false,
        }
    }
}

pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    pub fn new(start: u64) -> Self {
        FakeClock {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, by: u64) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Tick {
        self.now.load(Ordering::SeqCst)
    }
}

/// Scripted uploader: returns outcomes from a queue, recording every call.
pub struct FakeUploader {
    outcomes: Mutex<Vec<UploadOutcome>>,
    pub calls: Mutex<Vec<(Url, PartitionKey, Vec<u8>)>>,
}

impl FakeUploader {
    pub fn new(outcomes: Vec<UploadOutcome>) -> Self {
        FakeUploader {
            outcomes: Mutex::new(outcomes),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always(outcome: UploadOutcome) -> Self {
        FakeUploader {
            outcomes: Mutex::new(vec![outcome; 1024]),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl Uploader for FakeUploader {
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

#[derive(Default)]
pub struct RecordingObserver {
    pub reports_updates: std::sync::atomic::AtomicU64,
    pub clients_updates: std::sync::atomic::AtomicU64,
}

impl crate::cache::CacheObserver for RecordingObserver {
    fn on_reports_updated(&self) {
        self.reports_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn on_clients_updated(&self) {
        self.clients_updates.fetch_add(1, Ordering::SeqCst);
    }
}
