/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! End-to-end scenario tests (spec §8, S1–S6), run against the public
//! `test-util` fakes. Run with `cargo test --features test-util`.

#![cfg(feature = "test-util")]

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reporting::capability::{ClientSnapshot, Store, StoreError, UploadOutcome};
use reporting::cache::DataTypeMask;
use reporting::model::{IsolationInfo, PartitionKey, ReportingSource};
use reporting::test_util::{AllowAllDelegate, ManualClock, NullStore, RecordingUploader};
use reporting::{Policy, Service};
use url::Url;

/// A [`Store`] whose `load_clients` resolves only after a fixed delay, for
/// exercising the backlog-before-load path (S1).
struct DelayedStore {
    delay: Duration,
}

impl Store for DelayedStore {
    fn load_clients(&self) -> BoxFuture<'static, Result<ClientSnapshot, StoreError>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(Vec::new())
        })
    }

    fn flush(&self, _snapshot: ClientSnapshot) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }
}

async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

fn no_store_service(
    uploader: Arc<RecordingUploader>,
    clock: Arc<ManualClock>,
) -> Service<NullStore, RecordingUploader, AllowAllDelegate, ManualClock> {
    Service::new(Policy::default(), None, Arc::new(AllowAllDelegate), uploader, clock)
}

#[tokio::test(start_paused = true)]
async fn s1_ingest_before_load() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(DelayedStore { delay: Duration::from_millis(100) });
    let mut service: Service<DelayedStore, RecordingUploader, AllowAllDelegate, ManualClock> = Service::new(
        Policy::default(),
        Some(store),
        Arc::new(AllowAllDelegate),
        Arc::new(RecordingUploader::always(UploadOutcome::Success)),
        clock.clone(),
    );

    service.queue_report(
        &Url::parse("https://a.test/x").unwrap(),
        None,
        PartitionKey::empty(),
        "ua".into(),
        "g".into(),
        "t".into(),
        serde_json::json!({}),
        0,
    );

    tokio::time::advance(Duration::from_millis(99)).await;
    clock.advance(99);
    settle().await;
    service.pump().await;
    assert!(service.status_as_value()["reports"].as_array().unwrap().is_empty());

    tokio::time::advance(Duration::from_millis(1)).await;
    clock.advance(1);
    settle().await;
    service.pump().await;

    let snapshot = service.status_as_value();
    let reports = snapshot["reports"].as_array().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["url"], serde_json::json!("https://a.test/"));
}

#[tokio::test]
async fn s2_header_then_delivery() {
    let clock = Arc::new(ManualClock::new(0));
    let uploader = Arc::new(RecordingUploader::always(UploadOutcome::Success));
    let mut service = no_store_service(uploader.clone(), clock);

    service.process_report_to_header(
        &Url::parse("https://a.test/").unwrap(),
        PartitionKey::empty(),
        r#"{"group":"g","max_age":3600,"endpoints":[{"url":"https://r.test/r"}]}"#,
    );
    service.queue_report(
        &Url::parse("https://a.test/x").unwrap(),
        None,
        PartitionKey::empty(),
        "ua".into(),
        "g".into(),
        "t".into(),
        serde_json::json!({}),
        0,
    );

    service.force_delivery_tick();
    settle().await;
    service.pump().await;

    let calls = uploader.calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0.as_str(), "https://r.test/r");
    drop(calls);
    assert!(service.status_as_value()["reports"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn s3_endpoint_removal_falls_back_to_next_endpoint() {
    let clock = Arc::new(ManualClock::new(0));
    let uploader = Arc::new(RecordingUploader::new(vec![
        UploadOutcome::RemoveEndpoint,
        UploadOutcome::Success,
    ]));
    let mut service: Service<NullStore, RecordingUploader, AllowAllDelegate, ManualClock> = Service::new(
        Policy::default(),
        None,
        Arc::new(AllowAllDelegate),
        uploader.clone(),
        clock,
    );

    service.process_report_to_header(
        &Url::parse("https://a.test/").unwrap(),
        PartitionKey::empty(),
        r#"{"group":"g","max_age":3600,"endpoints":[
            {"url":"https://r.test/e1","priority":1},
            {"url":"https://r.test/e2","priority":2}
        ]}"#,
    );
    service.queue_report(
        &Url::parse("https://a.test/x").unwrap(),
        None,
        PartitionKey::empty(),
        "ua".into(),
        "g".into(),
        "t".into(),
        serde_json::json!({}),
        0,
    );

    service.force_delivery_tick();
    settle().await;
    service.pump().await;

    service.force_delivery_tick();
    settle().await;
    service.pump().await;

    let calls = uploader.calls.lock();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0.as_str(), "https://r.test/e1");
    assert_eq!(calls[1].0.as_str(), "https://r.test/e2");

    let snapshot = service.status_as_value();
    assert!(snapshot["reports"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn s4_browsing_data_wipe_by_origin() {
    let clock = Arc::new(ManualClock::new(0));
    let uploader = Arc::new(RecordingUploader::always(UploadOutcome::Success));
    let mut service = no_store_service(uploader, clock);

    for _ in 0..3 {
        service.queue_report(
            &Url::parse("https://a.test/x").unwrap(),
            None,
            PartitionKey::empty(),
            "ua".into(),
            "g".into(),
            "t".into(),
            serde_json::json!({}),
            0,
        );
    }
    for _ in 0..2 {
        service.queue_report(
            &Url::parse("https://b.test/x").unwrap(),
            None,
            PartitionKey::empty(),
            "ua".into(),
            "g".into(),
            "t".into(),
            serde_json::json!({}),
            0,
        );
    }

    service.remove_browsing_data(DataTypeMask::REPORTS, |url| url.host_str() == Some("a.test"));

    let snapshot = service.status_as_value();
    let reports = snapshot["reports"].as_array().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r["url"] == serde_json::json!("https://b.test/")));
}

#[tokio::test]
async fn s5_source_expiry_drains_in_one_upload() {
    let clock = Arc::new(ManualClock::new(0));
    let uploader = Arc::new(RecordingUploader::always(UploadOutcome::Success));
    let mut service: Service<NullStore, RecordingUploader, AllowAllDelegate, ManualClock> = Service::new(
        Policy::default(),
        None,
        Arc::new(AllowAllDelegate),
        uploader.clone(),
        clock,
    );

    let source = ReportingSource::generate();
    let mut endpoints = std::collections::HashMap::new();
    endpoints.insert("main".to_owned(), Url::parse("https://r.test/r").unwrap());
    service.set_document_reporting_endpoints(
        source,
        &Url::parse("https://a.test/").unwrap(),
        IsolationInfo::default(),
        PartitionKey::empty(),
        endpoints,
    );
    for _ in 0..2 {
        service.queue_report(
            &Url::parse("https://a.test/x").unwrap(),
            Some(source),
            PartitionKey::empty(),
            "ua".into(),
            "main".into(),
            "t".into(),
            serde_json::json!({}),
            0,
        );
    }

    service.send_reports_and_remove_source(source);
    settle().await;
    service.pump().await;

    let calls = uploader.calls.lock();
    assert_eq!(calls.len(), 1);
    let payload: serde_json::Value = serde_json::from_slice(&calls[0].2).unwrap();
    assert_eq!(payload.as_array().unwrap().len(), 2);

    let snapshot = service.status_as_value();
    assert!(snapshot["reports"].as_array().unwrap().is_empty());
    assert!(
        snapshot["clients"]
            .as_array()
            .unwrap()
            .iter()
            .all(|c| c["source"] != serde_json::json!(source.to_string()))
    );
}

#[tokio::test]
async fn s6_shutdown_cancels_backlog() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(DelayedStore { delay: Duration::from_millis(100) });
    let uploader = Arc::new(RecordingUploader::always(UploadOutcome::Success));
    let mut service: Service<DelayedStore, RecordingUploader, AllowAllDelegate, ManualClock> = Service::new(
        Policy::default(),
        Some(store),
        Arc::new(AllowAllDelegate),
        uploader.clone(),
        clock,
    );

    for i in 0..5 {
        service.queue_report(
            &Url::parse(&format!("https://a.test/{i}")).unwrap(),
            None,
            PartitionKey::empty(),
            "ua".into(),
            "g".into(),
            "t".into(),
            serde_json::json!({}),
            0,
        );
    }
    service.on_shutdown();

    tokio::time::pause();
    tokio::time::advance(Duration::from_millis(200)).await;
    settle().await;
    service.pump().await;

    assert!(uploader.calls.lock().is_empty());
}
