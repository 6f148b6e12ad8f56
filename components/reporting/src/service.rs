/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The public entry point (spec §4.6): backlogs mutating calls behind the
//! initial Store load, then serializes them against the Cache. Driven by a
//! single event loop the way `components/devtools/lib.rs`'s `run_server`
//! drives its accept/poll loop and `background_hang_monitor.rs` drives its
//! channel-fed worker — one owning task, one inbox, no locking.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use url::Url;

use crate::cache::{Cache, DataTypeMask};
use crate::capability::{Clock, Delegate, Store, StoreError, UploadOutcome, Uploader};
use crate::delivery::{DeliveryAgent, PreparedBatch};
use crate::header;
use crate::model::{EndpointGroupKey, IsolationInfo, PartitionKey, ReportingSource, Tick};
use crate::origin::ReportUrl;
use crate::policy::Policy;
use crate::status;

/// One ingress call captured for backlog replay (spec §9 "Coroutine control
/// flow": "model it explicitly as a FIFO of captured operations rather than
/// hiding it in language-level async").
enum PendingOperation {
    QueueReport {
        source: Option<ReportingSource>,
        partition: PartitionKey,
        url: ReportUrl,
        user_agent: String,
        group: String,
        type_: String,
        body: serde_json::Value,
        depth: u32,
        queued_at: Tick,
    },
    ApplyReportToGroups {
        origin: ReportUrl,
        partition: PartitionKey,
        groups: Vec<header::ParsedGroup>,
        now: Tick,
    },
    SetDocumentReportingEndpoints {
        source: ReportingSource,
        isolation_info: IsolationInfo,
        partition: PartitionKey,
        origin: ReportUrl,
        endpoints: HashMap<String, Url>,
        now: Tick,
    },
    SendReportsAndRemoveSource {
        source: ReportingSource,
    },
    RemoveBrowsingData {
        mask: DataTypeMask,
        predicate: Box<dyn Fn(&ReportUrl) -> bool + Send>,
    },
    RemoveAllBrowsingData {
        mask: DataTypeMask,
    },
}

enum ServiceEvent {
    StoreLoaded(Result<crate::capability::ClientSnapshot, StoreError>),
    UploadCompleted {
        batch: PreparedBatch,
        outcome: UploadOutcome,
        /// Set when this upload was the bypass path for a tombstoned
        /// source: the batch is discarded regardless of outcome instead of
        /// retried (spec §3 invariant 6).
        source_cleanup: Option<ReportingSource>,
    },
}

/// The reporting core's facade. Owns the Cache exclusively (spec §5 "Shared
/// resources") and must only ever be driven from one task.
pub struct Service<S: Store, U: Uploader, D: Delegate, C: Clock> {
    cache: Cache<S>,
    delivery: DeliveryAgent,
    shut_down: bool,
    initialized: bool,
    started_loading: bool,
    backlog: VecDeque<PendingOperation>,
    respect_partition_key: bool,
    reporting_enabled: bool,
    store: Option<Arc<S>>,
    delegate: Arc<D>,
    uploader: Arc<U>,
    clock: Arc<C>,
    event_tx: mpsc::UnboundedSender<ServiceEvent>,
    event_rx: mpsc::UnboundedReceiver<ServiceEvent>,
}

impl<S: Store + 'static, U: Uploader + 'static, D: Delegate, C: Clock> Service<S, U, D, C> {
    pub fn new(policy: Policy, store: Option<Arc<S>>, delegate: Arc<D>, uploader: Arc<U>, clock: Arc<C>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let respect_partition_key = policy.respect_partition_key;
        Service {
            cache: Cache::new(policy, store.clone()),
            delivery: DeliveryAgent::new(),
            shut_down: false,
            initialized: store.is_none(),
            started_loading: store.is_none(),
            backlog: VecDeque::new(),
            respect_partition_key,
            reporting_enabled: true,
            store,
            delegate,
            uploader,
            clock,
            event_tx,
            event_rx,
        }
    }

    /// Spec §9 "Global state": a field of the Service instance, not
    /// process-global.
    pub fn set_respect_partition_key(&mut self, value: bool) {
        self.respect_partition_key = value;
    }

    fn effective_partition(&self, partition: PartitionKey) -> PartitionKey {
        if self.respect_partition_key {
            partition
        } else {
            PartitionKey::empty()
        }
    }

    // ---- ingress ----------------------------------------------------------

    /// Spec §4.6 `queue_report`. Delegate check and URL sanitization happen
    /// before gating, as does recording `queued_at`, so that backlog replay
    /// preserves chronological age.
    #[allow(clippy::too_many_arguments)]
    pub fn queue_report(
        &mut self,
        url: &Url,
        source: Option<ReportingSource>,
        partition: PartitionKey,
        user_agent: String,
        group: String,
        type_: String,
        body: serde_json::Value,
        depth: u32,
    ) {
        if self.shut_down {
            return;
        }
        let Ok(origin) = ReportUrl::sanitize(url) else {
            return;
        };
        if !self.delegate.can_queue(&origin) {
            return;
        }
        let partition = self.effective_partition(partition);
        let queued_at = self.clock.now();
        self.gate(PendingOperation::QueueReport {
            source,
            partition,
            url: origin,
            user_agent,
            group,
            type_,
            body,
            depth,
            queued_at,
        });
    }

    /// Spec §4.6 `process_report_to_header`: size-limits and JSON-parses
    /// eagerly (a malformed header is dropped before ever reaching the
    /// backlog), then gates the already-validated groups.
    pub fn process_report_to_header(&mut self, origin: &Url, partition: PartitionKey, header_raw: &str) {
        if self.shut_down {
            return;
        }
        let Ok(origin) = ReportUrl::sanitize(origin) else {
            return;
        };
        let groups = match header::parse_report_to_header(header_raw) {
            Ok(groups) => groups,
            Err(err) => {
                log::debug!("reporting: dropping Report-To header: {err}");
                return;
            },
        };
        let partition = self.effective_partition(partition);
        let now = self.clock.now();
        self.gate(PendingOperation::ApplyReportToGroups {
            origin,
            partition,
            groups,
            now,
        });
    }

    /// Spec §4.6 `set_document_reporting_endpoints`: requires non-empty
    /// source.
    pub fn set_document_reporting_endpoints(
        &mut self,
        source: ReportingSource,
        origin: &Url,
        isolation_info: IsolationInfo,
        partition: PartitionKey,
        endpoints: HashMap<String, Url>,
    ) {
        if self.shut_down || source.is_nil() {
            return;
        }
        let Ok(origin) = ReportUrl::sanitize(origin) else {
            return;
        };
        let partition = self.effective_partition(partition);
        let now = self.clock.now();
        self.gate(PendingOperation::SetDocumentReportingEndpoints {
            source,
            isolation_info,
            partition,
            origin,
            endpoints,
            now,
        });
    }

    /// Spec §4.6 `send_reports_and_remove_source`: flushes the source
    /// immediately and tombstones it, bypassing the normal delivery cadence.
    pub fn send_reports_and_remove_source(&mut self, source: ReportingSource) {
        if self.shut_down {
            return;
        }
        self.gate(PendingOperation::SendReportsAndRemoveSource { source });
    }

    pub fn remove_browsing_data(&mut self, mask: DataTypeMask, predicate: impl Fn(&ReportUrl) -> bool + Send + 'static) {
        if self.shut_down {
            return;
        }
        self.gate(PendingOperation::RemoveBrowsingData {
            mask,
            predicate: Box::new(predicate),
        });
    }

    pub fn remove_all_browsing_data(&mut self, mask: DataTypeMask) {
        if self.shut_down {
            return;
        }
        self.gate(PendingOperation::RemoveAllBrowsingData { mask });
    }

    /// Spec §4.6 `on_shutdown`: terminal; subsequent calls are no-ops.
    pub fn on_shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.backlog.clear();
    }

    pub fn status_as_value(&self) -> serde_json::Value {
        status::status_as_value(&self.cache, self.reporting_enabled)
    }

    // ---- gating wrapper (spec §4.6) ---------------------------------------

    fn gate(&mut self, op: PendingOperation) {
        if self.shut_down {
            return;
        }
        self.ensure_loading_started();
        if !self.initialized {
            self.backlog.push_back(op);
            return;
        }
        self.execute(op);
    }

    fn ensure_loading_started(&mut self) {
        if self.started_loading {
            return;
        }
        self.started_loading = true;
        let Some(store) = self.store.clone() else {
            return;
        };
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = store.load_clients().await;
            let _ = tx.send(ServiceEvent::StoreLoaded(result));
        });
    }

    fn execute(&mut self, op: PendingOperation) {
        match op {
            PendingOperation::QueueReport {
                source,
                partition,
                url,
                user_agent,
                group,
                type_,
                body,
                depth,
                queued_at,
            } => {
                self.cache.add_report(source, partition, url, user_agent, group, type_, body, depth, queued_at, 0);
            },
            PendingOperation::ApplyReportToGroups { origin, partition, groups, now } => {
                for group in groups {
                    header::apply_parsed_group(&mut self.cache, &origin, &partition, group, now);
                }
            },
            PendingOperation::SetDocumentReportingEndpoints {
                source,
                isolation_info,
                partition,
                origin,
                endpoints,
                now,
            } => {
                let _ = self
                    .cache
                    .set_document_endpoints(source, isolation_info, partition, origin, endpoints, now);
            },
            PendingOperation::SendReportsAndRemoveSource { source } => {
                self.execute_send_reports_and_remove_source(source);
            },
            PendingOperation::RemoveBrowsingData { mask, predicate } => {
                crate::browsing_data::remove_browsing_data(&mut self.cache, mask, |url| predicate(url));
            },
            PendingOperation::RemoveAllBrowsingData { mask } => {
                crate::browsing_data::remove_all_browsing_data(&mut self.cache, mask);
            },
        }
    }

    fn execute_send_reports_and_remove_source(&mut self, source: ReportingSource) {
        self.cache.set_expired_source(source);
        let now = self.clock.now();
        let keys: Vec<EndpointGroupKey> = self
            .cache
            .groups()
            .filter(|(key, _)| key.source() == Some(source))
            .map(|(key, _)| key.clone())
            .collect();
        let mut any_batch = false;
        for key in keys {
            if let Some(batch) = self.delivery.prepare_immediate(&mut self.cache, key, now) {
                any_batch = true;
                self.spawn_upload(batch, Some(source));
            }
        }
        if !any_batch {
            // Nothing was in flight for this source; nothing left to drain
            // later either, so tombstone it now (spec §3 invariant 6).
            self.cache.remove_reports_for_source(source);
            self.cache.remove_endpoints_for_source(source);
        }
    }

    // ---- delivery / event loop ---------------------------------------------

    /// Runs one Delivery Tick immediately, outside `run()`'s timer cadence —
    /// useful for embedders driving their own scheduler and for tests.
    pub fn force_delivery_tick(&mut self) {
        self.run_delivery_tick();
    }

    fn run_delivery_tick(&mut self) {
        let now = self.clock.now();
        let batches = self.delivery.prepare_tick(&mut self.cache, now);
        for batch in batches {
            self.spawn_upload(batch, None);
        }
    }

    fn spawn_upload(&self, batch: PreparedBatch, source_cleanup: Option<ReportingSource>) {
        let uploader = self.uploader.clone();
        let tx = self.event_tx.clone();
        let endpoint_url = batch.endpoint_url.clone();
        let partition = batch.partition.clone();
        let payload = batch.payload.clone();
        tokio::spawn(async move {
            let outcome = uploader.upload(endpoint_url, partition, payload).await;
            let _ = tx.send(ServiceEvent::UploadCompleted { batch, outcome, source_cleanup });
        });
    }

    async fn handle_event(&mut self, event: ServiceEvent) {
        // Pending uploads' completion callbacks are absorbed silently after
        // shutdown (spec §5 "Cancellation & timeouts").
        if self.shut_down {
            return;
        }
        match event {
            ServiceEvent::StoreLoaded(result) => {
                match result {
                    Ok(snapshot) => self.cache.install_snapshot(snapshot),
                    Err(err) => {
                        log::warn!("reporting: store load failed, starting from an empty cache: {err}");
                    },
                }
                self.initialized = true;
                while let Some(op) = self.backlog.pop_front() {
                    self.execute(op);
                }
            },
            ServiceEvent::UploadCompleted { batch, outcome, source_cleanup } => {
                let now = self.clock.now();
                if let Some(source) = source_cleanup {
                    self.delivery.conclude_immediate(&mut self.cache, &batch, outcome, now);
                    if !self.cache.reports().any(|r| r.source == Some(source)) {
                        self.cache.remove_endpoints_for_source(source);
                    }
                } else {
                    let max_attempts = self.cache.policy().max_report_attempts;
                    self.delivery.apply_outcome(&mut self.cache, &batch, outcome, now, max_attempts);
                }
                self.cache.flush().await;
            },
        }
    }

    /// Non-blocking drain of whatever Store-load/upload completions are
    /// already queued, for embedders (and tests) that pump the Service from
    /// their own event loop instead of handing it a task via [`Self::run`],
    /// the way `components/devtools/lib.rs`'s server loop drains its
    /// `receiver.try_recv()` without blocking on it.
    pub async fn pump(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event).await;
        }
    }

    /// Drives the Delivery Agent timer, the garbage-collection sweep, and
    /// the Store-load/upload completion inbox until `on_shutdown()` is
    /// called (spec §5 "Delivery Agent timer").
    pub async fn run(mut self) {
        let mut delivery_timer = tokio::time::interval(self.cache.policy().delivery_interval);
        let mut gc_timer = tokio::time::interval(self.cache.policy().garbage_collection_interval);
        loop {
            if self.shut_down {
                break;
            }
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                },
                _ = delivery_timer.tick() => self.run_delivery_tick(),
                _ = gc_timer.tick() => {
                    let now = self.clock.now();
                    self.cache.garbage_collect(now);
                    self.cache.flush().await;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{clock_tick, FakeClock, FakeDelegate, FakeStore, FakeUploader};
    use std::time::Duration;

    fn service_with(
        store: Option<FakeStore>,
        clock: Arc<FakeClock>,
        uploader: FakeUploader,
    ) -> Service<FakeStore, FakeUploader, FakeDelegate, FakeClock> {
        let mut policy = Policy::default();
        policy.delivery_interval = Duration::from_millis(10);
        policy.garbage_collection_interval = Duration::from_secs(3600);
        Service::new(
            policy,
            store.map(Arc::new),
            Arc::new(FakeDelegate::default()),
            Arc::new(uploader),
            clock,
        )
    }

    #[tokio::test]
    async fn queue_report_before_load_replays_from_backlog() {
        let clock = Arc::new(FakeClock::new(0));
        let mut service = service_with(
            Some(FakeStore::default()),
            clock.clone(),
            FakeUploader::always(UploadOutcome::Success),
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
        // Not yet initialized: report is backlogged, not visible.
        let snapshot = service.status_as_value();
        assert_eq!(snapshot["reports"].as_array().unwrap().len(), 0);

        // Drive the event loop until the store load completes and drains
        // the backlog.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(event) = service.event_rx.recv().await {
                    service.handle_event(event).await;
                }
                if service.initialized {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let snapshot = service.status_as_value();
        assert_eq!(snapshot["reports"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_discards_backlog() {
        let clock = Arc::new(FakeClock::new(0));
        let mut service = service_with(
            Some(FakeStore::default()),
            clock,
            FakeUploader::always(UploadOutcome::Success),
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
        service.on_shutdown();
        assert!(service.backlog.is_empty());
        service.queue_report(
            &Url::parse("https://a.test/y").unwrap(),
            None,
            PartitionKey::empty(),
            "ua".into(),
            "g".into(),
            "t".into(),
            serde_json::json!({}),
            0,
        );
        assert!(service.backlog.is_empty());
    }

    #[test]
    fn without_a_store_is_initialized_immediately() {
        let clock = Arc::new(FakeClock::new(0));
        let mut service: Service<FakeStore, FakeUploader, FakeDelegate, FakeClock> = Service::new(
            Policy::default(),
            None,
            Arc::new(FakeDelegate::default()),
            Arc::new(FakeUploader::always(UploadOutcome::Success)),
            clock,
        );
        assert!(service.initialized);
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
        assert_eq!(service.status_as_value()["reports"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn respect_partition_key_false_collapses_partitions() {
        let clock = Arc::new(FakeClock::new(clock_tick(0)));
        let mut service: Service<FakeStore, FakeUploader, FakeDelegate, FakeClock> = Service::new(
            Policy::default(),
            None,
            Arc::new(FakeDelegate::default()),
            Arc::new(FakeUploader::always(UploadOutcome::Success)),
            clock,
        );
        service.set_respect_partition_key(false);
        service.queue_report(
            &Url::parse("https://a.test/x").unwrap(),
            None,
            PartitionKey::new("pk1"),
            "ua".into(),
            "g".into(),
            "t".into(),
            serde_json::json!({}),
            0,
        );
        service.queue_report(
            &Url::parse("https://a.test/x").unwrap(),
            None,
            PartitionKey::new("pk2"),
            "ua".into(),
            "g".into(),
            "t".into(),
            serde_json::json!({}),
            0,
        );
        assert!(service.cache.reports().all(|r| r.partition == PartitionKey::empty()));
    }
}
