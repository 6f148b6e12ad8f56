/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! In-memory model of reports, endpoint groups, and endpoints: the
//! authoritative state of the reporting core (spec §4.2).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use url::Url;

use crate::arena::{IdArena, ReportId};
use crate::capability::Store;
use crate::model::{
    Endpoint, EndpointGroup, EndpointGroupKey, IsolationInfo, PartitionKey, Report,
    ReportStatus, ReportingSource, Tick,
};
use crate::origin::ReportUrl;
use crate::policy::Policy;

/// Bitmask selecting which parts of the cache a browsing-data removal
/// touches (spec §4.5, §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataTypeMask {
    pub reports: bool,
    pub clients: bool,
}

impl DataTypeMask {
    pub const REPORTS: DataTypeMask = DataTypeMask {
        reports: true,
        clients: false,
    };
    pub const CLIENTS: DataTypeMask = DataTypeMask {
        reports: false,
        clients: true,
    };
    pub const ALL: DataTypeMask = DataTypeMask {
        reports: true,
        clients: true,
    };
}

/// Edge-triggered observer callbacks (spec §4.2): called at most once per
/// mutating call that actually changed something, never polled.
pub trait CacheObserver: Send + Sync {
    fn on_reports_updated(&self) {}
    fn on_clients_updated(&self) {}
}

struct Observers(Vec<Arc<dyn CacheObserver>>);

impl Observers {
    fn notify_reports(&self) {
        for observer in &self.0 {
            observer.on_reports_updated();
        }
    }

    fn notify_clients(&self) {
        for observer in &self.0 {
            observer.on_clients_updated();
        }
    }
}

/// The authoritative in-memory state, owned exclusively by [`crate::Service`]
/// (spec §5 "Shared resources").
pub struct Cache<S: Store> {
    policy: Policy,
    arena: IdArena,
    reports: IndexMap<ReportId, Report>,
    groups: IndexMap<EndpointGroupKey, EndpointGroup>,
    expired_sources: HashSet<ReportingSource>,
    observers: Observers,
    store: Option<Arc<S>>,
    clients_dirty: bool,
}

impl<S: Store> Cache<S> {
    pub fn new(policy: Policy, store: Option<Arc<S>>) -> Self {
        Cache {
            policy,
            arena: IdArena::new(),
            reports: IndexMap::new(),
            groups: IndexMap::new(),
            expired_sources: HashSet::new(),
            observers: Observers(Vec::new()),
            store,
            clients_dirty: false,
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn CacheObserver>) {
        self.observers.0.push(observer);
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn report(&self, id: ReportId) -> Option<&Report> {
        self.reports.get(&id)
    }

    pub fn reports(&self) -> impl Iterator<Item = &Report> {
        self.reports.values()
    }

    pub fn report_count(&self) -> usize {
        self.reports.len()
    }

    pub fn groups(&self) -> impl Iterator<Item = (&EndpointGroupKey, &EndpointGroup)> {
        self.groups.iter()
    }

    pub fn group(&self, key: &EndpointGroupKey) -> Option<&EndpointGroup> {
        self.groups.get(key)
    }

    // ---- reports -------------------------------------------------------

    /// Appends a report (spec §4.2 `add_report`). Evicts the oldest
    /// non-`PENDING` report if the global cap is exceeded; if every report
    /// is `PENDING`, dooms the oldest instead of evicting it (spec §3
    /// "Report" lifecycle, §7 "cache full": "never reject ingress").
    #[allow(clippy::too_many_arguments)]
    pub fn add_report(
        &mut self,
        source: Option<ReportingSource>,
        partition: PartitionKey,
        url: ReportUrl,
        user_agent: String,
        group: String,
        type_: String,
        body: serde_json::Value,
        depth: u32,
        queued_at: Tick,
        attempts: u32,
    ) -> ReportId {
        let id = self.arena.next_report_id();
        let report = Report {
            id,
            source,
            partition,
            url,
            user_agent,
            group,
            type_,
            body,
            depth,
            queued_at,
            attempts,
            status: ReportStatus::Queued,
        };
        self.reports.insert(id, report);
        self.enforce_report_cap();
        self.observers.notify_reports();
        id
    }

    fn enforce_report_cap(&mut self) {
        if self.reports.len() <= self.policy.max_report_count {
            return;
        }
        let victim = self
            .reports
            .values()
            .find(|r| r.status != ReportStatus::Pending)
            .map(|r| r.id);
        match victim {
            Some(id) => {
                self.reports.shift_remove(&id);
            },
            None => {
                // Every report is in flight; doom the oldest instead of
                // evicting it out from under the Delivery Agent.
                if let Some((_, report)) = self.reports.first_mut() {
                    report.status = ReportStatus::Doomed;
                }
            },
        }
    }

    /// Batches `QUEUED` reports by endpoint-group key, in insertion order of
    /// the oldest report in each batch (spec §4.2 `get_reports_to_deliver`).
    /// Reports belonging to an expired source are excluded: their one
    /// guaranteed delivery happens through
    /// [`crate::service::Service::send_reports_and_remove_source`] instead
    /// of the regular tick (see `DESIGN.md`'s Open Question decision).
    pub fn reports_to_deliver(&self, now: Tick) -> Vec<(EndpointGroupKey, Vec<ReportId>)> {
        let mut batches: IndexMap<EndpointGroupKey, Vec<ReportId>> = IndexMap::new();
        for report in self.reports.values() {
            if report.status != ReportStatus::Queued {
                continue;
            }
            if let Some(source) = report.source {
                if self.expired_sources.contains(&source) {
                    continue;
                }
            }
            if let Some(key) = self.resolve_group_key(report, now) {
                batches.entry(key).or_default().push(report.id);
            }
        }
        batches.into_iter().collect()
    }

    /// Reports deliverable through one specific group key, ignoring the
    /// expired-source exclusion `reports_to_deliver` applies: used by
    /// [`crate::service::Service::send_reports_and_remove_source`]'s bypass
    /// path, which targets exactly the source being tombstoned (spec §3
    /// invariant 6, §4.6).
    pub fn reports_to_deliver_for_key(&self, key: &EndpointGroupKey, now: Tick) -> Vec<ReportId> {
        self.reports
            .values()
            .filter(|r| r.status == ReportStatus::Queued)
            .filter(|r| self.resolve_group_key(r, now).as_ref() == Some(key))
            .map(|r| r.id)
            .collect()
    }

    /// Resolves the endpoint-group key a report should deliver through: a
    /// source-keyed group takes precedence when the report carries a
    /// source (spec §3 invariant 2), otherwise origin/partition matching
    /// with ancestor-domain fallback (spec §4.2 "Tie-breaks & orderings").
    /// A group whose expiry has passed is invisible here even though GC
    /// has not yet swept it away (spec §3 invariant 4).
    fn resolve_group_key(&self, report: &Report, now: Tick) -> Option<EndpointGroupKey> {
        if let Some(source) = report.source {
            let key = EndpointGroupKey::Source {
                source,
                group: report.group.clone(),
            };
            match self.groups.get(&key) {
                Some(group) if !group.is_expired(now) => return Some(key),
                _ => return None,
            }
        }
        self.match_origin_group(&report.url, &report.partition, &report.group, now)
    }

    /// Exact (origin, partition, group) match first; else walks ancestor
    /// domains one label at a time looking for an `include_subdomains`
    /// group, closest match wins (spec §4.2). Without a public-suffix list
    /// in this workspace's dependency set, the walk stops once only two
    /// labels remain, treating the last two labels as the registrable
    /// domain floor — a documented simplification (see `DESIGN.md`). An
    /// expired group is skipped at every step (spec §3 invariant 4).
    fn match_origin_group(
        &self,
        url: &ReportUrl,
        partition: &PartitionKey,
        group: &str,
        now: Tick,
    ) -> Option<EndpointGroupKey> {
        let exact = EndpointGroupKey::Origin {
            origin: url.clone(),
            partition: partition.clone(),
            group: group.to_owned(),
        };
        if let Some(candidate) = self.groups.get(&exact) {
            if !candidate.is_expired(now) {
                return Some(exact);
            }
        }
        let host = url.host_str()?;
        let labels: Vec<&str> = host.split('.').collect();
        for start in 1..labels.len().saturating_sub(1) {
            let ancestor_host = labels[start..].join(".");
            let mut ancestor_url = url.as_url().clone();
            if ancestor_url.set_host(Some(&ancestor_host)).is_err() {
                continue;
            }
            let ancestor = ReportUrl::sanitize(&ancestor_url).ok()?;
            let key = EndpointGroupKey::Origin {
                origin: ancestor,
                partition: partition.clone(),
                group: group.to_owned(),
            };
            if let Some(candidate) = self.groups.get(&key) {
                if candidate.include_subdomains && !candidate.is_expired(now) {
                    return Some(key);
                }
            }
        }
        None
    }

    pub fn mark_pending(&mut self, batch: &[ReportId]) {
        for id in batch {
            if let Some(report) = self.reports.get_mut(id) {
                report.status = ReportStatus::Pending;
            }
        }
        self.observers.notify_reports();
    }

    pub fn increment_attempts(&mut self, batch: &[ReportId]) {
        for id in batch {
            if let Some(report) = self.reports.get_mut(id) {
                report.attempts += 1;
            }
        }
    }

    /// Returns reports to `QUEUED`, preserving attempts (spec §4.4 step 5
    /// `FAILURE`/`REMOVE_ENDPOINT` branches).
    pub fn requeue(&mut self, batch: &[ReportId]) {
        for id in batch {
            if let Some(report) = self.reports.get_mut(id) {
                report.status = ReportStatus::Queued;
            }
        }
        self.observers.notify_reports();
    }

    pub fn remove(&mut self, batch: &[ReportId]) {
        let mut changed = false;
        for id in batch {
            if self.reports.shift_remove(id).is_some() {
                changed = true;
            }
        }
        if changed {
            self.observers.notify_reports();
        }
    }

    // ---- endpoint groups ------------------------------------------------

    /// Upserts an origin-scoped endpoint group, replacing its endpoints
    /// atomically, evicting LRU groups if the per-origin cap is exceeded
    /// (spec §4.2 `set_endpoints_for_origin`).
    #[allow(clippy::too_many_arguments)]
    pub fn set_endpoints_for_origin(
        &mut self,
        origin: ReportUrl,
        partition: PartitionKey,
        group_name: String,
        include_subdomains: bool,
        expiry: Tick,
        mut endpoints: Vec<Endpoint>,
        now: Tick,
    ) {
        endpoints.truncate(self.policy.max_endpoints_per_origin);
        let key = EndpointGroupKey::Origin {
            origin: origin.clone(),
            partition: partition.clone(),
            group: group_name,
        };
        if !self.groups.contains_key(&key) {
            self.evict_if_over_cap(&origin, &partition);
        }
        self.groups.insert(
            key,
            EndpointGroup {
                include_subdomains,
                expiry,
                last_used: now,
                endpoints,
                document_isolation_info: None,
                document_origin: None,
            },
        );
        self.enforce_global_endpoint_cap();
        self.clients_dirty = true;
        self.observers.notify_clients();
    }

    /// Evicts whole groups, least-important first, until the total endpoint
    /// count across every group is back under `policy.max_endpoint_count`
    /// (spec §4.1 `MaxEndpointCount`). Mirrors `evict_if_over_cap`'s
    /// priority-then-LRU tiebreak, just applied crate-wide rather than
    /// per-origin.
    fn enforce_global_endpoint_cap(&mut self) {
        let mut total: usize = self.groups.values().map(|g| g.endpoints.len()).sum();
        while total > self.policy.max_endpoint_count {
            let victim = self
                .groups
                .iter()
                .max_by(|(_, a), (_, b)| {
                    let a_rank = a.endpoints.iter().map(|e| e.priority).max().unwrap_or(u32::MAX);
                    let b_rank = b.endpoints.iter().map(|e| e.priority).max().unwrap_or(u32::MAX);
                    a_rank
                        .cmp(&b_rank)
                        .then(a.last_used.cmp(&b.last_used).reverse())
                })
                .map(|(k, g)| (k.clone(), g.endpoints.len()));
            let Some((victim_key, victim_len)) = victim else {
                break;
            };
            self.groups.shift_remove(&victim_key);
            total -= victim_len;
        }
    }

    fn evict_if_over_cap(&mut self, origin: &ReportUrl, partition: &PartitionKey) {
        let matches_origin = |key: &EndpointGroupKey| {
            matches!(
                key,
                EndpointGroupKey::Origin { origin: o, partition: p, .. }
                    if o == origin && p == partition
            )
        };
        let count = self.groups.keys().filter(|k| matches_origin(k)).count();
        if count < self.policy.max_endpoints_per_origin {
            return;
        }
        // Evict the least-important group for this origin: lowest-priority
        // (highest numeric endpoint priority) first, least-recently-used to
        // break ties (spec §4.2 "Tie-breaks & orderings").
        let victim = self
            .groups
            .iter()
            .filter(|(k, _)| matches_origin(k))
            .max_by(|(_, a), (_, b)| {
                let a_rank = a.endpoints.iter().map(|e| e.priority).max().unwrap_or(u32::MAX);
                let b_rank = b.endpoints.iter().map(|e| e.priority).max().unwrap_or(u32::MAX);
                a_rank
                    .cmp(&b_rank)
                    .then(a.last_used.cmp(&b.last_used).reverse())
            })
            .map(|(k, _)| k.clone());
        if let Some(victim) = victim {
            self.groups.shift_remove(&victim);
        }
    }

    /// Deletes the named origin-scoped group (Report-To `max_age=0`, spec
    /// §4.3/§6). A no-op if the group does not exist (spec §8 boundary 6).
    pub fn delete_endpoints_for_origin(
        &mut self,
        origin: &ReportUrl,
        partition: &PartitionKey,
        group_name: &str,
    ) {
        let key = EndpointGroupKey::Origin {
            origin: origin.clone(),
            partition: partition.clone(),
            group: group_name.to_owned(),
        };
        if self.groups.shift_remove(&key).is_some() {
            self.clients_dirty = true;
            self.observers.notify_clients();
        }
    }

    /// Upserts the V1 document-endpoints mapping, one single-endpoint group
    /// per name, keyed by (source, name) (spec §4.2
    /// `set_document_endpoints`). Rejects an empty (nil) source.
    pub fn set_document_endpoints(
        &mut self,
        source: ReportingSource,
        isolation_info: IsolationInfo,
        _partition: PartitionKey,
        origin: ReportUrl,
        endpoints: std::collections::HashMap<String, Url>,
        now: Tick,
    ) -> Result<(), ()> {
        if endpoints.is_empty() {
            return Ok(());
        }
        for (name, url) in endpoints {
            let key = EndpointGroupKey::Source {
                source,
                group: name,
            };
            self.groups.insert(
                key,
                EndpointGroup {
                    include_subdomains: false,
                    expiry: Tick::MAX,
                    last_used: now,
                    endpoints: vec![Endpoint::new(url, 0, 1)],
                    document_isolation_info: Some(isolation_info.clone()),
                    document_origin: Some(origin.clone()),
                },
            );
        }
        self.enforce_global_endpoint_cap();
        self.clients_dirty = true;
        self.observers.notify_clients();
        Ok(())
    }

    /// Marks a V1 source for tombstoning once its remaining reports drain
    /// (spec §4.2 `set_expired_source`, §3 invariant 6).
    pub fn set_expired_source(&mut self, source: ReportingSource) {
        self.expired_sources.insert(source);
    }

    pub fn is_source_expired(&self, source: ReportingSource) -> bool {
        self.expired_sources.contains(&source)
    }

    pub fn remove_reports_for_source(&mut self, source: ReportingSource) {
        let before = self.reports.len();
        self.reports.retain(|_, r| r.source != Some(source));
        if self.reports.len() != before {
            self.observers.notify_reports();
        }
    }

    pub fn remove_endpoints_for_source(&mut self, source: ReportingSource) {
        let before = self.groups.len();
        self.groups.retain(|k, _| k.source() != Some(source));
        self.expired_sources.remove(&source);
        if self.groups.len() != before {
            self.clients_dirty = true;
            self.observers.notify_clients();
        }
    }

    pub fn report_attempts(&self, id: ReportId) -> Option<u32> {
        self.reports.get(&id).map(|r| r.attempts)
    }

    /// Marks (or clears) the pending-upload flag on one endpoint (spec §3
    /// "Endpoint"); correctness of the at-most-one-in-flight invariant is
    /// enforced by [`crate::delivery::DeliveryAgent`]'s own bookkeeping,
    /// this flag exists for observability in the status snapshot.
    pub fn set_endpoint_pending(&mut self, key: &EndpointGroupKey, url: &Url, pending: bool) {
        if let Some(group) = self.groups.get_mut(key) {
            if let Some(endpoint) = group.endpoints.iter_mut().find(|e| &e.url == url) {
                endpoint.pending_upload = pending;
            }
        }
    }

    /// Records a successful upload against one endpoint (spec §4.4 step 5
    /// `SUCCESS`: "update endpoint stats").
    pub fn record_endpoint_success(&mut self, key: &EndpointGroupKey, url: &Url, now: Tick) {
        if let Some(group) = self.groups.get_mut(key) {
            group.last_used = now;
            if let Some(endpoint) = group.endpoints.iter_mut().find(|e| &e.url == url) {
                endpoint.stats.successful_uploads += 1;
                endpoint.stats.last_used = Some(now);
                endpoint.pending_upload = false;
            }
        }
    }

    pub fn record_endpoint_failure(&mut self, key: &EndpointGroupKey, url: &Url, now: Tick) {
        if let Some(group) = self.groups.get_mut(key) {
            if let Some(endpoint) = group.endpoints.iter_mut().find(|e| &e.url == url) {
                endpoint.stats.failed_uploads += 1;
                endpoint.stats.last_used = Some(now);
                endpoint.pending_upload = false;
            }
        }
    }

    /// Removes one endpoint from its group (spec §4.4 `REMOVE_ENDPOINT`,
    /// §7 "410 Gone").
    pub fn remove_endpoint(&mut self, key: &EndpointGroupKey, url: &Url) {
        if let Some(group) = self.groups.get_mut(key) {
            group.endpoints.retain(|e| &e.url != url);
            self.clients_dirty = true;
        }
        self.observers.notify_clients();
    }

    // ---- browsing data ---------------------------------------------------

    /// Removes reports and/or endpoint groups matching `origin_predicate`,
    /// per the `mask` bits (spec §4.5).
    pub fn remove_browsing_data(
        &mut self,
        mask: DataTypeMask,
        origin_predicate: impl Fn(&ReportUrl) -> bool,
    ) {
        if mask.reports {
            let before = self.reports.len();
            self.reports.retain(|_, r| !origin_predicate(&r.url));
            if self.reports.len() != before {
                self.observers.notify_reports();
            }
        }
        if mask.clients {
            let before = self.groups.len();
            self.groups.retain(|k, _| match k.origin() {
                Some(origin) => !origin_predicate(origin),
                None => true,
            });
            if self.groups.len() != before {
                self.clients_dirty = true;
                self.observers.notify_clients();
            }
        }
    }

    pub fn remove_all_browsing_data(&mut self, mask: DataTypeMask) {
        self.remove_browsing_data(mask, |_| true);
    }

    // ---- garbage collection ----------------------------------------------

    /// Expires stale endpoint groups and ages out old reports (spec §3
    /// invariant 4; behavior specified in `SPEC_FULL.md` §2 item 1, since
    /// spec.md names the GC interval but not the sweep's rule).
    pub fn garbage_collect(&mut self, now: Tick) {
        let staleness = self.policy.max_group_staleness.as_millis() as u64;
        let before_groups = self.groups.len();
        self.groups.retain(|_, group| {
            if group.is_expired(now) {
                return false;
            }
            now.saturating_sub(group.last_used) <= staleness
        });
        if self.groups.len() != before_groups {
            self.clients_dirty = true;
            self.observers.notify_clients();
        }

        let max_age = self.policy.max_report_age.as_millis() as u64;
        let before_reports = self.reports.len();
        let victims: Vec<ReportId> = self
            .reports
            .values()
            .filter(|r| r.status != ReportStatus::Pending && now.saturating_sub(r.queued_at) > max_age)
            .map(|r| r.id)
            .collect();
        for id in victims {
            self.reports.shift_remove(&id);
        }
        if self.reports.len() != before_reports {
            self.observers.notify_reports();
        }
    }

    // ---- persistence ------------------------------------------------------

    /// Installs a snapshot loaded from the Store in a single atomic step
    /// (spec §4.6: "installs the loaded endpoints/groups into the Cache in
    /// a single atomic step").
    pub fn install_snapshot(&mut self, snapshot: crate::capability::ClientSnapshot) {
        self.groups = snapshot.into_iter().collect();
        self.clients_dirty = false;
        self.observers.notify_clients();
    }

    /// Writes dirty clients to the Store if one is configured (spec §4.2
    /// `flush`).
    pub async fn flush(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if !self.clients_dirty {
            return;
        }
        let snapshot: crate::capability::ClientSnapshot =
            self.groups.iter().map(|(k, g)| (k.clone(), g.clone())).collect();
        match store.flush(snapshot).await {
            Ok(()) => self.clients_dirty = false,
            Err(err) => {
                log::warn!("reporting: store flush failed, will retry on next dirty flush: {err}");
            },
        }
    }
}
