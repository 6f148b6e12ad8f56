/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Selects eligible reports, batches them, drives the Uploader, and applies
//! retry/backoff (spec §4.4). Holds no reference to a live upload: a tick
//! only ever prepares [`PreparedBatch`]es; the caller (`Service`) actually
//! invokes the `Uploader` and later reports the outcome back through
//! [`DeliveryAgent::apply_outcome`], keeping this type's logic off the
//! async boundary the way `components/background_hang_monitor`'s worker
//! keeps its per-component timeout bookkeeping off the channel recv call.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use url::Url;

use crate::arena::ReportId;
use crate::cache::Cache;
use crate::capability::{Store, UploadOutcome};
use crate::model::{EndpointGroupKey, PartitionKey, Tick};

const INITIAL_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 15 * 60 * 1000;

#[derive(Clone, Copy, Debug, Default)]
struct BackoffState {
    consecutive_failures: u32,
    next_eligible: Tick,
}

impl BackoffState {
    fn record_failure(&mut self, now: Tick) {
        self.consecutive_failures += 1;
        let delay = INITIAL_BACKOFF_MS
            .saturating_mul(1u64 << self.consecutive_failures.saturating_sub(1).min(20))
            .min(MAX_BACKOFF_MS);
        self.next_eligible = now.saturating_add(delay);
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.next_eligible = 0;
    }
}

/// One batch ready to hand to the Uploader (spec §4.4 steps 2–5: endpoint
/// already selected, reports already transitioned to `PENDING` with
/// incremented attempts).
#[derive(Clone, Debug)]
pub struct PreparedBatch {
    pub key: EndpointGroupKey,
    pub report_ids: Vec<ReportId>,
    pub endpoint_url: Url,
    pub partition: PartitionKey,
    pub payload: Vec<u8>,
}

#[derive(Serialize)]
struct ReportPayloadItem<'a> {
    age: u64,
    #[serde(rename = "type")]
    type_: &'a str,
    url: &'a str,
    user_agent: &'a str,
    body: &'a serde_json::Value,
}

/// Per-endpoint-group-and-endpoint retry state, driven by the periodic
/// Delivery Tick (spec §4.4, Glossary "Delivery tick").
#[derive(Default)]
pub struct DeliveryAgent {
    in_flight: HashSet<EndpointGroupKey>,
    backoff: HashMap<(EndpointGroupKey, Url), BackoffState>,
}

impl DeliveryAgent {
    pub fn new() -> Self {
        DeliveryAgent::default()
    }

    pub fn is_in_flight(&self, key: &EndpointGroupKey) -> bool {
        self.in_flight.contains(key)
    }

    /// Runs one Delivery Tick: asks the Cache for deliverable reports,
    /// selects an endpoint per eligible group, and transitions those
    /// reports to `PENDING` (spec §4.4 steps 1–4).
    pub fn prepare_tick<S: Store>(&mut self, cache: &mut Cache<S>, now: Tick) -> Vec<PreparedBatch> {
        let batches = cache.reports_to_deliver(now);
        let mut prepared = Vec::new();
        for (key, report_ids) in batches {
            if let Some(batch) = self.prepare_batch(cache, key, report_ids, now) {
                prepared.push(batch);
            }
        }
        prepared
    }

    /// Prepares a single batch outside the regular tick cadence, for a
    /// source being tombstoned (spec §4.6 `send_reports_and_remove_source`,
    /// §3 invariant 6). Bypasses `reports_to_deliver`'s expired-source
    /// exclusion since the caller already knows which source it targets.
    pub fn prepare_immediate<S: Store>(
        &mut self,
        cache: &mut Cache<S>,
        key: EndpointGroupKey,
        now: Tick,
    ) -> Option<PreparedBatch> {
        let report_ids = cache.reports_to_deliver_for_key(&key, now);
        if report_ids.is_empty() {
            return None;
        }
        self.prepare_batch(cache, key, report_ids, now)
    }

    fn prepare_batch<S: Store>(
        &mut self,
        cache: &mut Cache<S>,
        key: EndpointGroupKey,
        report_ids: Vec<ReportId>,
        now: Tick,
    ) -> Option<PreparedBatch> {
        if self.in_flight.contains(&key) {
            return None;
        }
        let group = cache.group(&key)?;
        if group.is_expired(now) || group.endpoints.is_empty() {
            return None;
        }
        let endpoint_url = self.select_endpoint(&key, group, now)?;

        let partition = cache
            .report(report_ids[0])
            .map(|r| r.partition.clone())
            .unwrap_or_default();
        let payload = self.build_payload(cache, &report_ids, now);

        cache.mark_pending(&report_ids);
        cache.increment_attempts(&report_ids);
        cache.set_endpoint_pending(&key, &endpoint_url, true);
        self.in_flight.insert(key.clone());

        Some(PreparedBatch {
            key,
            report_ids,
            endpoint_url,
            partition,
            payload,
        })
    }

    /// Weighted-random selection within the lowest-priority-number band
    /// present in the group, skipping endpoints still in their backoff
    /// window (spec §4.4 step 2).
    fn select_endpoint(
        &self,
        key: &EndpointGroupKey,
        group: &crate::model::EndpointGroup,
        now: Tick,
    ) -> Option<Url> {
        let eligible: Vec<&crate::model::Endpoint> = group
            .endpoints
            .iter()
            .filter(|e| {
                self.backoff
                    .get(&(key.clone(), e.url.clone()))
                    .map(|b| b.next_eligible <= now)
                    .unwrap_or(true)
            })
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let min_priority = eligible.iter().map(|e| e.priority).min()?;
        let band: Vec<&crate::model::Endpoint> =
            eligible.into_iter().filter(|e| e.priority == min_priority).collect();
        let total_weight: u64 = band.iter().map(|e| e.weight as u64).sum();
        if total_weight == 0 {
            return band.first().map(|e| e.url.clone());
        }
        let mut pick = rand::rng().random_range(0..total_weight);
        for endpoint in &band {
            let weight = endpoint.weight as u64;
            if pick < weight {
                return Some(endpoint.url.clone());
            }
            pick -= weight;
        }
        band.last().map(|e| e.url.clone())
    }

    fn build_payload<S: Store>(&self, cache: &Cache<S>, report_ids: &[ReportId], now: Tick) -> Vec<u8> {
        let items: Vec<ReportPayloadItem> = report_ids
            .iter()
            .filter_map(|id| cache.report(*id))
            .map(|r| ReportPayloadItem {
                age: now.saturating_sub(r.queued_at),
                type_: &r.type_,
                url: r.url.as_str(),
                user_agent: &r.user_agent,
                body: &r.body,
            })
            .collect();
        serde_json::to_vec(&items).unwrap_or_default()
    }

    /// Applies an upload's outcome (spec §4.4 step 5).
    pub fn apply_outcome<S: Store>(
        &mut self,
        cache: &mut Cache<S>,
        batch: &PreparedBatch,
        outcome: UploadOutcome,
        now: Tick,
        max_attempts: u32,
    ) {
        self.in_flight.remove(&batch.key);
        cache.set_endpoint_pending(&batch.key, &batch.endpoint_url, false);

        match outcome {
            UploadOutcome::Success => {
                cache.record_endpoint_success(&batch.key, &batch.endpoint_url, now);
                self.backoff
                    .entry((batch.key.clone(), batch.endpoint_url.clone()))
                    .or_default()
                    .record_success();
                cache.remove(&batch.report_ids);
            },
            UploadOutcome::RemoveEndpoint => {
                cache.record_endpoint_failure(&batch.key, &batch.endpoint_url, now);
                cache.remove_endpoint(&batch.key, &batch.endpoint_url);
                self.backoff.remove(&(batch.key.clone(), batch.endpoint_url.clone()));
                cache.requeue(&batch.report_ids);
            },
            UploadOutcome::Failure => {
                cache.record_endpoint_failure(&batch.key, &batch.endpoint_url, now);
                let (give_up, retry): (Vec<ReportId>, Vec<ReportId>) = batch
                    .report_ids
                    .iter()
                    .copied()
                    .partition(|id| cache.report_attempts(*id).unwrap_or(0) >= max_attempts);
                if !give_up.is_empty() {
                    cache.remove(&give_up);
                }
                if !retry.is_empty() {
                    cache.requeue(&retry);
                    self.backoff
                        .entry((batch.key.clone(), batch.endpoint_url.clone()))
                        .or_default()
                        .record_failure(now);
                }
            },
        }
    }

    /// Concludes a [`prepare_immediate`](Self::prepare_immediate) batch: the
    /// reports are discarded regardless of outcome, since their source is
    /// already tombstoned and gets no further retries (spec §3 invariant 6:
    /// "delivered once then discarded").
    pub fn conclude_immediate<S: Store>(
        &mut self,
        cache: &mut Cache<S>,
        batch: &PreparedBatch,
        outcome: UploadOutcome,
        now: Tick,
    ) {
        self.in_flight.remove(&batch.key);
        cache.set_endpoint_pending(&batch.key, &batch.endpoint_url, false);
        match outcome {
            UploadOutcome::Success => {
                cache.record_endpoint_success(&batch.key, &batch.endpoint_url, now);
            },
            UploadOutcome::RemoveEndpoint => {
                cache.record_endpoint_failure(&batch.key, &batch.endpoint_url, now);
                cache.remove_endpoint(&batch.key, &batch.endpoint_url);
            },
            UploadOutcome::Failure => {
                cache.record_endpoint_failure(&batch.key, &batch.endpoint_url, now);
            },
        }
        cache.remove(&batch.report_ids);
    }

    /// The remaining tick interval this should be driven at, for embedders
    /// that wire up their own timer instead of [`crate::service::Service::run`].
    pub fn tick_interval(delivery_interval: Duration) -> Duration {
        delivery_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, PartitionKey};
    use crate::policy::Policy;
    use crate::test_support::{clock_tick, noop_store, report_url};
    use std::sync::Arc;

    fn cache_with_group(priorities_weights: &[(u32, u32)]) -> (Cache<crate::test_support::FakeStore>, EndpointGroupKey) {
        let mut cache = Cache::new(Policy::default(), Some(Arc::new(noop_store())));
        let origin = report_url("https://a.test");
        let endpoints: Vec<Endpoint> = priorities_weights
            .iter()
            .enumerate()
            .map(|(i, (p, w))| {
                Endpoint::new(
                    Url::parse(&format!("https://r.test/e{i}")).unwrap(),
                    *p,
                    *w,
                )
            })
            .collect();
        cache.set_endpoints_for_origin(
            origin.clone(),
            PartitionKey::empty(),
            "g".into(),
            false,
            clock_tick(1_000_000),
            endpoints,
            clock_tick(0),
        );
        cache.add_report(
            None,
            PartitionKey::empty(),
            origin.clone(),
            "ua".into(),
            "g".into(),
            "t".into(),
            serde_json::json!({}),
            0,
            clock_tick(0),
            0,
        );
        let key = EndpointGroupKey::Origin {
            origin,
            partition: PartitionKey::empty(),
            group: "g".into(),
        };
        (cache, key)
    }

    #[test]
    fn selects_from_lowest_priority_number_band() {
        let (mut cache, _) = cache_with_group(&[(2, 1), (1, 1), (2, 1)]);
        let mut agent = DeliveryAgent::new();
        let batches = agent.prepare_tick(&mut cache, clock_tick(0));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].endpoint_url.as_str(), "https://r.test/e1");
    }

    #[test]
    fn at_most_one_in_flight_per_group() {
        let (mut cache, _) = cache_with_group(&[(1, 1)]);
        let mut agent = DeliveryAgent::new();
        let first = agent.prepare_tick(&mut cache, clock_tick(0));
        assert_eq!(first.len(), 1);
        let second = agent.prepare_tick(&mut cache, clock_tick(0));
        assert!(second.is_empty());
    }

    #[test]
    fn failure_backs_off_then_gives_up_at_max_attempts() {
        let (mut cache, _) = cache_with_group(&[(1, 1)]);
        let mut agent = DeliveryAgent::new();
        let max_attempts = 2;
        for attempt in 0..max_attempts {
            let batches = agent.prepare_tick(&mut cache, clock_tick(0));
            assert_eq!(batches.len(), 1, "attempt {attempt}");
            agent.apply_outcome(&mut cache, &batches[0], UploadOutcome::Failure, clock_tick(0), max_attempts);
        }
        assert_eq!(cache.report_count(), 0);
    }

    #[test]
    fn remove_endpoint_requeues_and_deletes_endpoint() {
        let (mut cache, key) = cache_with_group(&[(1, 1)]);
        let mut agent = DeliveryAgent::new();
        let batches = agent.prepare_tick(&mut cache, clock_tick(0));
        agent.apply_outcome(&mut cache, &batches[0], UploadOutcome::RemoveEndpoint, clock_tick(0), 5);
        assert_eq!(cache.group(&key).unwrap().endpoints.len(), 0);
        assert_eq!(cache.report_attempts(batches[0].report_ids[0]), Some(1));
    }
}
