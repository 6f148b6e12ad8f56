/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Immutable tunable limits for the reporting core (spec §4.1).

use std::time::Duration;

/// Construction-time configuration for a [`crate::Service`].
///
/// Unlike `components/config`'s dynamically-reloadable preference store,
/// `Policy` is a plain value: the reporting core never watches it for
/// changes mid-flight, it is handed to [`crate::Service::new`] once.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Policy {
    /// Global cap on the number of reports held at once (spec §3 invariant 3).
    pub max_report_count: usize,
    /// Reports older than this are garbage-collected.
    pub max_report_age: Duration,
    /// Upload attempts after which a report is given up on.
    pub max_report_attempts: u32,
    /// Cap on endpoint groups per origin and endpoints per group (spec §3
    /// invariant 3; both share one field per spec.md's Policy table).
    pub max_endpoints_per_origin: usize,
    /// Global cap on the total number of endpoints across all groups.
    pub max_endpoint_count: usize,
    /// A group idle for longer than this is eligible for garbage collection.
    pub max_group_staleness: Duration,
    /// Period of the Delivery Agent's tick.
    pub delivery_interval: Duration,
    /// Period of the garbage-collection sweep.
    pub garbage_collection_interval: Duration,
    /// Whether queued reports survive process restart.
    pub persist_reports_across_restarts: bool,
    /// Whether endpoint configuration survives a network change.
    pub persist_clients_across_network_changes: bool,
    /// Initial value for the Service's partition-key-respecting flag; see
    /// spec §9 "Global state" and §4.6 "Partition-key policy".
    pub respect_partition_key: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            max_report_count: 5_000,
            max_report_age: Duration::from_secs(5 * 60),
            max_report_attempts: 5,
            max_endpoints_per_origin: 10,
            max_endpoint_count: 1_000,
            max_group_staleness: Duration::from_secs(14 * 24 * 60 * 60),
            delivery_interval: Duration::from_secs(60),
            garbage_collection_interval: Duration::from_secs(60 * 60),
            persist_reports_across_restarts: false,
            persist_clients_across_network_changes: true,
            respect_partition_key: true,
        }
    }
}
