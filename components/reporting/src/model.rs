/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The three-level data model: reports, endpoint groups, endpoints (spec
//! §3), plus the opaque tags (partition key, reporting source) that scope
//! them.

use std::fmt;

use serde::Serialize;
use url::Url;

use crate::arena::ReportId;
use crate::origin::ReportUrl;

/// A monotonic tick, as produced by [`crate::capability::Clock`]. Opaque
/// arithmetic unit; the crate never assumes it maps to wall-clock time
/// except where §3/§4 explicitly compare it against a `Duration` from
/// [`crate::policy::Policy`].
pub type Tick = u64;

/// Opaque, equality-comparable tag scoping a cache to a network-isolation
/// boundary (Glossary: "Partition key").
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(value: impl Into<String>) -> Self {
        PartitionKey(value.into())
    }

    /// The collapsed partition key substituted for every call when
    /// `respect_partition_key` is disabled (spec §4.6).
    pub fn empty() -> Self {
        PartitionKey(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque 128-bit identifier for a document that configured endpoints via
/// the V1 `Reporting-Endpoints` header (Glossary: "Reporting source").
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ReportingSource(uuid::Uuid);

impl ReportingSource {
    pub fn new(id: uuid::Uuid) -> Self {
        ReportingSource(id)
    }

    pub fn generate() -> Self {
        ReportingSource(uuid::Uuid::new_v4())
    }

    /// True for the nil UUID, rejected by `set_document_reporting_endpoints`
    /// (spec §4.6: "requires non-empty source").
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for ReportingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque isolation-info carried alongside a V1 document-endpoints
/// registration. The connect-job/partition machinery that produces it is
/// out of scope (spec §1); this crate stores it unchanged on the
/// resulting [`EndpointGroup`] and never inspects it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IsolationInfo(pub String);

/// A report's place in its delivery lifecycle (spec §3 "Report").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportStatus {
    /// Eligible for the next delivery batch.
    Queued,
    /// Included in an in-flight upload.
    Pending,
    /// Flagged for deletion but retained because it is currently in-flight
    /// (Glossary: "Doomed").
    Doomed,
    /// Delivered; retained only transiently before removal.
    Success,
}

/// An ingress record (spec §3 "Report").
#[derive(Clone, Debug)]
pub struct Report {
    pub id: ReportId,
    pub source: Option<ReportingSource>,
    pub partition: PartitionKey,
    pub url: ReportUrl,
    pub user_agent: String,
    pub group: String,
    pub type_: String,
    pub body: serde_json::Value,
    pub depth: u32,
    pub queued_at: Tick,
    pub attempts: u32,
    pub status: ReportStatus,
}

/// Identifies one endpoint group: either an (origin, partition, group name)
/// triple or a (reporting-source, group name) pair. Spec §3: "these two
/// flavors never collide".
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum EndpointGroupKey {
    Origin {
        origin: ReportUrl,
        partition: PartitionKey,
        group: String,
    },
    Source {
        source: ReportingSource,
        group: String,
    },
}

impl EndpointGroupKey {
    pub fn group_name(&self) -> &str {
        match self {
            EndpointGroupKey::Origin { group, .. } => group,
            EndpointGroupKey::Source { group, .. } => group,
        }
    }

    pub fn source(&self) -> Option<ReportingSource> {
        match self {
            EndpointGroupKey::Origin { .. } => None,
            EndpointGroupKey::Source { source, .. } => Some(*source),
        }
    }

    pub fn origin(&self) -> Option<&ReportUrl> {
        match self {
            EndpointGroupKey::Origin { origin, .. } => Some(origin),
            EndpointGroupKey::Source { .. } => None,
        }
    }
}

/// Per-endpoint delivery statistics (spec §3 "Endpoint").
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointStats {
    pub successful_uploads: u64,
    pub failed_uploads: u64,
    pub last_used: Option<Tick>,
}

/// One delivery target within an [`EndpointGroup`] (spec §3 "Endpoint").
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub url: Url,
    pub weight: u32,
    pub priority: u32,
    pub stats: EndpointStats,
    pub pending_upload: bool,
}

impl Endpoint {
    pub fn new(url: Url, priority: u32, weight: u32) -> Self {
        Endpoint {
            url,
            weight: weight.max(1),
            priority,
            stats: EndpointStats::default(),
            pending_upload: false,
        }
    }
}

/// A named bucket of endpoints sharing a priority/weight structure and an
/// expiry (spec §3 "Endpoint group", Glossary).
#[derive(Clone, Debug)]
pub struct EndpointGroup {
    pub include_subdomains: bool,
    pub expiry: Tick,
    pub last_used: Tick,
    pub endpoints: Vec<Endpoint>,
    /// Isolation info and document origin supplied by a V1
    /// `set_document_endpoints` registration; `None` for origin-scoped
    /// groups created from a `Report-To` header.
    pub document_isolation_info: Option<IsolationInfo>,
    pub document_origin: Option<ReportUrl>,
}

impl EndpointGroup {
    pub fn is_expired(&self, now: Tick) -> bool {
        self.expiry <= now
    }
}
