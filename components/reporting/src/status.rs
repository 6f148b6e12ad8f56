/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Serializes the Cache into the status snapshot (spec §6 "Status
//! snapshot"; scalar counters supplemented per `SPEC_FULL.md` §2).

use serde::Serialize;

use crate::cache::Cache;
use crate::capability::Store;
use crate::model::ReportStatus;

#[derive(Serialize)]
struct EndpointDescriptor {
    url: String,
    priority: u32,
    weight: u32,
    #[serde(rename = "pendingUpload")]
    pending_upload: bool,
    #[serde(rename = "successfulUploadCount")]
    successful_uploads: u64,
    #[serde(rename = "failedUploadCount")]
    failed_uploads: u64,
    #[serde(rename = "lastUsed")]
    last_used: Option<u64>,
}

#[derive(Serialize)]
struct ClientDescriptor {
    origin: Option<String>,
    source: Option<String>,
    group: String,
    #[serde(rename = "includeSubdomains")]
    include_subdomains: bool,
    expiry: u64,
    #[serde(rename = "lastUsed")]
    last_used: u64,
    endpoints: Vec<EndpointDescriptor>,
    #[serde(rename = "isolationInfo")]
    isolation_info: Option<String>,
}

#[derive(Serialize)]
struct ReportDescriptor {
    id: u64,
    url: String,
    source: Option<String>,
    group: String,
    #[serde(rename = "type")]
    type_: String,
    status: ReportStatus,
    attempts: u32,
    #[serde(rename = "queuedAt")]
    queued_at: u64,
}

#[derive(Serialize)]
struct StatusSnapshot {
    #[serde(rename = "reportingEnabled")]
    reporting_enabled: bool,
    clients: Vec<ClientDescriptor>,
    reports: Vec<ReportDescriptor>,
    #[serde(rename = "queuedReportCount")]
    queued_report_count: u64,
    #[serde(rename = "pendingReportCount")]
    pending_report_count: u64,
    #[serde(rename = "doomedReportCount")]
    doomed_report_count: u64,
}

/// Builds the status snapshot dictionary (spec §6: `reportingEnabled`,
/// `clients`, `reports`; `queuedReportCount`/`pendingReportCount`/
/// `doomedReportCount` are this crate's supplementary scalar counters, see
/// `SPEC_FULL.md` §2).
pub fn status_as_value<S: Store>(cache: &Cache<S>, reporting_enabled: bool) -> serde_json::Value {
    let clients = cache
        .groups()
        .map(|(key, group)| ClientDescriptor {
            origin: key
                .origin()
                .map(|o| o.as_str().to_owned())
                .or_else(|| group.document_origin.as_ref().map(|o| o.as_str().to_owned())),
            source: key.source().map(|s| s.to_string()),
            group: key.group_name().to_owned(),
            include_subdomains: group.include_subdomains,
            expiry: group.expiry,
            last_used: group.last_used,
            endpoints: group
                .endpoints
                .iter()
                .map(|e| EndpointDescriptor {
                    url: e.url.to_string(),
                    priority: e.priority,
                    weight: e.weight,
                    pending_upload: e.pending_upload,
                    successful_uploads: e.stats.successful_uploads,
                    failed_uploads: e.stats.failed_uploads,
                    last_used: e.stats.last_used,
                })
                .collect(),
            isolation_info: group.document_isolation_info.as_ref().map(|i| i.0.clone()),
        })
        .collect();

    let mut queued_report_count = 0u64;
    let mut pending_report_count = 0u64;
    let mut doomed_report_count = 0u64;
    let reports = cache
        .reports()
        .map(|r| {
            match r.status {
                ReportStatus::Queued => queued_report_count += 1,
                ReportStatus::Pending => pending_report_count += 1,
                ReportStatus::Doomed => doomed_report_count += 1,
                ReportStatus::Success => {},
            }
            ReportDescriptor {
                id: r.id.as_u64(),
                url: r.url.as_str().to_owned(),
                source: r.source.map(|s| s.to_string()),
                group: r.group.clone(),
                type_: r.type_.clone(),
                status: r.status,
                attempts: r.attempts,
                queued_at: r.queued_at,
            }
        })
        .collect();

    let snapshot = StatusSnapshot {
        reporting_enabled,
        clients,
        reports,
        queued_report_count,
        pending_report_count,
        doomed_report_count,
    };
    serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null)
}
