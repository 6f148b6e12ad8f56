/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Turns the two wire header formats into Cache mutations (spec §4.3, §6).
//! Parsing failures are silent drops (spec §7): every public function here
//! returns `Result`/`()` internally for logging, never surfaces an error to
//! the `Service` caller.

use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::cache::Cache;
use crate::capability::Store;
use crate::model::{Endpoint, PartitionKey, Tick};
use crate::origin::{self, ReportUrl};

/// Max accepted size of a raw `Report-To` header fragment (spec §6, §8
/// boundary 9).
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Max accepted JSON nesting depth (spec §6, §8 boundary 10).
pub const MAX_JSON_DEPTH: usize = 5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderParseError {
    TooLarge,
    TooDeep,
    Malformed,
}

impl fmt::Display for HeaderParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderParseError::TooLarge => write!(f, "header exceeds {MAX_HEADER_SIZE} bytes"),
            HeaderParseError::TooDeep => write!(f, "header JSON exceeds depth {MAX_JSON_DEPTH}"),
            HeaderParseError::Malformed => write!(f, "header JSON is malformed"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    url: String,
    priority: Option<i64>,
    weight: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    group: Option<String>,
    max_age: u64,
    #[serde(default)]
    endpoints: Vec<RawEndpoint>,
    #[serde(default)]
    include_subdomains: bool,
}

/// One parsed `Report-To` group object, before endpoint validation.
#[derive(Debug)]
pub struct ParsedGroup {
    pub group: String,
    pub max_age: u64,
    pub endpoints: Vec<RawEndpoint>,
    pub include_subdomains: bool,
}

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Parses a raw `Report-To` header fragment (the comma-joined list of group
/// objects, *not yet* wrapped in `[ ]`) into validated group descriptors.
pub fn parse_report_to_header(raw: &str) -> Result<Vec<ParsedGroup>, HeaderParseError> {
    if raw.len() > MAX_HEADER_SIZE {
        return Err(HeaderParseError::TooLarge);
    }
    let wrapped = format!("[{raw}]");
    let value: Value = serde_json::from_str(&wrapped).map_err(|_| HeaderParseError::Malformed)?;
    if json_depth(&value) > MAX_JSON_DEPTH {
        return Err(HeaderParseError::TooDeep);
    }
    let raw_groups: Vec<RawGroup> =
        serde_json::from_value(value).map_err(|_| HeaderParseError::Malformed)?;
    Ok(raw_groups
        .into_iter()
        .map(|g| ParsedGroup {
            group: g.group.unwrap_or_else(|| "default".to_owned()),
            max_age: g.max_age,
            endpoints: g.endpoints,
            include_subdomains: g.include_subdomains,
        })
        .collect())
}

/// Validates one endpoint object: scheme must be HTTPS and the origin must
/// be potentially-trustworthy (spec §4.3); default priority 1, weight 1.
fn validate_endpoint(raw: &RawEndpoint) -> Option<Endpoint> {
    let url = Url::parse(&raw.url).ok()?;
    if !origin::is_secure_scheme(&url) || !origin::is_potentially_trustworthy(&url) {
        return None;
    }
    let priority = raw.priority.filter(|p| *p >= 0).unwrap_or(1) as u32;
    let weight = raw.weight.filter(|w| *w >= 1).unwrap_or(1) as u32;
    Some(Endpoint::new(url, priority, weight))
}

/// Parses and applies a `Report-To` header to the Cache (spec §4.3): size
/// and depth limits, per-group `max_age=0` deletion, per-endpoint
/// validation that drops the endpoint but keeps the group.
pub fn apply_report_to_header<S: Store>(
    cache: &mut Cache<S>,
    origin: &ReportUrl,
    partition: &PartitionKey,
    raw_header: &str,
    now: Tick,
) {
    let groups = match parse_report_to_header(raw_header) {
        Ok(groups) => groups,
        Err(err) => {
            log::debug!("reporting: dropping malformed Report-To header: {err}");
            return;
        },
    };
    for group in groups {
        apply_parsed_group(cache, origin, partition, group, now);
    }
}

/// Applies one already-parsed group object to the Cache (spec §4.3). Split
/// out from [`apply_report_to_header`] so [`crate::service::Service`] can
/// validate and JSON-parse a header eagerly (spec §4.6
/// `process_report_to_header`: "size-limits and JSON-parses; then gates")
/// while still applying each group through the same logic once the gate
/// releases it.
pub fn apply_parsed_group<S: Store>(
    cache: &mut Cache<S>,
    origin: &ReportUrl,
    partition: &PartitionKey,
    group: ParsedGroup,
    now: Tick,
) {
    if group.max_age == 0 {
        cache.delete_endpoints_for_origin(origin, partition, &group.group);
        return;
    }
    let endpoints: Vec<Endpoint> = group
        .endpoints
        .iter()
        .filter_map(validate_endpoint)
        .collect();
    let expiry = now.saturating_add(group.max_age.saturating_mul(1000));
    cache.set_endpoints_for_origin(
        origin.clone(),
        partition.clone(),
        group.group,
        group.include_subdomains,
        expiry,
        endpoints,
        now,
    );
}

/// Hand-rolled parser for the narrow slice of RFC 8941 structured-fields
/// dictionaries the `Reporting-Endpoints` header grammar needs: comma
/// separated `name="url"` pairs (spec §6). This workspace carries no
/// general structured-fields crate, so only string-item values are
/// supported; anything else is silently skipped.
pub fn parse_reporting_endpoints_header(raw: &str) -> Vec<(String, Url)> {
    let mut result = Vec::new();
    for member in raw.split(',') {
        let member = member.trim();
        let Some((name, rest)) = member.split_once('=') else {
            continue;
        };
        let name = name.trim();
        let rest = rest.trim();
        let Some(quoted) = rest.strip_prefix('"') else {
            continue;
        };
        // Structured-field parameters (`; foo=bar`) are not present in this
        // header's grammar; take everything up to the closing quote.
        let Some(end) = quoted.find('"') else {
            continue;
        };
        let value = &quoted[..end];
        if name.is_empty() {
            continue;
        }
        if let Ok(url) = Url::parse(value) {
            result.push((name.to_owned(), url));
        }
    }
    result
}
