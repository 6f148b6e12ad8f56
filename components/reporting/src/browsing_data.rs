/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Browsing-data removal (spec §4.5): a thin, origin-predicate-driven facade
//! over [`Cache`]'s retain-based removal, mirroring the bitmask shape of
//! `components/net_traits`'s own clear-data requests.

use crate::cache::{Cache, DataTypeMask};
use crate::capability::Store;
use crate::origin::ReportUrl;

/// Removes reports and/or endpoint groups whose origin satisfies
/// `origin_predicate`, restricted to the data types set in `mask` (spec
/// §4.5 `remove_browsing_data`).
pub fn remove_browsing_data<S: Store>(
    cache: &mut Cache<S>,
    mask: DataTypeMask,
    origin_predicate: impl Fn(&ReportUrl) -> bool,
) {
    cache.remove_browsing_data(mask, origin_predicate);
}

/// Removes all reports and/or endpoint groups, restricted to the data types
/// set in `mask` (spec §4.5 `remove_all_browsing_data`).
pub fn remove_all_browsing_data<S: Store>(cache: &mut Cache<S>, mask: DataTypeMask) {
    cache.remove_all_browsing_data(mask);
}
