/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Monotonic-identifier arena, replacing the weak-handle cycles of the
//! original implementation (spec §9 "Cyclic references"): requests hold
//! plain ids, the [`Cache`](crate::cache::Cache) owns the backing map, and a
//! failed lookup naturally encodes "the report is gone".

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier for a [`crate::model::Report`] held by the Cache.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ReportId(u64);

impl ReportId {
    #[cfg(any(test, feature = "test-util"))]
    pub fn for_test(value: u64) -> Self {
        ReportId(value)
    }

    /// The raw identifier value, for status-snapshot serialization.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Generates strictly increasing [`ReportId`]s for one [`crate::cache::Cache`].
///
/// Wraps at `u64::MAX` only after an implausible number of reports; we treat
/// that as an unreachable invariant violation rather than add fallback
/// wrapping logic nothing in this crate would exercise.
#[derive(Debug, Default)]
pub struct IdArena {
    next: AtomicU64,
}

impl IdArena {
    pub fn new() -> Self {
        IdArena {
            next: AtomicU64::new(0),
        }
    }

    pub fn next_report_id(&self) -> ReportId {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        ReportId(value)
    }
}
