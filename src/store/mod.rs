// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Dynamutex.
//
// Dynamutex is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Dynamutex is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Dynamutex. If not, see <https://www.gnu.org/licenses/>.

//! Store adapters: the conditional-write seam under the coordinator.
//!
//! A [`LockStore`] maps the five lock-plane operations onto single-item
//! conditional writes and strongly-consistent reads. Every write is gated on
//! the record-version token the caller last observed; the entire safety
//! argument of the coordinator rests on the backend honoring these
//! predicates. Adapters own no state beyond an immutable table descriptor.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreResult;
use crate::lock::Lock;

#[cfg(feature = "ddb-backend")]
pub mod dynamo;

#[cfg(feature = "memory-backend")]
pub mod memory;

/// Persisted attribute set of one lock record.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    /// Coordinator instance that last wrote the record.
    pub owner_name: String,
    /// Optimistic-concurrency token, replaced on every write.
    pub record_version_number: String,
    /// Writer's local clock at the last write, milliseconds since epoch.
    pub last_updated_time_ms: i64,
    /// Declared lease length in milliseconds.
    pub lease_duration_ms: u64,
    /// Caller payload, preserved verbatim.
    pub additional_attributes: HashMap<String, Value>,
}

impl LockRecord {
    /// Whether the record's lease has run out as of `now_ms` on the local
    /// clock. Only meaningful to callers that opted into trusting local time.
    pub fn lease_expiration_time_passed(&self, now_ms: i64) -> bool {
        now_ms > self.last_updated_time_ms + self.lease_duration_ms as i64
    }
}

/// Conditional lock-plane operations over a key-value backend.
///
/// Implementations must surface a failed conditional predicate as
/// [`StoreError::ConditionalCheckFailed`](crate::error::StoreError::ConditionalCheckFailed)
/// and everything else as `Backend`; the coordinator treats the former as
/// control flow and the latter as fatal.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Strongly-consistent read of the record under `(lock_group, lock_id)`.
    async fn get_lock(&self, lock_group: &str, lock_id: &str)
        -> StoreResult<Option<LockRecord>>;

    /// Conditional put: succeeds only when no record exists under the key.
    ///
    /// The handle must carry a pending version token and write time from
    /// `attempt_locking`.
    async fn create_lock(&self, lock: &Lock) -> StoreResult<()>;

    /// Conditional renewal: advances the version token and write time,
    /// gated on the handle's current version AND owner. Fails once the
    /// record was stolen or deleted.
    async fn renew_lock(&self, lock: &Lock, new_version: &str, now_ms: i64) -> StoreResult<()>;

    /// Conditional replacement of `existing` by the handle's pending
    /// content, gated on the observed version only. The owner is
    /// deliberately absent from the predicate: stealing is cross-owner.
    async fn steal_lock(&self, existing: &LockRecord, lock: &Lock) -> StoreResult<()>;

    /// Conditional delete, gated on the handle's version AND owner.
    async fn delete_lock(&self, lock: &Lock) -> StoreResult<()>;
}
