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

//! In-memory store adapter (for testing and single-process scenarios).
//!
//! Each operation takes the map's write lock for its full duration, which
//! gives the same atomic conditional semantics a real backend provides with
//! condition expressions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::lock::Lock;
use crate::store::{LockRecord, LockStore};

/// In-memory [`LockStore`].
///
/// ## Limitations
/// - Not persistent (records lost on restart)
/// - Not distributed (single process only)
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    records: Arc<RwLock<HashMap<(String, String), LockRecord>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(lock_group: &str, lock_id: &str) -> (String, String) {
        (lock_group.to_string(), lock_id.to_string())
    }

    fn pending_record(lock: &Lock) -> StoreResult<LockRecord> {
        let record_version_number = lock
            .record_version_number()
            .ok_or_else(|| StoreError::Backend("lock handle has no pending version token".to_string()))?;
        let last_updated_time_ms = lock
            .last_updated_time_ms()
            .ok_or_else(|| StoreError::Backend("lock handle has no pending write time".to_string()))?;
        Ok(LockRecord {
            owner_name: lock.owner_name().to_string(),
            record_version_number,
            last_updated_time_ms,
            lease_duration_ms: lock.lease_duration_ms(),
            additional_attributes: lock.additional_attributes().clone(),
        })
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn get_lock(
        &self,
        lock_group: &str,
        lock_id: &str,
    ) -> StoreResult<Option<LockRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&Self::key(lock_group, lock_id)).cloned())
    }

    async fn create_lock(&self, lock: &Lock) -> StoreResult<()> {
        let record = Self::pending_record(lock)?;
        let mut records = self.records.write().await;
        let key = Self::key(lock.lock_group(), lock.lock_id());
        if records.contains_key(&key) {
            return Err(StoreError::ConditionalCheckFailed);
        }
        records.insert(key, record);
        Ok(())
    }

    async fn renew_lock(&self, lock: &Lock, new_version: &str, now_ms: i64) -> StoreResult<()> {
        let old_version = lock
            .record_version_number()
            .ok_or_else(|| StoreError::Backend("lock handle has no pending version token".to_string()))?;
        let mut records = self.records.write().await;
        let key = Self::key(lock.lock_group(), lock.lock_id());
        match records.get_mut(&key) {
            Some(record)
                if record.record_version_number == old_version
                    && record.owner_name == lock.owner_name() =>
            {
                record.record_version_number = new_version.to_string();
                record.last_updated_time_ms = now_ms;
                Ok(())
            }
            _ => Err(StoreError::ConditionalCheckFailed),
        }
    }

    async fn steal_lock(&self, existing: &LockRecord, lock: &Lock) -> StoreResult<()> {
        let record = Self::pending_record(lock)?;
        let mut records = self.records.write().await;
        let key = Self::key(lock.lock_group(), lock.lock_id());
        match records.get_mut(&key) {
            Some(current)
                if current.record_version_number == existing.record_version_number =>
            {
                *current = record;
                Ok(())
            }
            _ => Err(StoreError::ConditionalCheckFailed),
        }
    }

    async fn delete_lock(&self, lock: &Lock) -> StoreResult<()> {
        let version = lock
            .record_version_number()
            .ok_or_else(|| StoreError::Backend("lock handle has no pending version token".to_string()))?;
        let mut records = self.records.write().await;
        let key = Self::key(lock.lock_group(), lock.lock_id());
        match records.get(&key) {
            Some(record)
                if record.record_version_number == version
                    && record.owner_name == lock.owner_name() =>
            {
                records.remove(&key);
                Ok(())
            }
            _ => Err(StoreError::ConditionalCheckFailed),
        }
    }
}
