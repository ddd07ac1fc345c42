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

//! Lock handle entity and acquisition options.
//!
//! A [`Lock`] is an immutable-keyed, mutable-state record: identity and lease
//! parameters are fixed at creation, while the version token, timestamps, and
//! acquisition flag change as the handle moves through its lifecycle
//! (tentative attempt, acquired, prolonged, released). Handles are cheaply
//! cloneable; all clones share the same state.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{LockError, LockResult};

/// Current wall clock in milliseconds since the UNIX epoch.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Options for a single lock acquisition.
///
/// All durations are milliseconds.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Declared lease length written on each acquire and steal.
    pub lease_duration_ms: u64,
    /// Schedule background renewal after acquisition.
    pub prolong_lease_enabled: bool,
    /// Renewal period; must fit twice within the lease so one missed write
    /// does not expire it.
    pub prolong_every_ms: u64,
    /// Use the local clock to treat an expired record as stealable instead
    /// of waiting out its full lease.
    pub trust_local_time: bool,
    /// With `trust_local_time`, pause between re-reads. `None` means re-read
    /// immediately.
    pub wait_duration_ms: Option<u64>,
    /// Bound on acquisition attempts. `None` means retry until granted.
    pub max_retry_count: Option<u32>,
    /// Caller payload persisted verbatim with the record.
    pub additional_attributes: HashMap<String, Value>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease_duration_ms: 20_000,
            prolong_lease_enabled: true,
            prolong_every_ms: 5_000,
            trust_local_time: false,
            wait_duration_ms: None,
            max_retry_count: None,
            additional_attributes: HashMap::new(),
        }
    }
}

/// Mutable portion of the handle.
#[derive(Debug, Default)]
struct LockState {
    record_version_number: Option<String>,
    last_updated_time_ms: Option<i64>,
    is_acquired: bool,
    prolongation: Option<CancellationToken>,
}

struct LockInner {
    lock_group: String,
    lock_id: String,
    owner_name: String,
    lease_duration_ms: u64,
    prolong_lease_enabled: bool,
    prolong_every_ms: u64,
    trust_local_time: bool,
    wait_duration_ms: Option<u64>,
    max_retry_count: Option<u32>,
    additional_attributes: HashMap<String, Value>,
    state: RwLock<LockState>,
}

/// In-memory handle to a distributed lock.
///
/// Returned by [`LockCoordinator::lock`](crate::coordinator::LockCoordinator::lock)
/// and passed back to release it. The state lock is only ever held for plain
/// field access, never across an await point.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    /// Build a handle from caller input, validating the options.
    ///
    /// ## Validation
    /// - `lock_group`, `lock_id`, and `owner_name` must be non-empty
    /// - `lease_duration_ms` and `prolong_every_ms` must be positive
    /// - with prolongation enabled, `prolong_every_ms` must be strictly less
    ///   than half of `lease_duration_ms`
    pub(crate) fn create(
        lock_group: &str,
        lock_id: &str,
        owner_name: &str,
        options: LockOptions,
    ) -> LockResult<Self> {
        if lock_group.is_empty() {
            return Err(LockError::OptionsValidation(
                "lock group must not be empty".to_string(),
            ));
        }
        if lock_id.is_empty() {
            return Err(LockError::OptionsValidation(
                "lock id must not be empty".to_string(),
            ));
        }
        if owner_name.is_empty() {
            return Err(LockError::OptionsValidation(
                "owner name must not be empty".to_string(),
            ));
        }
        if options.lease_duration_ms == 0 {
            return Err(LockError::OptionsValidation(
                "lease duration must be positive".to_string(),
            ));
        }
        if options.prolong_every_ms == 0 {
            return Err(LockError::OptionsValidation(
                "prolongation period must be positive".to_string(),
            ));
        }
        // Two renewal attempts must fit within one lease.
        if options.prolong_lease_enabled
            && options.prolong_every_ms * 2 >= options.lease_duration_ms
        {
            return Err(LockError::OptionsValidation(format!(
                "prolongation period {} ms must be less than half the lease duration {} ms",
                options.prolong_every_ms, options.lease_duration_ms
            )));
        }

        Ok(Self {
            inner: Arc::new(LockInner {
                lock_group: lock_group.to_string(),
                lock_id: lock_id.to_string(),
                owner_name: owner_name.to_string(),
                lease_duration_ms: options.lease_duration_ms,
                prolong_lease_enabled: options.prolong_lease_enabled,
                prolong_every_ms: options.prolong_every_ms,
                trust_local_time: options.trust_local_time,
                wait_duration_ms: options.wait_duration_ms,
                max_retry_count: options.max_retry_count,
                additional_attributes: options.additional_attributes,
                state: RwLock::new(LockState::default()),
            }),
        })
    }

    /// `"{lock_group}|{lock_id}"`, the form used in logs and the registry.
    pub fn unique_identifier(&self) -> String {
        format!("{}|{}", self.inner.lock_group, self.inner.lock_id)
    }

    pub fn lock_group(&self) -> &str {
        &self.inner.lock_group
    }

    pub fn lock_id(&self) -> &str {
        &self.inner.lock_id
    }

    pub fn owner_name(&self) -> &str {
        &self.inner.owner_name
    }

    pub fn lease_duration_ms(&self) -> u64 {
        self.inner.lease_duration_ms
    }

    pub fn prolong_lease_enabled(&self) -> bool {
        self.inner.prolong_lease_enabled
    }

    pub fn prolong_every_ms(&self) -> u64 {
        self.inner.prolong_every_ms
    }

    pub fn trust_local_time(&self) -> bool {
        self.inner.trust_local_time
    }

    pub fn wait_duration_ms(&self) -> Option<u64> {
        self.inner.wait_duration_ms
    }

    pub fn max_retry_count(&self) -> Option<u32> {
        self.inner.max_retry_count
    }

    pub fn additional_attributes(&self) -> &HashMap<String, Value> {
        &self.inner.additional_attributes
    }

    /// Version token from the last write attempt, if any.
    pub fn record_version_number(&self) -> Option<String> {
        self.read_state().record_version_number.clone()
    }

    pub fn last_updated_time_ms(&self) -> Option<i64> {
        self.read_state().last_updated_time_ms
    }

    pub fn is_acquired(&self) -> bool {
        self.read_state().is_acquired
    }

    /// Whether the declared lease has run out by the local clock.
    ///
    /// `false` when the handle has never been written.
    pub fn lease_expiration_time_passed(&self) -> bool {
        match self.read_state().last_updated_time_ms {
            None => false,
            Some(last) => now_millis() > last + self.inner.lease_duration_ms as i64,
        }
    }

    /// Record a tentative version token and write time before a backend write.
    pub(crate) fn attempt_locking(&self, version: &str, when_ms: i64) {
        let mut state = self.write_state();
        state.record_version_number = Some(version.to_string());
        state.last_updated_time_ms = Some(when_ms);
    }

    /// Roll back a failed write attempt.
    pub(crate) fn reset_locking_attempt(&self) {
        let mut state = self.write_state();
        state.record_version_number = None;
        state.last_updated_time_ms = None;
    }

    /// Commit the handle after a successful backend write.
    pub(crate) fn acquired(&self) {
        self.write_state().is_acquired = true;
    }

    /// Advance the handle after a successful renewal write.
    pub(crate) fn prolonged(&self, version: &str, when_ms: i64) {
        let mut state = self.write_state();
        state.record_version_number = Some(version.to_string());
        state.last_updated_time_ms = Some(when_ms);
    }

    /// Mark the handle released and cancel any scheduled prolongation.
    ///
    /// This runs before the backend delete is dispatched, so a concurrently
    /// firing renewal observes the cleared flag and exits without a write.
    pub(crate) fn released(&self) {
        let token = {
            let mut state = self.write_state();
            state.is_acquired = false;
            state.prolongation.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Store the cancellation token of the scheduled prolongation task.
    pub(crate) fn set_prolongation(&self, token: CancellationToken) {
        self.write_state().prolongation = Some(token);
    }

    /// Whether two handles share state (clones of the same acquisition).
    pub(crate) fn same_handle(a: &Lock, b: &Lock) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, LockState> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, LockState> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unique_identifier())
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("Lock")
            .field("lock_group", &self.inner.lock_group)
            .field("lock_id", &self.inner.lock_id)
            .field("owner_name", &self.inner.owner_name)
            .field("is_acquired", &state.is_acquired)
            .field("record_version_number", &state.record_version_number)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(options: LockOptions) -> LockResult<Lock> {
        Lock::create("group", "id", "owner-1", options)
    }

    #[test]
    fn test_unique_identifier() {
        let lock = create(LockOptions::default()).unwrap();
        assert_eq!(lock.unique_identifier(), "group|id");
        assert_eq!(format!("{}", lock), "group|id");
    }

    #[test]
    fn test_empty_identity_rejected() {
        for (group, id, owner) in [("", "id", "o"), ("g", "", "o"), ("g", "id", "")] {
            let result = Lock::create(group, id, owner, LockOptions::default());
            assert!(matches!(result, Err(LockError::OptionsValidation(_))));
        }
    }

    #[test]
    fn test_zero_durations_rejected() {
        let result = create(LockOptions {
            lease_duration_ms: 0,
            ..LockOptions::default()
        });
        assert!(matches!(result, Err(LockError::OptionsValidation(_))));

        let result = create(LockOptions {
            prolong_every_ms: 0,
            ..LockOptions::default()
        });
        assert!(matches!(result, Err(LockError::OptionsValidation(_))));
    }

    #[test]
    fn test_prolongation_period_boundary() {
        // Exactly half the lease: rejected.
        let result = create(LockOptions {
            lease_duration_ms: 20_000,
            prolong_every_ms: 10_000,
            ..LockOptions::default()
        });
        assert!(matches!(result, Err(LockError::OptionsValidation(_))));

        // One below half: accepted.
        let result = create(LockOptions {
            lease_duration_ms: 20_000,
            prolong_every_ms: 9_999,
            ..LockOptions::default()
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_prolongation_period_ignored_when_disabled() {
        let result = create(LockOptions {
            lease_duration_ms: 1_000,
            prolong_every_ms: 5_000,
            prolong_lease_enabled: false,
            ..LockOptions::default()
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_attempt_and_reset() {
        let lock = create(LockOptions::default()).unwrap();
        assert!(lock.record_version_number().is_none());

        lock.attempt_locking("v1", 42);
        assert_eq!(lock.record_version_number().as_deref(), Some("v1"));
        assert_eq!(lock.last_updated_time_ms(), Some(42));

        lock.reset_locking_attempt();
        assert!(lock.record_version_number().is_none());
        assert!(lock.last_updated_time_ms().is_none());
    }

    #[test]
    fn test_lease_expiration_time_passed() {
        let lock = create(LockOptions {
            lease_duration_ms: 1_000,
            prolong_lease_enabled: false,
            ..LockOptions::default()
        })
        .unwrap();

        // Never written: not expired.
        assert!(!lock.lease_expiration_time_passed());

        lock.attempt_locking("v1", now_millis() - 5_000);
        assert!(lock.lease_expiration_time_passed());

        lock.attempt_locking("v2", now_millis());
        assert!(!lock.lease_expiration_time_passed());
    }

    #[test]
    fn test_released_cancels_prolongation() {
        let lock = create(LockOptions::default()).unwrap();
        let token = CancellationToken::new();
        lock.set_prolongation(token.clone());
        lock.acquired();
        assert!(lock.is_acquired());

        lock.released();
        assert!(!lock.is_acquired());
        assert!(token.is_cancelled());

        // Idempotent on the handle.
        lock.released();
        assert!(!lock.is_acquired());
    }

    #[test]
    fn test_clones_share_state() {
        let lock = create(LockOptions::default()).unwrap();
        let clone = lock.clone();
        lock.acquired();
        assert!(clone.is_acquired());
        assert!(Lock::same_handle(&lock, &clone));

        let other = create(LockOptions::default()).unwrap();
        assert!(!Lock::same_handle(&lock, &other));
    }
}
