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

//! Lock coordinator: acquisition state machine, per-owner registry,
//! background lease prolongation, and release.
//!
//! ## Acquisition
//! Each attempt starts with a strongly-consistent read and then takes one of
//! three paths: create a fresh record, steal an expired one, or wait and
//! retry. Every write is gated on the version token observed by the read, so
//! a lost race shows up as a conditional failure and feeds back into the
//! retry loop rather than surfacing to the caller.
//!
//! ## Prolongation
//! Acquired locks are renewed by one background task per handle, cancelled
//! through a token stored on the handle. Release flips the handle's acquired
//! flag and cancels the token before the backend delete is dispatched, so a
//! renewal that fires during release observes the cleared flag and exits
//! without a write; a renewal already in flight is fenced by the
//! owner-and-version predicate on the backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{LockError, LockResult, StoreError};
use crate::lock::{now_millis, Lock, LockOptions};
use crate::store::{LockRecord, LockStore};

/// Severity attached to coordinator log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Callback sink for coordinator log events.
///
/// Invoked synchronously on the acquisition and renewal paths; expensive
/// sinks should hand the event off to their own worker.
pub type LogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

fn emit(sink: Option<&LogSink>, level: LogLevel, message: &str) {
    match level {
        LogLevel::Info => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
    if let Some(sink) = sink {
        sink(level, message);
    }
}

fn new_version() -> String {
    Uuid::new_v4().to_string()
}

/// Coordinates named locks for one owner against a shared [`LockStore`].
///
/// The owner name is a UUID generated at construction and stamped on every
/// record this instance writes; renewal and delete predicates are bound to
/// it.
///
/// ## Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use dynamutex::coordinator::LockCoordinator;
/// use dynamutex::lock::LockOptions;
/// use dynamutex::store::memory::MemoryLockStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let coordinator = LockCoordinator::new(Arc::new(MemoryLockStore::new()));
///
/// let lock = coordinator.lock("jobs", "nightly-report", LockOptions::default()).await?;
/// // critical section
/// coordinator.release_lock(&lock).await?;
/// # Ok(())
/// # }
/// ```
pub struct LockCoordinator {
    owner_name: String,
    store: Arc<dyn LockStore>,
    registry: Arc<Mutex<HashMap<String, Lock>>>,
    log_sink: Option<LogSink>,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            owner_name: Uuid::new_v4().to_string(),
            store,
            registry: Arc::new(Mutex::new(HashMap::new())),
            log_sink: None,
        }
    }

    /// Attach a callback that receives every coordinator log event.
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// UUID identifying this coordinator instance in persisted records.
    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    /// Acquire the lock named by `(lock_group, lock_id)`.
    ///
    /// Retries until granted or until `max_retry_count` iterations have been
    /// exhausted (the bound is checked with `>` after the previous attempt,
    /// so `max_retry_count = n` allows `n + 1` attempts). Conditional
    /// failures on backend writes are absorbed into the retry loop; only
    /// validation failures, exhaustion, and transport errors reach the
    /// caller.
    pub async fn lock(
        &self,
        lock_group: &str,
        lock_id: &str,
        options: LockOptions,
    ) -> LockResult<Lock> {
        let handle = Lock::create(lock_group, lock_id, &self.owner_name, options)?;
        let uid = handle.unique_identifier();
        let mut retry_count: u32 = 0;

        loop {
            if handle.is_acquired() {
                return Err(LockError::NotGranted(format!(
                    "{}: handle is already acquired",
                    uid
                )));
            }
            if let Some(max) = handle.max_retry_count() {
                if retry_count > max {
                    emit(
                        self.log_sink.as_ref(),
                        LogLevel::Warn,
                        &format!("{}: giving up after {} attempts", uid, retry_count),
                    );
                    return Err(LockError::NotGranted(format!(
                        "{}: gave up after {} attempts",
                        uid, retry_count
                    )));
                }
            }
            retry_count += 1;

            emit(
                self.log_sink.as_ref(),
                LogLevel::Info,
                &format!("{}: acquisition attempt {}", uid, retry_count),
            );

            let observed = self
                .store
                .get_lock(lock_group, lock_id)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;

            match observed {
                None => {
                    handle.attempt_locking(&new_version(), now_millis());
                    match self.store.create_lock(&handle).await {
                        Ok(()) => {
                            emit(
                                self.log_sink.as_ref(),
                                LogLevel::Info,
                                &format!("{}: created new lock record", uid),
                            );
                            return self.commit(handle).await;
                        }
                        Err(StoreError::ConditionalCheckFailed) => {
                            handle.reset_locking_attempt();
                            emit(
                                self.log_sink.as_ref(),
                                LogLevel::Info,
                                &format!("{}: record appeared concurrently, re-reading", uid),
                            );
                        }
                        Err(StoreError::Backend(e)) => return Err(LockError::Backend(e)),
                    }
                }
                Some(existing) => {
                    if handle.trust_local_time()
                        && existing.lease_expiration_time_passed(now_millis())
                    {
                        emit(
                            self.log_sink.as_ref(),
                            LogLevel::Info,
                            &format!(
                                "{}: lease of {} expired by local clock, stealing",
                                uid, existing.owner_name
                            ),
                        );
                        if let Some(lock) = self.try_steal(&handle, &existing).await? {
                            return Ok(lock);
                        }
                    } else if handle.trust_local_time() {
                        let wait_ms = handle.wait_duration_ms().unwrap_or(0);
                        emit(
                            self.log_sink.as_ref(),
                            LogLevel::Info,
                            &format!(
                                "{}: held by {}, re-reading in {} ms",
                                uid, existing.owner_name, wait_ms
                            ),
                        );
                        sleep(Duration::from_millis(wait_ms)).await;
                    } else {
                        emit(
                            self.log_sink.as_ref(),
                            LogLevel::Info,
                            &format!(
                                "{}: held by {}, waiting out its {} ms lease",
                                uid, existing.owner_name, existing.lease_duration_ms
                            ),
                        );
                        sleep(Duration::from_millis(existing.lease_duration_ms)).await;
                        if let Some(lock) = self.try_steal(&handle, &existing).await? {
                            return Ok(lock);
                        }
                    }
                }
            }
        }
    }

    /// One steal attempt gated on the observed version. `Ok(None)` means the
    /// record moved underneath us and the caller should re-read.
    async fn try_steal(
        &self,
        handle: &Lock,
        existing: &LockRecord,
    ) -> LockResult<Option<Lock>> {
        let uid = handle.unique_identifier();
        handle.attempt_locking(&new_version(), now_millis());
        match self.store.steal_lock(existing, handle).await {
            Ok(()) => {
                emit(
                    self.log_sink.as_ref(),
                    LogLevel::Info,
                    &format!("{}: took over record from {}", uid, existing.owner_name),
                );
                Ok(Some(self.commit(handle.clone()).await?))
            }
            Err(StoreError::ConditionalCheckFailed) => {
                handle.reset_locking_attempt();
                emit(
                    self.log_sink.as_ref(),
                    LogLevel::Info,
                    &format!("{}: record was renewed, stolen, or deleted meanwhile", uid),
                );
                Ok(None)
            }
            Err(StoreError::Backend(e)) => Err(LockError::Backend(e)),
        }
    }

    /// Register the freshly written handle and arm its prolongation.
    async fn commit(&self, handle: Lock) -> LockResult<Lock> {
        handle.acquired();
        let uid = handle.unique_identifier();
        self.registry.lock().await.insert(uid.clone(), handle.clone());
        if handle.prolong_lease_enabled() {
            self.spawn_prolongation(&handle);
        }
        emit(
            self.log_sink.as_ref(),
            LogLevel::Info,
            &format!("{}: acquired by {}", uid, self.owner_name),
        );
        Ok(handle)
    }

    fn spawn_prolongation(&self, handle: &Lock) {
        let cancel = CancellationToken::new();
        handle.set_prolongation(cancel.clone());

        let lock = handle.clone();
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let log_sink = self.log_sink.clone();
        let period = Duration::from_millis(lock.prolong_every_ms());

        tokio::spawn(async move {
            let uid = lock.unique_identifier();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(period) => {}
                }

                let registered = registry
                    .lock()
                    .await
                    .get(&uid)
                    .map(|current| Lock::same_handle(current, &lock))
                    .unwrap_or(false);
                if !registered || !lock.is_acquired() {
                    break;
                }

                let version = new_version();
                let now = now_millis();
                match store.renew_lock(&lock, &version, now).await {
                    Ok(()) => {
                        lock.prolonged(&version, now);
                        emit(
                            log_sink.as_ref(),
                            LogLevel::Info,
                            &format!("{}: lease prolonged", uid),
                        );
                    }
                    Err(StoreError::ConditionalCheckFailed) => {
                        emit(
                            log_sink.as_ref(),
                            LogLevel::Warn,
                            &format!(
                                "{}: record no longer owned (stolen or deleted), stopping renewal",
                                uid
                            ),
                        );
                        break;
                    }
                    Err(StoreError::Backend(e)) => {
                        emit(
                            log_sink.as_ref(),
                            LogLevel::Error,
                            &format!("{}: renewal failed, stopping: {}", uid, e),
                        );
                        break;
                    }
                }
            }
        });
    }

    /// Release an acquired lock.
    ///
    /// The handle is marked released and deregistered before the backend
    /// delete goes out. A failed conditional delete means the record was
    /// already gone or reassigned; that is logged and treated as success, so
    /// releasing twice is safe.
    pub async fn release_lock(&self, lock: &Lock) -> LockResult<()> {
        let uid = lock.unique_identifier();
        lock.released();
        {
            let mut registry = self.registry.lock().await;
            if registry
                .get(&uid)
                .map(|current| Lock::same_handle(current, lock))
                .unwrap_or(false)
            {
                registry.remove(&uid);
            }
        }

        match self.store.delete_lock(lock).await {
            Ok(()) => {
                emit(
                    self.log_sink.as_ref(),
                    LogLevel::Info,
                    &format!("{}: released", uid),
                );
                Ok(())
            }
            Err(StoreError::ConditionalCheckFailed) => {
                emit(
                    self.log_sink.as_ref(),
                    LogLevel::Warn,
                    &format!("{}: record already gone or reassigned on release", uid),
                );
                Ok(())
            }
            Err(StoreError::Backend(e)) => Err(LockError::Backend(e)),
        }
    }

    /// Release every lock this coordinator currently holds.
    ///
    /// All handles are marked released and the registry is emptied first;
    /// the backend deletes then run concurrently and are awaited before
    /// returning. The first transport error is reported after every delete
    /// has settled.
    pub async fn release_all_locks(&self) -> LockResult<()> {
        let drained: Vec<Lock> = {
            let mut registry = self.registry.lock().await;
            registry.drain().map(|(_, lock)| lock).collect()
        };
        for lock in &drained {
            lock.released();
        }

        let results = join_all(drained.iter().map(|lock| self.store.delete_lock(lock))).await;

        let mut first_error = None;
        for (lock, result) in drained.iter().zip(results) {
            let uid = lock.unique_identifier();
            match result {
                Ok(()) => emit(
                    self.log_sink.as_ref(),
                    LogLevel::Info,
                    &format!("{}: released", uid),
                ),
                Err(StoreError::ConditionalCheckFailed) => emit(
                    self.log_sink.as_ref(),
                    LogLevel::Warn,
                    &format!("{}: record already gone or reassigned on release", uid),
                ),
                Err(StoreError::Backend(e)) => {
                    emit(
                        self.log_sink.as_ref(),
                        LogLevel::Error,
                        &format!("{}: delete failed: {}", uid, e),
                    );
                    first_error.get_or_insert(LockError::Backend(e));
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Read the current persisted record, if any. Strongly consistent.
    pub async fn get_lock_record(
        &self,
        lock_group: &str,
        lock_id: &str,
    ) -> LockResult<Option<LockRecord>> {
        self.store
            .get_lock(lock_group, lock_id)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }

    /// Number of locks this coordinator currently holds.
    pub async fn held_lock_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

#[cfg(test)]
#[cfg(feature = "memory-backend")]
mod tests {
    use super::*;
    use crate::store::memory::MemoryLockStore;

    #[tokio::test]
    async fn test_owner_name_is_unique_uuid() {
        let store = Arc::new(MemoryLockStore::new());
        let a = LockCoordinator::new(store.clone());
        let b = LockCoordinator::new(store);
        assert!(Uuid::parse_str(a.owner_name()).is_ok());
        assert_ne!(a.owner_name(), b.owner_name());
    }

    #[tokio::test]
    async fn test_registry_starts_empty() {
        let coordinator = LockCoordinator::new(Arc::new(MemoryLockStore::new()));
        assert_eq!(coordinator.held_lock_count().await, 0);
    }
}
