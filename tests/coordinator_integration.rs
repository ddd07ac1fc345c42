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

//! Lock coordinator integration tests.
//!
//! End-to-end scenarios against the in-memory store, which reproduces the
//! backend's conditional-write semantics atomically: acquisition paths
//! (create, wait-then-steal, trust-local-time steal), retry bounds,
//! background prolongation, release ordering, and contention across
//! coordinators sharing one store.

#[cfg(feature = "memory-backend")]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use dynamutex::{
        LockCoordinator, LockError, LockOptions, LockRecord, LockStore, LogLevel,
        MemoryLockStore, StoreResult,
    };
    use tokio::time::sleep;

    fn no_prolong(lease_duration_ms: u64) -> LockOptions {
        LockOptions {
            lease_duration_ms,
            prolong_lease_enabled: false,
            ..LockOptions::default()
        }
    }

    /// Store wrapper that counts renewal writes.
    struct CountingStore {
        inner: MemoryLockStore,
        renewals: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryLockStore::new(),
                renewals: AtomicUsize::new(0),
            }
        }

        fn renewal_count(&self) -> usize {
            self.renewals.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LockStore for CountingStore {
        async fn get_lock(
            &self,
            lock_group: &str,
            lock_id: &str,
        ) -> StoreResult<Option<LockRecord>> {
            self.inner.get_lock(lock_group, lock_id).await
        }

        async fn create_lock(&self, lock: &dynamutex::Lock) -> StoreResult<()> {
            self.inner.create_lock(lock).await
        }

        async fn renew_lock(
            &self,
            lock: &dynamutex::Lock,
            new_version: &str,
            now_ms: i64,
        ) -> StoreResult<()> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            self.inner.renew_lock(lock, new_version, now_ms).await
        }

        async fn steal_lock(
            &self,
            existing: &LockRecord,
            lock: &dynamutex::Lock,
        ) -> StoreResult<()> {
            self.inner.steal_lock(existing, lock).await
        }

        async fn delete_lock(&self, lock: &dynamutex::Lock) -> StoreResult<()> {
            self.inner.delete_lock(lock).await
        }
    }

    #[tokio::test]
    async fn test_acquire_on_empty_table() {
        let store = Arc::new(MemoryLockStore::new());
        let coordinator = LockCoordinator::new(store);

        let lock = coordinator
            .lock("g", "i", no_prolong(30_000))
            .await
            .unwrap();

        assert!(lock.is_acquired());
        assert_eq!(lock.unique_identifier(), "g|i");
        let version = lock.record_version_number().unwrap();
        assert!(!version.is_empty());

        let record = coordinator.get_lock_record("g", "i").await.unwrap().unwrap();
        assert_eq!(record.owner_name, coordinator.owner_name());
        assert_eq!(record.record_version_number, version);
        assert_eq!(record.lease_duration_ms, 30_000);
        assert_eq!(coordinator.held_lock_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_then_reacquire() {
        let coordinator = LockCoordinator::new(Arc::new(MemoryLockStore::new()));

        let first = coordinator.lock("g", "i", no_prolong(30_000)).await.unwrap();
        let first_version = first.record_version_number().unwrap();

        coordinator.release_lock(&first).await.unwrap();
        assert!(!first.is_acquired());
        assert!(coordinator.get_lock_record("g", "i").await.unwrap().is_none());
        assert_eq!(coordinator.held_lock_count().await, 0);

        let second = coordinator.lock("g", "i", no_prolong(30_000)).await.unwrap();
        assert!(second.is_acquired());
        assert_ne!(second.record_version_number().unwrap(), first_version);
    }

    #[tokio::test]
    async fn test_release_twice_is_idempotent() {
        let coordinator = LockCoordinator::new(Arc::new(MemoryLockStore::new()));
        let lock = coordinator.lock("g", "i", no_prolong(30_000)).await.unwrap();

        coordinator.release_lock(&lock).await.unwrap();
        coordinator.release_lock(&lock).await.unwrap();
        assert!(coordinator.get_lock_record("g", "i").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_all_locks_twice() {
        let coordinator = LockCoordinator::new(Arc::new(MemoryLockStore::new()));
        coordinator.lock("g", "a", no_prolong(30_000)).await.unwrap();
        coordinator.lock("g", "b", no_prolong(30_000)).await.unwrap();
        assert_eq!(coordinator.held_lock_count().await, 2);

        coordinator.release_all_locks().await.unwrap();
        assert_eq!(coordinator.held_lock_count().await, 0);
        assert!(coordinator.get_lock_record("g", "a").await.unwrap().is_none());
        assert!(coordinator.get_lock_record("g", "b").await.unwrap().is_none());

        coordinator.release_all_locks().await.unwrap();
        assert_eq!(coordinator.held_lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_contender_fails_while_holder_renews() {
        let store = Arc::new(MemoryLockStore::new());
        let holder = LockCoordinator::new(store.clone());
        let contender = LockCoordinator::new(store);

        let held = holder
            .lock(
                "g",
                "i",
                LockOptions {
                    lease_duration_ms: 1_000,
                    prolong_every_ms: 250,
                    ..LockOptions::default()
                },
            )
            .await
            .unwrap();

        let result = contender
            .lock(
                "g",
                "i",
                LockOptions {
                    max_retry_count: Some(10),
                    trust_local_time: true,
                    wait_duration_ms: Some(0),
                    ..LockOptions::default()
                },
            )
            .await;
        assert!(matches!(result, Err(LockError::NotGranted(_))));

        // The holder's record was never disturbed.
        let record = holder.get_lock_record("g", "i").await.unwrap().unwrap();
        assert_eq!(record.owner_name, holder.owner_name());

        holder.release_lock(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_steal_expired_record_with_trust_local_time() {
        let store = Arc::new(MemoryLockStore::new());
        let holder = LockCoordinator::new(store.clone());
        let thief = LockCoordinator::new(store);

        holder.lock("g", "i", no_prolong(300)).await.unwrap();
        sleep(Duration::from_millis(700)).await;

        let start = Instant::now();
        let stolen = thief
            .lock(
                "g",
                "i",
                LockOptions {
                    trust_local_time: true,
                    wait_duration_ms: Some(0),
                    prolong_lease_enabled: false,
                    ..LockOptions::default()
                },
            )
            .await
            .unwrap();

        // The expired record is taken without waiting out its lease.
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(stolen.is_acquired());

        let record = thief.get_lock_record("g", "i").await.unwrap().unwrap();
        assert_eq!(record.owner_name, thief.owner_name());
        assert_eq!(
            record.record_version_number,
            stolen.record_version_number().unwrap()
        );
    }

    #[tokio::test]
    async fn test_group_is_part_of_key() {
        let coordinator = LockCoordinator::new(Arc::new(MemoryLockStore::new()));

        let a = coordinator.lock("g1", "i", no_prolong(30_000)).await.unwrap();
        let b = coordinator.lock("g2", "i", no_prolong(30_000)).await.unwrap();

        assert!(a.is_acquired());
        assert!(b.is_acquired());
        assert_ne!(a.unique_identifier(), b.unique_identifier());
        assert_eq!(coordinator.held_lock_count().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_contenders_serialize_by_lease_expiry() {
        let store = Arc::new(MemoryLockStore::new());
        let mut handles = Vec::new();

        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let coordinator = LockCoordinator::new(store);
                let lock = coordinator
                    .lock("g", "i", no_prolong(250))
                    .await
                    .expect("acquisition should eventually succeed");
                (
                    coordinator.owner_name().to_string(),
                    lock.record_version_number().unwrap(),
                )
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            winners.push(handle.await.unwrap());
        }
        assert_eq!(winners.len(), 10);

        // The surviving record belongs to exactly one of the acquirers.
        let record = store.get_lock("g", "i").await.unwrap().unwrap();
        let matching: Vec<_> = winners
            .iter()
            .filter(|(owner, version)| {
                *owner == record.owner_name && *version == record.record_version_number
            })
            .collect();
        assert_eq!(matching.len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_advances_persisted_version() {
        let store = Arc::new(MemoryLockStore::new());
        let coordinator = LockCoordinator::new(store);

        let lock = coordinator
            .lock(
                "g",
                "i",
                LockOptions {
                    lease_duration_ms: 1_000,
                    prolong_every_ms: 200,
                    ..LockOptions::default()
                },
            )
            .await
            .unwrap();
        let initial_version = lock.record_version_number().unwrap();

        sleep(Duration::from_millis(700)).await;

        let record = coordinator.get_lock_record("g", "i").await.unwrap().unwrap();
        assert_eq!(record.owner_name, coordinator.owner_name());
        assert_ne!(record.record_version_number, initial_version);
        // The handle tracks the renewed token.
        assert_eq!(
            record.record_version_number,
            lock.record_version_number().unwrap()
        );
        assert!(lock.is_acquired());

        coordinator.release_lock(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_renewal_after_release() {
        let store = Arc::new(CountingStore::new());
        let coordinator = LockCoordinator::new(store.clone());

        let lock = coordinator
            .lock(
                "g",
                "i",
                LockOptions {
                    lease_duration_ms: 1_000,
                    prolong_every_ms: 200,
                    ..LockOptions::default()
                },
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(500)).await;
        assert!(store.renewal_count() >= 1);

        coordinator.release_lock(&lock).await.unwrap();
        let renewals_at_release = store.renewal_count();

        sleep(Duration::from_millis(600)).await;
        assert_eq!(store.renewal_count(), renewals_at_release);
        assert!(coordinator.get_lock_record("g", "i").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_log_sink_receives_acquisition_events() {
        let events: Arc<Mutex<Vec<(LogLevel, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();

        let coordinator = LockCoordinator::new(Arc::new(MemoryLockStore::new())).with_log_sink(
            Arc::new(move |level, message| {
                sink_events.lock().unwrap().push((level, message.to_string()));
            }),
        );

        coordinator.lock("g", "i", no_prolong(30_000)).await.unwrap();

        let infos = events
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, _)| *level == LogLevel::Info)
            .count();
        assert!(infos >= 3, "expected at least 3 info events, got {}", infos);
    }

    #[tokio::test]
    async fn test_max_retry_zero_fails_fast() {
        let store = Arc::new(MemoryLockStore::new());
        let holder = LockCoordinator::new(store.clone());
        let contender = LockCoordinator::new(store);

        holder.lock("g", "i", no_prolong(60_000)).await.unwrap();

        let start = Instant::now();
        let result = contender
            .lock(
                "g",
                "i",
                LockOptions {
                    max_retry_count: Some(0),
                    trust_local_time: true,
                    wait_duration_ms: Some(0),
                    ..LockOptions::default()
                },
            )
            .await;

        assert!(matches!(result, Err(LockError::NotGranted(_))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_any_backend_call() {
        let store = Arc::new(CountingStore::new());
        let coordinator = LockCoordinator::new(store.clone());

        let result = coordinator
            .lock(
                "g",
                "i",
                LockOptions {
                    lease_duration_ms: 10_000,
                    prolong_every_ms: 5_000,
                    ..LockOptions::default()
                },
            )
            .await;

        assert!(matches!(result, Err(LockError::OptionsValidation(_))));
        assert!(coordinator.get_lock_record("g", "i").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_then_steal_takes_over_silent_holder() {
        let store = Arc::new(MemoryLockStore::new());
        let holder = LockCoordinator::new(store.clone());
        let contender = LockCoordinator::new(store);

        // Holder never renews; the contender waits out the observed lease
        // and then replaces the record.
        holder.lock("g", "i", no_prolong(300)).await.unwrap();

        let lock = contender.lock("g", "i", no_prolong(300)).await.unwrap();
        assert!(lock.is_acquired());

        let record = contender.get_lock_record("g", "i").await.unwrap().unwrap();
        assert_eq!(record.owner_name, contender.owner_name());
    }
}
