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

//! # Dynamutex
//!
//! ## Purpose
//! Distributed mutual exclusion over a conditional key-value store. Multiple
//! independent processes compete to acquire named locks; at most one holder
//! at a time may consider itself the owner of a given lock, even under
//! crashes and partial failures, as long as the backend honors conditional
//! single-item writes and strongly-consistent reads.
//!
//! ## Design Decisions
//! - **Version-based optimistic locking**: every write replaces an opaque
//!   record-version token and is gated on the token last observed, so lost
//!   races surface as conditional failures instead of corrupted state
//! - **Lease-based expiry**: stale holders are detected from
//!   `lastUpdatedTimeInMs + leaseDurationInMs`, never from backend TTL
//! - **Background prolongation**: held locks are renewed at a sub-lease
//!   cadence by one task per handle, cancelled on release
//! - **Two waiting strategies**: wait out the observed lease before
//!   stealing, or trust the local clock and steal an expired record
//!   immediately (caller opt-in)
//!
//! ## Backend Support
//! - **DynamoDB**: production backend (feature: `ddb-backend`)
//! - **InMemory**: HashMap-based, for testing (feature: `memory-backend`)
//!
//! ## Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dynamutex::{DynamoLockStore, LockCoordinator, LockOptions, TableSchema};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
//! let client = aws_sdk_dynamodb::Client::new(&config);
//! let store = DynamoLockStore::new(client, TableSchema::new("locks"));
//! let coordinator = LockCoordinator::new(Arc::new(store));
//!
//! let lock = coordinator
//!     .lock("reports", "nightly", LockOptions::default())
//!     .await?;
//! // critical section: we are the only holder of reports|nightly
//! coordinator.release_lock(&lock).await?;
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod lock;
pub mod store;
pub mod table;

pub use coordinator::{LockCoordinator, LogLevel, LogSink};
pub use error::{LockError, LockResult, StoreError, StoreResult};
pub use lock::{Lock, LockOptions};
pub use store::{LockRecord, LockStore};
pub use table::TableSchema;

#[cfg(feature = "ddb-backend")]
pub use store::dynamo::DynamoLockStore;

#[cfg(feature = "memory-backend")]
pub use store::memory::MemoryLockStore;
