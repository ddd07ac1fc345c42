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

//! Error types for distributed lock operations.

use thiserror::Error;

/// Result type for coordinator-level operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors surfaced to callers of the lock coordinator.
///
/// Conditional-check failures on backend writes are control flow inside the
/// acquisition and release paths and never appear here; callers only see
/// validation failures, exhausted acquisitions, and transport errors.
#[derive(Error, Debug)]
pub enum LockError {
    /// Invalid acquisition options (empty identity, zero durations, or a
    /// prolongation period that does not fit twice within the lease)
    #[error("Invalid lock options: {0}")]
    OptionsValidation(String),

    /// Table descriptor collides with a reserved attribute name
    #[error("Invalid lock table configuration: {0}")]
    TableConfigValidation(String),

    /// Lock could not be granted (handle already acquired, or retries exhausted)
    #[error("Lock not granted: {0}")]
    NotGranted(String),

    /// Backend error (transport, serialization, throttling, etc.)
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for store-adapter operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by a [`LockStore`](crate::store::LockStore) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The conditional predicate on a write did not hold (record appeared,
    /// was renewed, stolen, or deleted since last observed)
    #[error("Conditional check failed")]
    ConditionalCheckFailed,

    /// Any other backend error, propagated verbatim
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("Serialization error: {}", err))
    }
}
