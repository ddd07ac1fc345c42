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

//! Lock table descriptor.
//!
//! ## Table Schema
//! ```text
//! Partition Key: lockId    (String, configurable name)
//! Sort Key:      lockGroup (String, configurable name)
//! Attributes:
//!   - ownerName: String (coordinator instance that last wrote the record)
//!   - recordVersionNumber: String (UUID, replaced on every write)
//!   - lastUpdatedTimeInMs: Number (writer's local clock, ms since epoch)
//!   - leaseDurationInMs: Number
//!   - additionalAttributes: Map (caller payload, opaque)
//!   - <ttl key>: Number (seconds since epoch, optional hygiene attribute)
//! ```
//!
//! The TTL attribute only lets the backend evict orphaned records; lease
//! expiry is always decided from `lastUpdatedTimeInMs + leaseDurationInMs`.

use crate::error::{LockError, LockResult};

/// Persisted attribute: owner of the record.
pub const ATTR_OWNER_NAME: &str = "ownerName";
/// Persisted attribute: optimistic-concurrency token.
pub const ATTR_RECORD_VERSION_NUMBER: &str = "recordVersionNumber";
/// Persisted attribute: write timestamp in milliseconds.
pub const ATTR_LAST_UPDATED_TIME_IN_MS: &str = "lastUpdatedTimeInMs";
/// Persisted attribute: declared lease length in milliseconds.
pub const ATTR_LEASE_DURATION_IN_MS: &str = "leaseDurationInMs";
/// Persisted attribute: caller-supplied payload.
pub const ATTR_ADDITIONAL_ATTRIBUTES: &str = "additionalAttributes";

/// Attribute names the key schema may not collide with.
pub const RESERVED_ATTRIBUTE_NAMES: [&str; 5] = [
    ATTR_OWNER_NAME,
    ATTR_RECORD_VERSION_NUMBER,
    ATTR_LAST_UPDATED_TIME_IN_MS,
    ATTR_LEASE_DURATION_IN_MS,
    ATTR_ADDITIONAL_ATTRIBUTES,
];

const DEFAULT_TABLE_NAME: &str = "LockTable";
const DEFAULT_PARTITION_KEY: &str = "lockId";
const DEFAULT_SORT_KEY: &str = "lockGroup";
const DEFAULT_TTL_MS: u64 = 60 * 60 * 1000;

/// Immutable descriptor of the lock table.
///
/// Carries the table name, the configurable key attribute names, and the
/// optional TTL attribute. Setters validate against
/// [`RESERVED_ATTRIBUTE_NAMES`] so the key schema can never shadow the
/// payload the store adapter writes.
#[derive(Debug, Clone)]
pub struct TableSchema {
    table_name: String,
    partition_key: String,
    sort_key: String,
    ttl_key: Option<String>,
    ttl_ms: u64,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            partition_key: DEFAULT_PARTITION_KEY.to_string(),
            sort_key: DEFAULT_SORT_KEY.to_string(),
            ttl_key: None,
            ttl_ms: DEFAULT_TTL_MS,
        }
    }
}

impl TableSchema {
    /// Descriptor with the given table name and default key names.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    /// Override the partition key attribute name.
    pub fn with_partition_key(mut self, name: impl Into<String>) -> LockResult<Self> {
        let name = name.into();
        Self::check_not_reserved(&name, "partition key")?;
        self.partition_key = name;
        Ok(self)
    }

    /// Override the sort key attribute name.
    pub fn with_sort_key(mut self, name: impl Into<String>) -> LockResult<Self> {
        let name = name.into();
        Self::check_not_reserved(&name, "sort key")?;
        self.sort_key = name;
        Ok(self)
    }

    /// Enable the TTL hygiene attribute under the given name.
    pub fn with_ttl_key(mut self, name: impl Into<String>) -> LockResult<Self> {
        let name = name.into();
        Self::check_not_reserved(&name, "TTL key")?;
        self.ttl_key = Some(name);
        Ok(self)
    }

    /// Override the TTL horizon (default one hour).
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn sort_key(&self) -> &str {
        &self.sort_key
    }

    pub fn ttl_key(&self) -> Option<&str> {
        self.ttl_key.as_deref()
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// TTL attribute value for a write issued at `now_ms`: seconds since
    /// epoch, rounded.
    pub fn ttl_epoch_seconds(&self, now_ms: i64) -> i64 {
        ((now_ms + self.ttl_ms as i64) as f64 / 1000.0).round() as i64
    }

    fn check_not_reserved(name: &str, role: &str) -> LockResult<()> {
        if RESERVED_ATTRIBUTE_NAMES.contains(&name) {
            return Err(LockError::TableConfigValidation(format!(
                "{} may not use reserved attribute name '{}'",
                role, name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let schema = TableSchema::default();
        assert_eq!(schema.table_name(), "LockTable");
        assert_eq!(schema.partition_key(), "lockId");
        assert_eq!(schema.sort_key(), "lockGroup");
        assert!(schema.ttl_key().is_none());
        assert_eq!(schema.ttl_ms(), 3_600_000);
    }

    #[test]
    fn test_reserved_partition_key_rejected() {
        for name in RESERVED_ATTRIBUTE_NAMES {
            let result = TableSchema::default().with_partition_key(name);
            assert!(matches!(result, Err(LockError::TableConfigValidation(_))));
        }
    }

    #[test]
    fn test_reserved_sort_key_rejected() {
        let result = TableSchema::default().with_sort_key("ownerName");
        assert!(matches!(result, Err(LockError::TableConfigValidation(_))));
    }

    #[test]
    fn test_reserved_ttl_key_rejected() {
        let result = TableSchema::default().with_ttl_key("leaseDurationInMs");
        assert!(matches!(result, Err(LockError::TableConfigValidation(_))));
    }

    #[test]
    fn test_custom_keys_accepted() {
        let schema = TableSchema::new("my-locks")
            .with_partition_key("pk")
            .unwrap()
            .with_sort_key("sk")
            .unwrap()
            .with_ttl_key("expiresAt")
            .unwrap()
            .with_ttl_ms(120_000);
        assert_eq!(schema.table_name(), "my-locks");
        assert_eq!(schema.partition_key(), "pk");
        assert_eq!(schema.sort_key(), "sk");
        assert_eq!(schema.ttl_key(), Some("expiresAt"));
        assert_eq!(schema.ttl_ms(), 120_000);
    }

    #[test]
    fn test_ttl_epoch_seconds_rounds() {
        let schema = TableSchema::default().with_ttl_ms(1_000);
        // 1_500 ms + 1_000 ms = 2_500 ms -> rounds to 3 s
        assert_eq!(schema.ttl_epoch_seconds(1_500), 3);
        // 1_400 ms + 1_000 ms = 2_400 ms -> rounds to 2 s
        assert_eq!(schema.ttl_epoch_seconds(1_400), 2);
    }
}
