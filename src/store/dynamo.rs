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

//! DynamoDB store adapter.
//!
//! ## Purpose
//! Shapes the five lock-plane operations into conditional single-item writes
//! against an existing DynamoDB table. The client is supplied externally;
//! table provisioning and teardown are not this crate's concern.
//!
//! ## Conditional-expression surface
//! ```text
//! create: attribute_not_exists(#pk) AND attribute_not_exists(#sk)
//! steal:  attribute_exists(#pk) AND attribute_exists(#sk)
//!           AND recordVersionNumber = :existing_version
//! renew:  attribute_exists(#pk) AND attribute_exists(#sk)
//!           AND recordVersionNumber = :old_version AND ownerName = :owner
//! delete: attribute_exists(#pk) AND attribute_exists(#sk)
//!           AND recordVersionNumber = :version AND ownerName = :owner
//! ```
//! Reads use `consistent_read(true)`. Key attribute names come from the
//! table descriptor and are bound through expression attribute names.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::{StoreError, StoreResult};
use crate::lock::Lock;
use crate::store::{LockRecord, LockStore};
use crate::table::{
    TableSchema, ATTR_ADDITIONAL_ATTRIBUTES, ATTR_LAST_UPDATED_TIME_IN_MS,
    ATTR_LEASE_DURATION_IN_MS, ATTR_OWNER_NAME, ATTR_RECORD_VERSION_NUMBER,
};

/// DynamoDB-backed [`LockStore`].
///
/// ## Example
/// ```rust,no_run
/// use dynamutex::store::dynamo::DynamoLockStore;
/// use dynamutex::table::TableSchema;
///
/// # async fn example() {
/// let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
/// let client = aws_sdk_dynamodb::Client::new(&config);
/// let store = DynamoLockStore::new(client, TableSchema::new("locks"));
/// # }
/// ```
#[derive(Clone)]
pub struct DynamoLockStore {
    client: DynamoDbClient,
    schema: TableSchema,
}

impl DynamoLockStore {
    /// Wrap an externally configured client and a validated table descriptor.
    pub fn new(client: DynamoDbClient, schema: TableSchema) -> Self {
        Self { client, schema }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn key_attributes(&self, lock_group: &str, lock_id: &str) -> [(String, AttributeValue); 2] {
        [
            (
                self.schema.partition_key().to_string(),
                AttributeValue::S(lock_id.to_string()),
            ),
            (
                self.schema.sort_key().to_string(),
                AttributeValue::S(lock_group.to_string()),
            ),
        ]
    }

    /// The version token staged by `attempt_locking`; its absence is a
    /// programming error inside the coordinator, not a user condition.
    fn pending_version(lock: &Lock) -> StoreResult<String> {
        lock.record_version_number()
            .ok_or_else(|| StoreError::Backend("lock handle has no pending version token".to_string()))
    }

    fn pending_write_time(lock: &Lock) -> StoreResult<i64> {
        lock.last_updated_time_ms()
            .ok_or_else(|| StoreError::Backend("lock handle has no pending write time".to_string()))
    }

    fn item_to_record(item: &HashMap<String, AttributeValue>) -> StoreResult<LockRecord> {
        let owner_name = item
            .get(ATTR_OWNER_NAME)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StoreError::Backend(format!("missing {} attribute", ATTR_OWNER_NAME)))?
            .to_string();

        let record_version_number = item
            .get(ATTR_RECORD_VERSION_NUMBER)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| {
                StoreError::Backend(format!("missing {} attribute", ATTR_RECORD_VERSION_NUMBER))
            })?
            .to_string();

        let last_updated_time_ms = item
            .get(ATTR_LAST_UPDATED_TIME_IN_MS)
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                StoreError::Backend(format!(
                    "missing or invalid {} attribute",
                    ATTR_LAST_UPDATED_TIME_IN_MS
                ))
            })?;

        let lease_duration_ms = item
            .get(ATTR_LEASE_DURATION_IN_MS)
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                StoreError::Backend(format!(
                    "missing or invalid {} attribute",
                    ATTR_LEASE_DURATION_IN_MS
                ))
            })?;

        let additional_attributes = match item.get(ATTR_ADDITIONAL_ATTRIBUTES) {
            Some(AttributeValue::M(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), attribute_to_json(v)))
                .collect(),
            _ => HashMap::new(),
        };

        Ok(LockRecord {
            owner_name,
            record_version_number,
            last_updated_time_ms,
            lease_duration_ms,
            additional_attributes,
        })
    }
}

#[async_trait]
impl LockStore for DynamoLockStore {
    #[instrument(skip(self), fields(table = %self.schema.table_name()))]
    async fn get_lock(
        &self,
        lock_group: &str,
        lock_id: &str,
    ) -> StoreResult<Option<LockRecord>> {
        let start = Instant::now();
        let mut request = self
            .client
            .get_item()
            .table_name(self.schema.table_name())
            .consistent_read(true);
        for (name, value) in self.key_attributes(lock_group, lock_id) {
            request = request.key(name, value);
        }

        let result = request.send().await.map_err(|e| {
            metrics::counter!("dynamutex_ddb_errors_total", "op" => "get").increment(1);
            StoreError::Backend(format!("DynamoDB get_item failed: {}", e))
        })?;

        metrics::histogram!("dynamutex_ddb_duration_seconds", "op" => "get")
            .record(start.elapsed().as_secs_f64());

        match result.item() {
            Some(item) => {
                let record = Self::item_to_record(item)?;
                debug!(
                    lock_group = %lock_group,
                    lock_id = %lock_id,
                    owner = %record.owner_name,
                    version = %record.record_version_number,
                    "read lock record"
                );
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, lock), fields(uid = %lock.unique_identifier()))]
    async fn create_lock(&self, lock: &Lock) -> StoreResult<()> {
        let start = Instant::now();
        let version = Self::pending_version(lock)?;
        let when_ms = Self::pending_write_time(lock)?;

        let mut request = self
            .client
            .put_item()
            .table_name(self.schema.table_name())
            .condition_expression("attribute_not_exists(#pk) AND attribute_not_exists(#sk)")
            .expression_attribute_names("#pk", self.schema.partition_key())
            .expression_attribute_names("#sk", self.schema.sort_key());

        for (name, value) in self.key_attributes(lock.lock_group(), lock.lock_id()) {
            request = request.item(name, value);
        }
        request = request
            .item(ATTR_OWNER_NAME, AttributeValue::S(lock.owner_name().to_string()))
            .item(ATTR_RECORD_VERSION_NUMBER, AttributeValue::S(version))
            .item(
                ATTR_LAST_UPDATED_TIME_IN_MS,
                AttributeValue::N(when_ms.to_string()),
            )
            .item(
                ATTR_LEASE_DURATION_IN_MS,
                AttributeValue::N(lock.lease_duration_ms().to_string()),
            )
            .item(
                ATTR_ADDITIONAL_ATTRIBUTES,
                json_map_to_attribute(lock.additional_attributes()),
            );
        if let Some(ttl_key) = self.schema.ttl_key() {
            request = request.item(
                ttl_key,
                AttributeValue::N(self.schema.ttl_epoch_seconds(when_ms).to_string()),
            );
        }

        match request.send().await {
            Ok(_) => {
                metrics::histogram!("dynamutex_ddb_duration_seconds", "op" => "create")
                    .record(start.elapsed().as_secs_f64());
                metrics::counter!("dynamutex_ddb_writes_total", "op" => "create").increment(1);
                debug!(uid = %lock.unique_identifier(), "created lock record");
                Ok(())
            }
            Err(e) => {
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    metrics::counter!("dynamutex_ddb_conditional_failures_total", "op" => "create")
                        .increment(1);
                    Err(StoreError::ConditionalCheckFailed)
                } else {
                    metrics::counter!("dynamutex_ddb_errors_total", "op" => "create").increment(1);
                    Err(StoreError::Backend(format!("DynamoDB put_item failed: {}", e)))
                }
            }
        }
    }

    #[instrument(skip(self, lock), fields(uid = %lock.unique_identifier()))]
    async fn renew_lock(&self, lock: &Lock, new_version: &str, now_ms: i64) -> StoreResult<()> {
        let start = Instant::now();
        let old_version = Self::pending_version(lock)?;

        let mut update_expression = format!(
            "SET {} = :new_version, {} = :now",
            ATTR_RECORD_VERSION_NUMBER, ATTR_LAST_UPDATED_TIME_IN_MS
        );
        let mut request = self
            .client
            .update_item()
            .table_name(self.schema.table_name())
            .condition_expression(format!(
                "attribute_exists(#pk) AND attribute_exists(#sk) \
                 AND {} = :old_version AND {} = :owner",
                ATTR_RECORD_VERSION_NUMBER, ATTR_OWNER_NAME
            ))
            .expression_attribute_names("#pk", self.schema.partition_key())
            .expression_attribute_names("#sk", self.schema.sort_key())
            .expression_attribute_values(":new_version", AttributeValue::S(new_version.to_string()))
            .expression_attribute_values(":now", AttributeValue::N(now_ms.to_string()))
            .expression_attribute_values(":old_version", AttributeValue::S(old_version))
            .expression_attribute_values(
                ":owner",
                AttributeValue::S(lock.owner_name().to_string()),
            );
        for (name, value) in self.key_attributes(lock.lock_group(), lock.lock_id()) {
            request = request.key(name, value);
        }
        if let Some(ttl_key) = self.schema.ttl_key() {
            update_expression.push_str(", #ttl = :ttl");
            request = request
                .expression_attribute_names("#ttl", ttl_key)
                .expression_attribute_values(
                    ":ttl",
                    AttributeValue::N(self.schema.ttl_epoch_seconds(now_ms).to_string()),
                );
        }
        request = request.update_expression(update_expression);

        match request.send().await {
            Ok(_) => {
                metrics::histogram!("dynamutex_ddb_duration_seconds", "op" => "renew")
                    .record(start.elapsed().as_secs_f64());
                metrics::counter!("dynamutex_ddb_writes_total", "op" => "renew").increment(1);
                debug!(uid = %lock.unique_identifier(), version = %new_version, "renewed lock record");
                Ok(())
            }
            Err(e) => {
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    metrics::counter!("dynamutex_ddb_conditional_failures_total", "op" => "renew")
                        .increment(1);
                    warn!(uid = %lock.unique_identifier(), "renewal predicate failed");
                    Err(StoreError::ConditionalCheckFailed)
                } else {
                    metrics::counter!("dynamutex_ddb_errors_total", "op" => "renew").increment(1);
                    Err(StoreError::Backend(format!("DynamoDB update_item failed: {}", e)))
                }
            }
        }
    }

    #[instrument(skip(self, existing, lock), fields(uid = %lock.unique_identifier()))]
    async fn steal_lock(&self, existing: &LockRecord, lock: &Lock) -> StoreResult<()> {
        let start = Instant::now();
        let version = Self::pending_version(lock)?;
        let when_ms = Self::pending_write_time(lock)?;

        let mut update_expression = format!(
            "SET {} = :version, {} = :owner, {} = :now, {} = :lease, {} = :attrs",
            ATTR_RECORD_VERSION_NUMBER,
            ATTR_OWNER_NAME,
            ATTR_LAST_UPDATED_TIME_IN_MS,
            ATTR_LEASE_DURATION_IN_MS,
            ATTR_ADDITIONAL_ATTRIBUTES
        );
        let mut request = self
            .client
            .update_item()
            .table_name(self.schema.table_name())
            .condition_expression(format!(
                "attribute_exists(#pk) AND attribute_exists(#sk) AND {} = :existing_version",
                ATTR_RECORD_VERSION_NUMBER
            ))
            .expression_attribute_names("#pk", self.schema.partition_key())
            .expression_attribute_names("#sk", self.schema.sort_key())
            .expression_attribute_values(":version", AttributeValue::S(version))
            .expression_attribute_values(":owner", AttributeValue::S(lock.owner_name().to_string()))
            .expression_attribute_values(":now", AttributeValue::N(when_ms.to_string()))
            .expression_attribute_values(
                ":lease",
                AttributeValue::N(lock.lease_duration_ms().to_string()),
            )
            .expression_attribute_values(":attrs", json_map_to_attribute(lock.additional_attributes()))
            .expression_attribute_values(
                ":existing_version",
                AttributeValue::S(existing.record_version_number.clone()),
            );
        for (name, value) in self.key_attributes(lock.lock_group(), lock.lock_id()) {
            request = request.key(name, value);
        }
        if let Some(ttl_key) = self.schema.ttl_key() {
            update_expression.push_str(", #ttl = :ttl");
            request = request
                .expression_attribute_names("#ttl", ttl_key)
                .expression_attribute_values(
                    ":ttl",
                    AttributeValue::N(self.schema.ttl_epoch_seconds(when_ms).to_string()),
                );
        }
        request = request.update_expression(update_expression);

        match request.send().await {
            Ok(_) => {
                metrics::histogram!("dynamutex_ddb_duration_seconds", "op" => "steal")
                    .record(start.elapsed().as_secs_f64());
                metrics::counter!("dynamutex_ddb_writes_total", "op" => "steal").increment(1);
                debug!(
                    uid = %lock.unique_identifier(),
                    previous_owner = %existing.owner_name,
                    "replaced lock record"
                );
                Ok(())
            }
            Err(e) => {
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    metrics::counter!("dynamutex_ddb_conditional_failures_total", "op" => "steal")
                        .increment(1);
                    Err(StoreError::ConditionalCheckFailed)
                } else {
                    metrics::counter!("dynamutex_ddb_errors_total", "op" => "steal").increment(1);
                    Err(StoreError::Backend(format!("DynamoDB update_item failed: {}", e)))
                }
            }
        }
    }

    #[instrument(skip(self, lock), fields(uid = %lock.unique_identifier()))]
    async fn delete_lock(&self, lock: &Lock) -> StoreResult<()> {
        let start = Instant::now();
        let version = Self::pending_version(lock)?;

        let mut request = self
            .client
            .delete_item()
            .table_name(self.schema.table_name())
            .condition_expression(format!(
                "attribute_exists(#pk) AND attribute_exists(#sk) \
                 AND {} = :version AND {} = :owner",
                ATTR_RECORD_VERSION_NUMBER, ATTR_OWNER_NAME
            ))
            .expression_attribute_names("#pk", self.schema.partition_key())
            .expression_attribute_names("#sk", self.schema.sort_key())
            .expression_attribute_values(":version", AttributeValue::S(version))
            .expression_attribute_values(
                ":owner",
                AttributeValue::S(lock.owner_name().to_string()),
            );
        for (name, value) in self.key_attributes(lock.lock_group(), lock.lock_id()) {
            request = request.key(name, value);
        }

        match request.send().await {
            Ok(_) => {
                metrics::histogram!("dynamutex_ddb_duration_seconds", "op" => "delete")
                    .record(start.elapsed().as_secs_f64());
                metrics::counter!("dynamutex_ddb_writes_total", "op" => "delete").increment(1);
                debug!(uid = %lock.unique_identifier(), "deleted lock record");
                Ok(())
            }
            Err(e) => {
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    metrics::counter!("dynamutex_ddb_conditional_failures_total", "op" => "delete")
                        .increment(1);
                    Err(StoreError::ConditionalCheckFailed)
                } else {
                    metrics::counter!("dynamutex_ddb_errors_total", "op" => "delete").increment(1);
                    Err(StoreError::Backend(format!("DynamoDB delete_item failed: {}", e)))
                }
            }
        }
    }
}

fn json_map_to_attribute(map: &HashMap<String, Value>) -> AttributeValue {
    AttributeValue::M(
        map.iter()
            .map(|(k, v)| (k.clone(), json_to_attribute(v)))
            .collect(),
    )
}

fn json_to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(json_to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_attribute(v)))
                .collect(),
        ),
    }
}

fn attribute_to_json(attr: &AttributeValue) -> Value {
    match attr {
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::N(n) => serde_json::from_str(n).unwrap_or_else(|_| Value::String(n.clone())),
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::L(items) => Value::Array(items.iter().map(attribute_to_json).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attribute_to_json(v)))
                .collect(),
        ),
        // Set and binary types are never written by this crate.
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_attribute_round_trip() {
        let value = json!({
            "task": "compaction",
            "attempt": 3,
            "urgent": true,
            "tags": ["a", "b"],
            "nested": {"depth": 2},
            "none": null
        });
        let attr = json_to_attribute(&value);
        assert_eq!(attribute_to_json(&attr), value);
    }

    #[test]
    fn test_numeric_attribute_parses() {
        assert_eq!(attribute_to_json(&AttributeValue::N("42".to_string())), json!(42));
        assert_eq!(
            attribute_to_json(&AttributeValue::N("1.5".to_string())),
            json!(1.5)
        );
    }
}
