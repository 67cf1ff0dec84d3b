use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::AttributeValue;

use super::{RateLimitStorage, StorageError};
use crate::services::ratelimit::bucket::TokenBucketState;
use crate::services::ratelimit::types::current_time_secs;

const PK: &str = "pk";
const TOKENS: &str = "tokens";
const CAPACITY: &str = "capacity";
const REFILL_RATE: &str = "refill_rate";
const LAST_REFILL: &str = "last_refill";
/// Epoch seconds; enable DynamoDB TTL on this attribute to reclaim idle buckets.
const EXPIRES_AT: &str = "expires_at";

/// DynamoDB backend: one item per bucket key and time window.
///
/// Items are keyed `{bucket key}#{window index}`, the index being epoch seconds divided
/// by the storage window. A read falls back to the previous window's item so bucket
/// state carries across a window boundary. DynamoDB's own TTL deletion is lazy, so
/// `expires_at` is also checked on read.
#[derive(Debug, Clone)]
pub struct DynamoDbRateLimitStorage {
    client: Client,
    table: String,
    consistent_read: bool,
    window_secs: u64,
}

impl DynamoDbRateLimitStorage {
    pub fn new(
        client: Client,
        table: impl Into<String>,
        consistent_read: bool,
        window: Duration,
    ) -> Self {
        Self {
            client,
            table: table.into(),
            consistent_read,
            window_secs: window.as_secs().max(1),
        }
    }

    /// Build a client from the standard AWS environment (region, credentials chain).
    pub async fn from_env(table: &str, consistent_read: bool, window: Duration) -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&sdk_config), table, consistent_read, window)
    }

    async fn fetch(
        &self,
        item_key: String,
        now_secs: u64,
    ) -> Result<Option<TokenBucketState>, StorageError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(PK, AttributeValue::S(item_key))
            .consistent_read(self.consistent_read)
            .send()
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;

        match output.item() {
            Some(item) => state_from_item(item, now_secs),
            None => Ok(None),
        }
    }
}

fn window_index(now_secs: u64, window_secs: u64) -> u64 {
    now_secs / window_secs.max(1)
}

fn item_key(key: &str, window: u64) -> String {
    format!("{key}#{window}")
}

/// Item keys a read consults, newest first.
fn read_keys(key: &str, now_secs: u64, window_secs: u64) -> Vec<String> {
    let current = window_index(now_secs, window_secs);
    let mut keys = vec![item_key(key, current)];
    if let Some(previous) = current.checked_sub(1) {
        keys.push(item_key(key, previous));
    }
    keys
}

/// Items live until `ttl` past the end of the window they were written in.
fn expiry_for(now_secs: u64, window_secs: u64, ttl: Duration) -> u64 {
    let window_end = window_index(now_secs, window_secs)
        .saturating_add(1)
        .saturating_mul(window_secs.max(1));
    window_end.saturating_add(ttl.as_secs().max(1))
}

fn number(item: &HashMap<String, AttributeValue>, name: &str) -> Result<f64, StorageError> {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|raw| raw.parse::<f64>().ok())
        .ok_or_else(|| StorageError::Serialization(format!("attribute `{name}` missing or not a number")))
}

fn state_from_item(
    item: &HashMap<String, AttributeValue>,
    now_secs: u64,
) -> Result<Option<TokenBucketState>, StorageError> {
    let expires_at = number(item, EXPIRES_AT)? as u64;
    if expires_at <= now_secs {
        return Ok(None);
    }
    Ok(Some(TokenBucketState {
        capacity: number(item, CAPACITY)?,
        refill_rate: number(item, REFILL_RATE)?,
        tokens: number(item, TOKENS)?,
        last_refill: number(item, LAST_REFILL)? as u64,
    }))
}

fn item_from_state(
    item_key: &str,
    state: &TokenBucketState,
    expires_at: u64,
) -> HashMap<String, AttributeValue> {
    HashMap::from([
        (PK.to_string(), AttributeValue::S(item_key.to_string())),
        (TOKENS.to_string(), AttributeValue::N(state.tokens.to_string())),
        (CAPACITY.to_string(), AttributeValue::N(state.capacity.to_string())),
        (REFILL_RATE.to_string(), AttributeValue::N(state.refill_rate.to_string())),
        (LAST_REFILL.to_string(), AttributeValue::N(state.last_refill.to_string())),
        (EXPIRES_AT.to_string(), AttributeValue::N(expires_at.to_string())),
    ])
}

#[async_trait]
impl RateLimitStorage for DynamoDbRateLimitStorage {
    fn backend_name(&self) -> &'static str {
        "dynamodb"
    }

    async fn get(&self, key: &str) -> Result<Option<TokenBucketState>, StorageError> {
        let now_secs = current_time_secs();
        for item_key in read_keys(key, now_secs, self.window_secs) {
            if let Some(state) = self.fetch(item_key, now_secs).await? {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        state: &TokenBucketState,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let now_secs = current_time_secs();
        let item_key = item_key(key, window_index(now_secs, self.window_secs));
        let expires_at = expiry_for(now_secs, self.window_secs, ttl);
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(item_from_state(&item_key, state, expires_at)))
            .send()
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
