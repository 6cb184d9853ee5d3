//! Key-value persistence for small client-side records (auth tokens, token
//! lists). Values are JSON documents; every write is announced to subscribers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{PaymentError, PaymentResult};

/// A write to `key`; `value` is `None` when the key was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
	pub key: String,
	pub value: Option<Value>,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
	async fn get(&self, key: &str) -> PaymentResult<Option<Value>>;

	/// Stores `value`, or removes the key when `None`.
	async fn set(&self, key: &str, value: Option<Value>) -> PaymentResult<()>;

	fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// Reads `key` as `T`. A value that no longer matches `T` reads as absent.
pub async fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> PaymentResult<Option<T>> {
	let Some(value) = store.get(key).await? else {
		return Ok(None);
	};
	match serde_json::from_value(value) {
		Ok(v) => Ok(Some(v)),
		Err(e) => {
			warn!(key, error = %e, "discarding malformed stored value");
			Ok(None)
		}
	}
}

pub async fn set_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> PaymentResult<()> {
	let value = serde_json::to_value(value).map_err(|e| PaymentError::Internal(format!("serialize {key}: {e}")))?;
	store.set(key, Some(value)).await
}

#[derive(Clone)]
pub struct MemoryStore {
	values: Arc<RwLock<HashMap<String, Value>>>,
	changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
	pub fn new(capacity: usize) -> Self {
		let (changes, _) = broadcast::channel(capacity);
		Self { values: Arc::new(RwLock::new(HashMap::new())), changes }
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new(64)
	}
}

#[async_trait]
impl KeyValueStore for MemoryStore {
	async fn get(&self, key: &str) -> PaymentResult<Option<Value>> {
		let values = self.values.read().map_err(|_| PaymentError::Internal("store lock poisoned".to_string()))?;
		Ok(values.get(key).cloned())
	}

	async fn set(&self, key: &str, value: Option<Value>) -> PaymentResult<()> {
		{
			let mut values = self.values.write().map_err(|_| PaymentError::Internal("store lock poisoned".to_string()))?;
			match &value {
				Some(v) => values.insert(key.to_string(), v.clone()),
				None => values.remove(key),
			};
		}
		let _ = self.changes.send(StoreChange { key: key.to_string(), value });
		Ok(())
	}

	fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
		self.changes.subscribe()
	}
}

/// Redis-backed store. Change notifications reach subscribers in this process only.
#[derive(Clone)]
pub struct RedisStore {
	client: Arc<Client>,
	prefix: String,
	changes: broadcast::Sender<StoreChange>,
}

impl RedisStore {
	pub fn new(redis_url: &str, prefix: &str) -> Result<Self, redis::RedisError> {
		let client = Client::open(redis_url)?;
		let (changes, _) = broadcast::channel(64);
		Ok(Self { client: Arc::new(client), prefix: prefix.to_string(), changes })
	}

	fn key(&self, key: &str) -> String {
		format!("{}:{}", self.prefix, key)
	}
}

#[async_trait]
impl KeyValueStore for RedisStore {
	async fn get(&self, key: &str) -> PaymentResult<Option<Value>> {
		let mut conn = match self.client.get_async_connection().await {
			Ok(conn) => conn,
			Err(e) => {
				warn!("Redis connection error: {}", e);
				return Ok(None);
			}
		};
		let raw = match conn.get::<_, Option<String>>(self.key(key)).await {
			Ok(raw) => raw,
			Err(e) => {
				warn!("Redis get error: {}", e);
				return Ok(None);
			}
		};
		Ok(raw.and_then(|s| match serde_json::from_str(&s) {
			Ok(v) => Some(v),
			Err(e) => {
				warn!(key, error = %e, "stored value is not json");
				None
			}
		}))
	}

	async fn set(&self, key: &str, value: Option<Value>) -> PaymentResult<()> {
		let mut conn = self
			.client
			.get_async_connection()
			.await
			.map_err(|e| PaymentError::Internal(format!("Redis connection error: {e}")))?;
		let result = match &value {
			Some(v) => conn.set::<_, _, ()>(self.key(key), v.to_string()).await,
			None => conn.del::<_, ()>(self.key(key)).await,
		};
		if let Err(e) = result {
			warn!("Redis set error: {}", e);
			return Err(PaymentError::Internal(format!("Redis set error: {e}")));
		}
		let _ = self.changes.send(StoreChange { key: key.to_string(), value });
		Ok(())
	}

	fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
		self.changes.subscribe()
	}
}
