use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::PaymentResult;
use crate::store::{get_json, set_json, KeyValueStore, StoreChange};

pub const TOKEN_LIST_KEY: &str = "token-list";
pub const SELECTED_TOKEN_KEY: &str = "selected-token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenListEntry {
	pub mint: String,
	pub creator: String,
}

/// The user's known tokens and the one currently selected.
#[derive(Clone)]
pub struct TokenRegistry {
	store: Arc<dyn KeyValueStore>,
}

impl TokenRegistry {
	pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
		Self { store }
	}

	/// Every store write; filter on [`TOKEN_LIST_KEY`] / [`SELECTED_TOKEN_KEY`].
	pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
		self.store.subscribe()
	}

	pub async fn list(&self) -> PaymentResult<Vec<TokenListEntry>> {
		Ok(get_json(self.store.as_ref(), TOKEN_LIST_KEY).await?.unwrap_or_default())
	}

	pub async fn set_list(&self, tokens: &[TokenListEntry]) -> PaymentResult<()> {
		set_json(self.store.as_ref(), TOKEN_LIST_KEY, &tokens).await
	}

	/// Appends `entry` unless its mint is already listed. Returns whether it was added.
	pub async fn add(&self, entry: TokenListEntry) -> PaymentResult<bool> {
		let mut tokens = self.list().await?;
		if tokens.iter().any(|t| t.mint == entry.mint) {
			return Ok(false);
		}
		info!(mint = %entry.mint, "token added to list");
		tokens.push(entry);
		self.set_list(&tokens).await?;
		Ok(true)
	}

	pub async fn selected(&self) -> PaymentResult<Option<TokenListEntry>> {
		get_json(self.store.as_ref(), SELECTED_TOKEN_KEY).await
	}

	pub async fn select(&self, entry: Option<&TokenListEntry>) -> PaymentResult<()> {
		match entry {
			Some(entry) => set_json(self.store.as_ref(), SELECTED_TOKEN_KEY, entry).await,
			None => self.store.set(SELECTED_TOKEN_KEY, None).await,
		}
	}
}
