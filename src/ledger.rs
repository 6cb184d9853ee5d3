use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_sdk::{account::Account, commitment_config::CommitmentConfig, hash::Hash, pubkey::Pubkey, signature::Signature};

use crate::error::PaymentResult;

/// The two ledgers a token balance can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ledger {
	/// Durable settlement chain of record.
	Base,
	/// Ephemeral rollup that delegated accounts execute on.
	Rollup,
}

impl Ledger {
	pub const ALL: [Ledger; 2] = [Ledger::Base, Ledger::Rollup];

	pub fn as_str(&self) -> &'static str {
		match self {
			Ledger::Base => "base",
			Ledger::Rollup => "rollup",
		}
	}
}

impl fmt::Display for Ledger {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Invoked with the full account every time the ledger reports a change.
pub type AccountCallback = Arc<dyn Fn(Account) + Send + Sync>;
/// Invoked with the slot number on every slot tick.
pub type SlotCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Native confirmation outcome of a submitted signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
	Pending,
	Confirmed,
	Failed(String),
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
	fn ledger(&self) -> Ledger;

	async fn get_account(&self, address: &Pubkey) -> PaymentResult<Option<Account>>;

	/// Reads all addresses in one round trip; the result is positionally aligned.
	async fn get_accounts(&self, addresses: &[Pubkey]) -> PaymentResult<Vec<Option<Account>>>;

	async fn subscribe(&self, address: &Pubkey, callback: AccountCallback) -> PaymentResult<SubscriptionHandle>;

	async fn subscribe_slots(&self, callback: SlotCallback) -> PaymentResult<SubscriptionHandle>;

	async fn unsubscribe(&self, handle: SubscriptionHandle);

	async fn send_raw_transaction(&self, bytes: &[u8]) -> PaymentResult<Signature>;

	async fn confirm_transaction(&self, signature: &Signature, commitment: CommitmentConfig) -> PaymentResult<Confirmation>;

	/// Latest blockhash and the last block height at which it is still accepted.
	async fn get_latest_blockhash(&self) -> PaymentResult<(Hash, u64)>;
}

/// Base and rollup clients travelling together.
#[derive(Clone)]
pub struct Ledgers {
	pub base: Arc<dyn LedgerClient>,
	pub rollup: Arc<dyn LedgerClient>,
}

impl Ledgers {
	pub fn new(base: Arc<dyn LedgerClient>, rollup: Arc<dyn LedgerClient>) -> Self {
		Self { base, rollup }
	}

	pub fn client(&self, ledger: Ledger) -> &Arc<dyn LedgerClient> {
		match ledger {
			Ledger::Base => &self.base,
			Ledger::Rollup => &self.rollup,
		}
	}
}
