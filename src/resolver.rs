//! Dual-ledger account state for one (owner, mint) pair.
//!
//! The base ledger holds the owner's token account, the rollup record (whose
//! owner program tells whether the pair is delegated) and the permission
//! record. While delegated, the live balance is the token account as seen by
//! the rollup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Serialize, Serializer};
use solana_sdk::{account::Account, pubkey::Pubkey};
use tracing::{debug, warn};

use crate::error::{PaymentError, PaymentResult};
use crate::instructions::InstructionFactory;
use crate::ledger::{AccountCallback, Ledger, Ledgers};
use crate::records::{token_amount, RollupRecord};
use crate::subscription::{lock, ListenerId, SubscriptionRegistry};

fn base58<S: Serializer>(key: &Pubkey, s: S) -> Result<S::Ok, S::Error> {
	s.collect_str(key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenAccountState {
	#[serde(serialize_with = "base58")]
	pub owner: Pubkey,
	#[serde(serialize_with = "base58")]
	pub mint: Pubkey,
	#[serde(serialize_with = "base58")]
	pub base_account: Pubkey,
	#[serde(serialize_with = "base58")]
	pub rollup_account: Pubkey,
	#[serde(serialize_with = "base58")]
	pub permission: Pubkey,
	pub base_account_exists: bool,
	/// Wallet token balance on the base ledger.
	pub base_balance: Option<u64>,
	pub rollup_record_exists: bool,
	/// Custody recorded in the base-side rollup record.
	pub deposit_balance: Option<u64>,
	pub is_delegated: bool,
	/// Token balance as seen by the rollup; only meaningful while delegated.
	pub rollup_balance: Option<u64>,
	pub permission_exists: bool,
	pub is_permission_delegated: bool,
}

impl TokenAccountState {
	pub fn new(factory: &InstructionFactory, owner: Pubkey, mint: Pubkey) -> Self {
		let base_account = factory.base_account(&owner, &mint);
		let (rollup_account, _) = factory.rollup_account(&owner, &mint);
		let (permission, _) = factory.permission(&rollup_account);
		Self {
			owner,
			mint,
			base_account,
			rollup_account,
			permission,
			base_account_exists: false,
			base_balance: None,
			rollup_record_exists: false,
			deposit_balance: None,
			is_delegated: false,
			rollup_balance: None,
			permission_exists: false,
			is_permission_delegated: false,
		}
	}

	pub fn access_denied(&self) -> bool {
		self.is_delegated && self.rollup_balance.is_none()
	}

	/// The custody balance currently authoritative: rollup while delegated,
	/// the base record otherwise.
	pub fn effective_balance(&self) -> Option<u64> {
		if self.is_delegated {
			self.rollup_balance
		} else {
			self.deposit_balance
		}
	}

	/// Custody plus wallet balance, i.e. what a transfer may draw on.
	pub fn spendable(&self) -> u64 {
		self.effective_balance().unwrap_or(0).saturating_add(self.base_balance.unwrap_or(0))
	}

	/// True when nothing is missing on the base ledger for the pair to be delegated.
	pub fn is_scaffolded(&self) -> bool {
		self.base_account_exists && self.rollup_record_exists && self.permission_exists && self.is_permission_delegated
	}

	fn apply_base_account(&mut self, account: Option<&Account>) -> PaymentResult<()> {
		self.base_account_exists = account.is_some();
		self.base_balance = if account.is_some() { None } else { Some(0) };
		if let Some(acc) = account {
			self.base_balance = Some(token_amount(&self.base_account, acc)?);
		}
		Ok(())
	}

	fn apply_rollup_record(&mut self, account: Option<&Account>, delegation_program: &Pubkey) -> PaymentResult<()> {
		let Some(acc) = account else {
			self.rollup_record_exists = false;
			self.is_delegated = false;
			self.deposit_balance = Some(0);
			return Ok(());
		};
		self.rollup_record_exists = true;
		self.is_delegated = acc.owner == *delegation_program;
		self.deposit_balance = None;
		let record = RollupRecord::unpack(&self.rollup_account, &acc.data)?;
		self.deposit_balance = Some(record.amount);
		Ok(())
	}

	fn apply_permission(&mut self, account: Option<&Account>, delegation_program: &Pubkey) {
		self.permission_exists = account.is_some();
		self.is_permission_delegated = account.is_some_and(|acc| acc.owner == *delegation_program);
	}

	fn apply_rollup_account(&mut self, account: Option<&Account>) -> PaymentResult<()> {
		self.rollup_balance = None;
		if let Some(acc) = account {
			self.rollup_balance = Some(token_amount(&self.base_account, acc)?);
		}
		Ok(())
	}
}

/// Per-mint custodial vault backing rollup balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultState {
	#[serde(serialize_with = "base58")]
	pub vault: Pubkey,
	pub vault_exists: bool,
	#[serde(serialize_with = "base58")]
	pub token_account: Pubkey,
	pub token_account_exists: bool,
	pub balance: Option<u64>,
}

pub type StateCallback = Arc<dyn Fn(&TokenAccountState) + Send + Sync>;

pub struct AccountResolver {
	ledgers: Ledgers,
	factory: Arc<InstructionFactory>,
	registry: Arc<SubscriptionRegistry>,
}

impl AccountResolver {
	pub fn new(ledgers: Ledgers, factory: Arc<InstructionFactory>, registry: Arc<SubscriptionRegistry>) -> Self {
		Self { ledgers, factory, registry }
	}

	pub fn factory(&self) -> &Arc<InstructionFactory> {
		&self.factory
	}

	/// Best-effort resolution; unreadable or undecodable fields come back as `None`.
	pub async fn resolve(&self, owner: Pubkey, mint: Pubkey) -> TokenAccountState {
		let (state, err) = self.fetch(owner, mint).await;
		if let Some(e) = err {
			debug!(%owner, %mint, error = %e, "degraded account resolution");
		}
		state
	}

	/// Like [`resolve`](Self::resolve) but surfaces connectivity and decode failures.
	pub async fn try_resolve(&self, owner: Pubkey, mint: Pubkey) -> PaymentResult<TokenAccountState> {
		match self.fetch(owner, mint).await {
			(state, None) => Ok(state),
			(_, Some(e)) => Err(e),
		}
	}

	async fn fetch(&self, owner: Pubkey, mint: Pubkey) -> (TokenAccountState, Option<PaymentError>) {
		let mut state = TokenAccountState::new(&self.factory, owner, mint);
		let delegation_program = self.factory.program_ids().delegation_program;
		let addresses = [state.base_account, state.rollup_account, state.permission];
		let accounts = match self.ledgers.base.get_accounts(&addresses).await {
			Ok(accounts) if accounts.len() == addresses.len() => accounts,
			Ok(accounts) => {
				let reason = format!("expected {} accounts, got {}", addresses.len(), accounts.len());
				return (state, Some(PaymentError::decode(&owner, reason)));
			}
			Err(e) => return (state, Some(e)),
		};

		let mut first_err = None;
		if let Err(e) = state.apply_base_account(accounts[0].as_ref()) {
			first_err.get_or_insert(e);
		}
		if let Err(e) = state.apply_rollup_record(accounts[1].as_ref(), &delegation_program) {
			first_err.get_or_insert(e);
		}
		state.apply_permission(accounts[2].as_ref(), &delegation_program);

		if state.is_delegated {
			// An unreadable rollup account means the permission is not visible yet.
			match self.ledgers.rollup.get_account(&state.base_account).await {
				Ok(account) => {
					if let Err(e) = state.apply_rollup_account(account.as_ref()) {
						first_err.get_or_insert(e);
					}
				}
				Err(e) => debug!(%owner, %mint, error = %e, "rollup account unreadable"),
			}
		}
		(state, first_err)
	}

	pub async fn resolve_vault(&self, mint: Pubkey) -> PaymentResult<VaultState> {
		let (vault, _) = self.factory.vault(&mint);
		let token_account = self.factory.vault_token_account(&mint);
		let accounts = self.ledgers.base.get_accounts(&[vault, token_account]).await?;
		let vault_acc = accounts.first().cloned().flatten();
		let token_acc = accounts.get(1).cloned().flatten();
		let balance = match &token_acc {
			Some(acc) => Some(token_amount(&token_account, acc)?),
			None => None,
		};
		Ok(VaultState {
			vault,
			vault_exists: vault_acc.is_some(),
			token_account,
			token_account_exists: token_acc.is_some(),
			balance,
		})
	}

	/// Tracks (owner, mint) continuously. `on_change` receives the initial
	/// state and every subsequent change; it stops firing once the returned
	/// watch is cancelled or dropped.
	///
	/// Subscriptions open before the initial read. Notifications arriving in
	/// between are replayed on top of the read, so no change is lost.
	pub async fn watch(&self, owner: Pubkey, mint: Pubkey, on_change: StateCallback) -> PaymentResult<AccountWatch> {
		let blank = TokenAccountState::new(&self.factory, owner, mint);
		let (base_account, rollup_account, permission) = (blank.base_account, blank.rollup_account, blank.permission);
		let cell = Arc::new(StdMutex::new(WatchCell { state: blank, backlog: Some(Vec::new()) }));
		let active = Arc::new(AtomicBool::new(true));

		let delegation_program = self.factory.program_ids().delegation_program;
		let targets: Vec<(Ledger, Pubkey, Applier)> = vec![
			(Ledger::Base, base_account, applier(|state, acc| state.apply_base_account(Some(acc)))),
			(Ledger::Rollup, base_account, applier(|state, acc| state.apply_rollup_account(Some(acc)))),
			(
				Ledger::Base,
				rollup_account,
				applier(move |state, acc| state.apply_rollup_record(Some(acc), &delegation_program)),
			),
			(
				Ledger::Base,
				permission,
				applier(move |state, acc| {
					state.apply_permission(Some(acc), &delegation_program);
					Ok(())
				}),
			),
		];

		let mut listeners = Vec::with_capacity(targets.len());
		for (ledger, address, apply) in targets {
			match self.registry.listen(ledger, address, updater(&cell, &active, &on_change, apply)).await {
				Ok(id) => listeners.push(id),
				Err(e) => {
					active.store(false, Ordering::SeqCst);
					for id in listeners {
						self.registry.release(id).await;
					}
					return Err(e);
				}
			}
		}

		let resolved = self.resolve(owner, mint).await;
		{
			let mut cell = lock(&cell);
			cell.state = resolved;
			let backlog = cell.backlog.take().unwrap_or_default();
			if !backlog.is_empty() {
				debug!(%owner, %mint, pending = backlog.len(), "replaying notifications received during the initial read");
			}
			for (apply, account) in backlog {
				if let Err(e) = apply(&mut cell.state, &account) {
					warn!(%owner, error = %e, "undecodable account notification");
				}
			}
			// Held so that no change is reported ahead of the initial state.
			on_change(&cell.state);
		}
		Ok(AccountWatch { cell, active, listeners, registry: self.registry.clone() })
	}
}

type Applier = Arc<dyn Fn(&mut TokenAccountState, &Account) -> PaymentResult<()> + Send + Sync>;

fn applier<F>(apply: F) -> Applier
where
	F: Fn(&mut TokenAccountState, &Account) -> PaymentResult<()> + Send + Sync + 'static,
{
	Arc::new(apply)
}

struct WatchCell {
	state: TokenAccountState,
	/// Notifications queued until the initial read lands; `None` once seeded.
	backlog: Option<Vec<(Applier, Account)>>,
}

fn updater(
	cell: &Arc<StdMutex<WatchCell>>,
	active: &Arc<AtomicBool>,
	on_change: &StateCallback,
	apply: Applier,
) -> AccountCallback {
	let cell = cell.clone();
	let active = active.clone();
	let on_change = on_change.clone();
	Arc::new(move |account: Account| {
		if !active.load(Ordering::SeqCst) {
			return;
		}
		let changed = {
			let mut cell = lock(&cell);
			if let Some(backlog) = cell.backlog.as_mut() {
				backlog.push((apply.clone(), account));
				return;
			}
			let before = cell.state.clone();
			if let Err(e) = apply(&mut cell.state, &account) {
				warn!(owner = %cell.state.owner, error = %e, "undecodable account notification");
			}
			(cell.state != before).then(|| cell.state.clone())
		};
		if let Some(snapshot) = changed {
			on_change(&snapshot);
		}
	})
}

/// A live view of one (owner, mint) pair.
pub struct AccountWatch {
	cell: Arc<StdMutex<WatchCell>>,
	active: Arc<AtomicBool>,
	listeners: Vec<ListenerId>,
	registry: Arc<SubscriptionRegistry>,
}

impl AccountWatch {
	pub fn current(&self) -> TokenAccountState {
		lock(&self.cell).state.clone()
	}

	pub async fn cancel(mut self) {
		self.active.store(false, Ordering::SeqCst);
		for id in std::mem::take(&mut self.listeners) {
			self.registry.release(id).await;
		}
	}
}

impl Drop for AccountWatch {
	fn drop(&mut self) {
		self.active.store(false, Ordering::SeqCst);
		if self.listeners.is_empty() {
			return;
		}
		let listeners = std::mem::take(&mut self.listeners);
		let registry = self.registry.clone();
		match tokio::runtime::Handle::try_current() {
			Ok(handle) => {
				handle.spawn(async move {
					for id in listeners {
						registry.release(id).await;
					}
				});
			}
			Err(_) => warn!(count = listeners.len(), "account watch dropped outside a runtime; subscriptions leaked"),
		}
	}
}
