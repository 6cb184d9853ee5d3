use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use solana_sdk::pubkey::Pubkey;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::{
	error::PaymentResult,
	resolver::{AccountResolver, AccountWatch, StateCallback, TokenAccountState},
	subscription::lock,
	tokens::{TokenRegistry, TOKEN_LIST_KEY},
};

/// Keeps one account watch per listed token for the wallet and logs
/// effective-balance changes.
pub struct BalanceMonitor {
	resolver: Arc<AccountResolver>,
	tokens: TokenRegistry,
	wallet: Pubkey,
	watches: HashMap<Pubkey, AccountWatch>,
}

impl BalanceMonitor {
	pub fn new(resolver: Arc<AccountResolver>, tokens: TokenRegistry, wallet: Pubkey) -> Self {
		Self { resolver, tokens, wallet, watches: HashMap::new() }
	}

	pub fn watched(&self) -> Vec<Pubkey> {
		let mut mints: Vec<Pubkey> = self.watches.keys().copied().collect();
		mints.sort();
		mints
	}

	pub fn current(&self, mint: &Pubkey) -> Option<TokenAccountState> {
		self.watches.get(mint).map(AccountWatch::current)
	}

	/// Aligns the watch set with the stored token list.
	pub async fn sync(&mut self) -> PaymentResult<()> {
		let mut listed = HashSet::new();
		for entry in self.tokens.list().await? {
			match Pubkey::from_str(&entry.mint) {
				Ok(mint) => {
					listed.insert(mint);
				}
				Err(_) => warn!(mint = %entry.mint, "skipping unparseable token mint"),
			}
		}

		let stale: Vec<Pubkey> = self.watches.keys().filter(|m| !listed.contains(m)).copied().collect();
		for mint in stale {
			if let Some(watch) = self.watches.remove(&mint) {
				watch.cancel().await;
				info!(%mint, "stopped watching token");
			}
		}

		for mint in listed {
			if self.watches.contains_key(&mint) {
				continue;
			}
			let watch = self.resolver.watch(self.wallet, mint, balance_logger()).await?;
			info!(owner = %self.wallet, %mint, "watching token");
			self.watches.insert(mint, watch);
		}
		Ok(())
	}

	pub async fn run(mut self) {
		let mut changes = self.tokens.changes();
		loop {
			if let Err(e) = self.sync().await {
				warn!(error = %e, "balance monitor sync failed");
			}
			loop {
				match changes.recv().await {
					Ok(change) if change.key == TOKEN_LIST_KEY => break,
					Ok(_) => continue,
					Err(RecvError::Lagged(skipped)) => {
						warn!(skipped, "balance monitor lagged behind token list changes");
						break;
					}
					Err(RecvError::Closed) => {
						self.shutdown().await;
						return;
					}
				}
			}
		}
	}

	pub async fn shutdown(self) {
		for (_, watch) in self.watches {
			watch.cancel().await;
		}
	}
}

fn balance_logger() -> StateCallback {
	let last: Arc<StdMutex<Option<Option<u64>>>> = Arc::new(StdMutex::new(None));
	Arc::new(move |state: &TokenAccountState| {
		let effective = state.effective_balance();
		let previous = lock(&last).replace(effective);
		match previous {
			None => info!(owner = %state.owner, mint = %state.mint, balance = ?effective, delegated = state.is_delegated, "initial balance"),
			Some(prev) if prev != effective => info!(
				owner = %state.owner,
				mint = %state.mint,
				old_balance = ?prev,
				new_balance = ?effective,
				delegated = state.is_delegated,
				"Balance change detected"
			),
			Some(_) => {}
		}
	})
}

pub async fn run_balance_monitor(resolver: Arc<AccountResolver>, tokens: TokenRegistry, wallet: Pubkey) {
	BalanceMonitor::new(resolver, tokens, wallet).run().await
}
