use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use solana_sdk::hash::Hash;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::PaymentResult;
use crate::ledger::{Ledger, Ledgers, SubscriptionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockhashEntry {
	pub blockhash: Hash,
	pub last_valid_block_height: u64,
	pub fetched_at: Instant,
	pub valid_until: Instant,
}

impl BlockhashEntry {
	pub fn is_fresh(&self) -> bool {
		Instant::now() < self.valid_until
	}
}

type InFlight = Shared<BoxFuture<'static, PaymentResult<BlockhashEntry>>>;

#[derive(Default)]
struct Slot {
	entry: Option<BlockhashEntry>,
	invalidated: bool,
	in_flight: Option<InFlight>,
}

/// Latest blockhash per ledger, leased for `ttl`.
pub struct BlockhashCache {
	ledgers: Ledgers,
	ttl: Duration,
	base: Mutex<Slot>,
	rollup: Mutex<Slot>,
	fetches: AtomicU64,
}

impl BlockhashCache {
	pub fn new(ledgers: Ledgers, ttl: Duration) -> Self {
		Self { ledgers, ttl, base: Mutex::default(), rollup: Mutex::default(), fetches: AtomicU64::new(0) }
	}

	fn slot(&self, ledger: Ledger) -> &Mutex<Slot> {
		match ledger {
			Ledger::Base => &self.base,
			Ledger::Rollup => &self.rollup,
		}
	}

	/// Network fetches issued so far.
	pub fn fetch_count(&self) -> u64 {
		self.fetches.load(Ordering::Relaxed)
	}

	/// Returns the cached entry while its lease holds, refreshing otherwise.
	/// When the refresh fails the previous entry is returned even if stale;
	/// callers decide with [`BlockhashEntry::is_fresh`].
	pub async fn get(&self, ledger: Ledger) -> PaymentResult<BlockhashEntry> {
		{
			let slot = self.slot(ledger).lock().await;
			if let Some(entry) = slot.entry {
				if !slot.invalidated && entry.is_fresh() {
					return Ok(entry);
				}
			}
		}
		match self.refresh(ledger).await {
			Ok(entry) => Ok(entry),
			Err(e) => match self.slot(ledger).lock().await.entry {
				Some(stale) => {
					warn!(%ledger, error = %e, "blockhash refresh failed, serving previous value");
					Ok(stale)
				}
				None => Err(e),
			},
		}
	}

	pub async fn invalidate(&self, ledger: Ledger) {
		self.slot(ledger).lock().await.invalidated = true;
	}

	/// Fetches a new blockhash. Concurrent callers share one in-flight request.
	pub async fn refresh(&self, ledger: Ledger) -> PaymentResult<BlockhashEntry> {
		let fut = {
			let mut slot = self.slot(ledger).lock().await;
			match &slot.in_flight {
				Some(fut) => fut.clone(),
				None => {
					let fut = self.fetch(ledger);
					slot.in_flight = Some(fut.clone());
					fut
				}
			}
		};
		let result = fut.clone().await;
		let mut slot = self.slot(ledger).lock().await;
		if slot.in_flight.as_ref().is_some_and(|current| current.ptr_eq(&fut)) {
			slot.in_flight = None;
			if let Ok(entry) = &result {
				slot.entry = Some(*entry);
				slot.invalidated = false;
			}
		}
		result
	}

	fn fetch(&self, ledger: Ledger) -> InFlight {
		self.fetches.fetch_add(1, Ordering::Relaxed);
		let client = self.ledgers.client(ledger).clone();
		let ttl = self.ttl;
		async move {
			let (blockhash, last_valid_block_height) = client.get_latest_blockhash().await?;
			let fetched_at = Instant::now();
			debug!(%ledger, %blockhash, "refreshed blockhash");
			Ok(BlockhashEntry { blockhash, last_valid_block_height, fetched_at, valid_until: fetched_at + ttl })
		}
		.boxed()
		.shared()
	}

	/// Bootstraps both ledgers and refreshes each one every `every_n_slots` slot ticks.
	pub async fn start_renewal(self: &Arc<Self>, every_n_slots: u64) -> PaymentResult<RenewalHandle> {
		let every = every_n_slots.max(1);
		let mut handles = Vec::with_capacity(Ledger::ALL.len());
		for ledger in Ledger::ALL {
			if let Err(e) = self.refresh(ledger).await {
				warn!(%ledger, error = %e, "blockhash bootstrap failed");
			}
			let ticks = Arc::new(AtomicU64::new(0));
			let cache = Arc::downgrade(self);
			let callback = Arc::new(move |_slot: u64| {
				let n = ticks.fetch_add(1, Ordering::Relaxed) + 1;
				if n % every != 0 {
					return;
				}
				let (Some(cache), Ok(rt)) = (cache.upgrade(), tokio::runtime::Handle::try_current()) else {
					return;
				};
				rt.spawn(async move {
					if let Err(e) = cache.refresh(ledger).await {
						warn!(%ledger, error = %e, "background blockhash refresh failed");
					}
				});
			});
			match self.ledgers.client(ledger).subscribe_slots(callback).await {
				Ok(handle) => handles.push((ledger, handle)),
				Err(e) => {
					RenewalHandle { ledgers: self.ledgers.clone(), handles }.stop().await;
					return Err(e);
				}
			}
		}
		Ok(RenewalHandle { ledgers: self.ledgers.clone(), handles })
	}
}

/// Background renewal subscriptions; stop them explicitly on shutdown.
pub struct RenewalHandle {
	ledgers: Ledgers,
	handles: Vec<(Ledger, SubscriptionHandle)>,
}

impl RenewalHandle {
	pub async fn stop(self) {
		for (ledger, handle) in self.handles {
			self.ledgers.client(ledger).unsubscribe(handle).await;
		}
	}
}
