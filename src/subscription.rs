use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use solana_sdk::pubkey::Pubkey;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::PaymentResult;
use crate::ledger::{AccountCallback, Ledger, Ledgers, SubscriptionHandle};

type Key = (Ledger, Pubkey);
type Listeners = Arc<StdMutex<BTreeMap<u64, AccountCallback>>>;

pub(crate) fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
	m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Slot {
	handle: Option<SubscriptionHandle>,
	listeners: Listeners,
	retired: bool,
}

/// Identifies one registered listener; hand it back to [`SubscriptionRegistry::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
	pub ledger: Ledger,
	pub address: Pubkey,
	id: u64,
}

/// Shares one ledger subscription per (ledger, address) among any number of
/// listeners. The network subscription opens with the first listener and
/// closes when the last one is released. Registration and release of a
/// given key are serialized by that key's own lock.
pub struct SubscriptionRegistry {
	ledgers: Ledgers,
	slots: StdMutex<HashMap<Key, Arc<Mutex<Slot>>>>,
	next_id: AtomicU64,
}

impl SubscriptionRegistry {
	pub fn new(ledgers: Ledgers) -> Self {
		Self { ledgers, slots: StdMutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
	}

	pub async fn listen(&self, ledger: Ledger, address: Pubkey, callback: AccountCallback) -> PaymentResult<ListenerId> {
		let key = (ledger, address);
		loop {
			let slot = lock(&self.slots).entry(key).or_default().clone();
			let mut guard = slot.lock().await;
			if guard.retired {
				// Released concurrently; pick up the replacement slot.
				continue;
			}
			let id = self.next_id.fetch_add(1, Ordering::Relaxed);
			lock(&guard.listeners).insert(id, callback.clone());
			if guard.handle.is_none() {
				let listeners = guard.listeners.clone();
				let fanout: AccountCallback = Arc::new(move |account| {
					let targets: Vec<AccountCallback> = lock(&listeners).values().cloned().collect();
					for target in targets {
						target(account.clone());
					}
				});
				match self.ledgers.client(ledger).subscribe(&address, fanout).await {
					Ok(handle) => {
						debug!(%ledger, %address, "opened account subscription");
						guard.handle = Some(handle);
					}
					Err(e) => {
						lock(&guard.listeners).remove(&id);
						if lock(&guard.listeners).is_empty() {
							guard.retired = true;
							self.forget(&key, &slot);
						}
						return Err(e);
					}
				}
			}
			return Ok(ListenerId { ledger, address, id });
		}
	}

	pub async fn release(&self, listener: ListenerId) {
		let key = (listener.ledger, listener.address);
		let Some(slot) = lock(&self.slots).get(&key).cloned() else { return };
		let mut guard = slot.lock().await;
		lock(&guard.listeners).remove(&listener.id);
		if !lock(&guard.listeners).is_empty() || guard.retired {
			return;
		}
		if let Some(handle) = guard.handle.take() {
			self.ledgers.client(listener.ledger).unsubscribe(handle).await;
			debug!(ledger = %listener.ledger, address = %listener.address, "closed account subscription");
		}
		guard.retired = true;
		self.forget(&key, &slot);
	}

	/// Number of open network subscriptions across both ledgers.
	pub fn open_subscriptions(&self) -> usize {
		lock(&self.slots).len()
	}

	/// Listeners currently registered for one key; waits out a concurrent listen or release.
	pub async fn listener_count(&self, ledger: Ledger, address: &Pubkey) -> usize {
		let Some(slot) = lock(&self.slots).get(&(ledger, *address)).cloned() else { return 0 };
		let guard = slot.lock().await;
		if guard.retired {
			return 0;
		}
		let count = lock(&guard.listeners).len();
		count
	}

	fn forget(&self, key: &Key, slot: &Arc<Mutex<Slot>>) {
		let mut slots = lock(&self.slots);
		if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
			slots.remove(key);
		}
	}
}
