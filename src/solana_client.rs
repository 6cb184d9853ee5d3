use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::StreamExt;
use solana_account_decoder::UiAccountEncoding;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcSendTransactionConfig};
use solana_client::rpc_request::RpcError;
use solana_sdk::{
	account::Account, commitment_config::CommitmentConfig, hash::Hash, pubkey::Pubkey, signature::Signature,
	transaction::Transaction,
};
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, info, warn};

use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{AccountCallback, Confirmation, Ledger, LedgerClient, SlotCallback, SubscriptionHandle};

/// JSON-RPC plus pubsub connection to one ledger.
pub struct RpcLedgerClient {
	ledger: Ledger,
	rpc: RpcClient,
	ws_url: String,
	commitment: CommitmentConfig,
	pubsub: OnceCell<Arc<PubsubClient>>,
	next_handle: AtomicU64,
	streams: StdMutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl RpcLedgerClient {
	pub fn new(ledger: Ledger, rpc_url: &str, ws_url: &str, commitment: CommitmentConfig) -> Self {
		Self {
			ledger,
			rpc: RpcClient::new_with_commitment(rpc_url.to_string(), commitment),
			ws_url: ws_url.to_string(),
			commitment,
			pubsub: OnceCell::new(),
			next_handle: AtomicU64::new(1),
			streams: StdMutex::new(HashMap::new()),
		}
	}

	/// Derives the websocket endpoint from an http(s) url.
	pub fn ws_url_for(rpc_url: &str) -> String {
		rpc_url.replace("https://", "wss://").replace("http://", "ws://")
	}

	fn err(&self, e: impl std::fmt::Display) -> PaymentError {
		PaymentError::connectivity(self.ledger, e)
	}

	async fn pubsub(&self) -> PaymentResult<Arc<PubsubClient>> {
		let client = self
			.pubsub
			.get_or_try_init(|| async {
				info!(ledger = %self.ledger, url = %self.ws_url, "connecting pubsub");
				PubsubClient::new(&self.ws_url).await.map(Arc::new).map_err(|e| self.err(format!("pubsub connect: {e}")))
			})
			.await?;
		Ok(client.clone())
	}

	fn register_stream(&self, stop: oneshot::Sender<()>) -> SubscriptionHandle {
		let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
		if let Ok(mut streams) = self.streams.lock() {
			streams.insert(id, stop);
		}
		SubscriptionHandle(id)
	}

	fn send_error(&self, signature: Signature, e: ClientError) -> PaymentError {
		match e.kind() {
			ClientErrorKind::RpcError(RpcError::RpcResponseError { message, .. }) => PaymentError::TransactionFailed {
				ledger: self.ledger,
				signature: signature.to_string(),
				reason: message.clone(),
			},
			ClientErrorKind::TransactionError(te) => PaymentError::TransactionFailed {
				ledger: self.ledger,
				signature: signature.to_string(),
				reason: te.to_string(),
			},
			_ => self.err(format!("send_transaction failed: {e}")),
		}
	}
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
	fn ledger(&self) -> Ledger {
		self.ledger
	}

	async fn get_account(&self, address: &Pubkey) -> PaymentResult<Option<Account>> {
		let resp = self
			.rpc
			.get_account_with_commitment(address, self.commitment)
			.await
			.map_err(|e| self.err(format!("get_account failed: {e}")))?;
		Ok(resp.value)
	}

	async fn get_accounts(&self, addresses: &[Pubkey]) -> PaymentResult<Vec<Option<Account>>> {
		self.rpc
			.get_multiple_accounts(addresses)
			.await
			.map_err(|e| self.err(format!("get_multiple_accounts failed: {e}")))
	}

	async fn subscribe(&self, address: &Pubkey, callback: AccountCallback) -> PaymentResult<SubscriptionHandle> {
		let pubsub = self.pubsub().await?;
		let config = RpcAccountInfoConfig {
			encoding: Some(UiAccountEncoding::Base64),
			commitment: Some(self.commitment),
			..Default::default()
		};
		let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
		let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
		let address = *address;
		let ledger = self.ledger;
		tokio::spawn(async move {
			let (mut stream, unsubscribe) = match pubsub.account_subscribe(&address, Some(config)).await {
				Ok(sub) => {
					let _ = ready_tx.send(Ok(()));
					sub
				}
				Err(e) => {
					let _ = ready_tx.send(Err(e.to_string()));
					return;
				}
			};
			loop {
				tokio::select! {
					_ = &mut stop_rx => break,
					update = stream.next() => match update {
						Some(resp) => match resp.value.decode::<Account>() {
							Some(account) => callback(account),
							None => warn!(%ledger, %address, "undecodable account notification"),
						},
						None => {
							warn!(%ledger, %address, "account stream closed");
							break;
						}
					},
				}
			}
			drop(stream);
			unsubscribe().await;
			debug!(%ledger, %address, "account subscription closed");
		});
		match ready_rx.await {
			Ok(Ok(())) => Ok(self.register_stream(stop_tx)),
			Ok(Err(e)) => Err(self.err(format!("account_subscribe failed: {e}"))),
			Err(_) => Err(self.err("account_subscribe task ended")),
		}
	}

	async fn subscribe_slots(&self, callback: SlotCallback) -> PaymentResult<SubscriptionHandle> {
		let pubsub = self.pubsub().await?;
		let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
		let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
		let ledger = self.ledger;
		tokio::spawn(async move {
			let (mut stream, unsubscribe) = match pubsub.slot_subscribe().await {
				Ok(sub) => {
					let _ = ready_tx.send(Ok(()));
					sub
				}
				Err(e) => {
					let _ = ready_tx.send(Err(e.to_string()));
					return;
				}
			};
			loop {
				tokio::select! {
					_ = &mut stop_rx => break,
					update = stream.next() => match update {
						Some(info) => callback(info.slot),
						None => {
							warn!(%ledger, "slot stream closed");
							break;
						}
					},
				}
			}
			drop(stream);
			unsubscribe().await;
		});
		match ready_rx.await {
			Ok(Ok(())) => Ok(self.register_stream(stop_tx)),
			Ok(Err(e)) => Err(self.err(format!("slot_subscribe failed: {e}"))),
			Err(_) => Err(self.err("slot_subscribe task ended")),
		}
	}

	async fn unsubscribe(&self, handle: SubscriptionHandle) {
		let stop = self.streams.lock().ok().and_then(|mut streams| streams.remove(&handle.0));
		if let Some(stop) = stop {
			let _ = stop.send(());
		}
	}

	async fn send_raw_transaction(&self, bytes: &[u8]) -> PaymentResult<Signature> {
		let tx: Transaction =
			bincode::deserialize(bytes).map_err(|e| PaymentError::Internal(format!("deserialize tx: {e}")))?;
		let signature = tx.signatures.first().copied().unwrap_or_default();
		let config = RpcSendTransactionConfig {
			preflight_commitment: Some(self.commitment.commitment),
			..Default::default()
		};
		self.rpc.send_transaction_with_config(&tx, config).await.map_err(|e| self.send_error(signature, e))
	}

	async fn confirm_transaction(&self, signature: &Signature, commitment: CommitmentConfig) -> PaymentResult<Confirmation> {
		let status = self
			.rpc
			.get_signature_status_with_commitment(signature, commitment)
			.await
			.map_err(|e| self.err(format!("get_signature_status failed: {e}")))?;
		Ok(match status {
			None => Confirmation::Pending,
			Some(Ok(())) => Confirmation::Confirmed,
			Some(Err(e)) => Confirmation::Failed(e.to_string()),
		})
	}

	async fn get_latest_blockhash(&self) -> PaymentResult<(Hash, u64)> {
		self.rpc
			.get_latest_blockhash_with_commitment(self.commitment)
			.await
			.map_err(|e| self.err(format!("blockhash: {e}")))
	}
}
