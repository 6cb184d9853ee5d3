use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use solana_sdk::{
	pubkey::Pubkey,
	signature::{read_keypair_file, Keypair, Signature, Signer},
	transaction::Transaction,
};

use crate::error::{PaymentError, PaymentResult};

#[async_trait]
pub trait WalletSigner: Send + Sync {
	fn pubkey(&self) -> Pubkey;

	/// Signs every transaction or none of them.
	async fn sign_transactions(&self, txs: Vec<Transaction>) -> PaymentResult<Vec<Transaction>>;

	async fn sign_message(&self, message: &[u8]) -> PaymentResult<Signature>;
}

/// Signs with a local keypair.
pub struct KeypairSigner {
	keypair: Arc<Keypair>,
}

impl KeypairSigner {
	pub fn new(keypair: Keypair) -> Self {
		Self { keypair: Arc::new(keypair) }
	}

	/// Prefers `WALLET_KEYPAIR_BASE64` when set, otherwise reads the keypair file at `path`.
	pub fn load(path: &str) -> PaymentResult<Self> {
		if let Ok(b64) = std::env::var("WALLET_KEYPAIR_BASE64") {
			let bytes = STANDARD.decode(b64).map_err(|e| PaymentError::Config(format!("invalid base64 keypair: {e}")))?;
			let kp = Keypair::from_bytes(&bytes).map_err(|e| PaymentError::Config(format!("invalid keypair bytes: {e}")))?;
			return Ok(Self::new(kp));
		}
		let kp = read_keypair_file(path).map_err(|e| PaymentError::Config(format!("failed to read keypair: {e}")))?;
		Ok(Self::new(kp))
	}
}

#[async_trait]
impl WalletSigner for KeypairSigner {
	fn pubkey(&self) -> Pubkey {
		self.keypair.pubkey()
	}

	async fn sign_transactions(&self, mut txs: Vec<Transaction>) -> PaymentResult<Vec<Transaction>> {
		for tx in txs.iter_mut() {
			let blockhash = tx.message.recent_blockhash;
			tx.try_sign(&[self.keypair.as_ref()], blockhash)
				.map_err(|e| PaymentError::Rejection(format!("signing failed: {e}")))?;
		}
		Ok(txs)
	}

	async fn sign_message(&self, message: &[u8]) -> PaymentResult<Signature> {
		Ok(self.keypair.sign_message(message))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use solana_sdk::{hash::Hash, message::Message, system_instruction};

	#[tokio::test]
	async fn test_signs_all_transactions() {
		let signer = KeypairSigner::new(Keypair::new());
		let payer = signer.pubkey();
		let ix = system_instruction::transfer(&payer, &Pubkey::new_unique(), 1);
		let mut message = Message::new(&[ix], Some(&payer));
		message.recent_blockhash = Hash::new_unique();
		let txs = vec![Transaction::new_unsigned(message.clone()), Transaction::new_unsigned(message)];
		let signed = signer.sign_transactions(txs).await.unwrap();
		assert_eq!(signed.len(), 2);
		assert!(signed.iter().all(|tx| tx.is_signed()));
	}

	#[tokio::test]
	async fn test_foreign_signer_requirement_is_a_rejection() {
		let signer = KeypairSigner::new(Keypair::new());
		let other = Pubkey::new_unique();
		let ix = system_instruction::transfer(&other, &signer.pubkey(), 1);
		let message = Message::new(&[ix], Some(&signer.pubkey()));
		let err = signer.sign_transactions(vec![Transaction::new_unsigned(message)]).await.unwrap_err();
		assert!(matches!(err, PaymentError::Rejection(_)));
	}
}
