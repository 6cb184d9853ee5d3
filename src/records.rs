use solana_sdk::{account::Account, program_pack::Pack, pubkey::Pubkey};

use crate::error::{PaymentError, PaymentResult};

/// Base-ledger bookkeeping for (owner, mint) custody held by the ephemeral
/// token program: `owner | mint | amount`, little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupRecord {
	pub owner: Pubkey,
	pub mint: Pubkey,
	pub amount: u64,
}

impl RollupRecord {
	pub const LEN: usize = 32 + 32 + 8;

	pub fn unpack(address: &Pubkey, data: &[u8]) -> PaymentResult<Self> {
		if data.len() < Self::LEN {
			return Err(PaymentError::decode(address, format!("rollup record too small: {} bytes", data.len())));
		}
		let owner = Pubkey::try_from(&data[0..32]).map_err(|e| PaymentError::decode(address, e.to_string()))?;
		let mint = Pubkey::try_from(&data[32..64]).map_err(|e| PaymentError::decode(address, e.to_string()))?;
		let mut amount = [0u8; 8];
		amount.copy_from_slice(&data[64..72]);
		Ok(Self { owner, mint, amount: u64::from_le_bytes(amount) })
	}

	pub fn pack(&self) -> Vec<u8> {
		let mut data = Vec::with_capacity(Self::LEN);
		data.extend_from_slice(self.owner.as_ref());
		data.extend_from_slice(self.mint.as_ref());
		data.extend_from_slice(&self.amount.to_le_bytes());
		data
	}
}

/// Amount held by an SPL token account.
pub fn token_amount(address: &Pubkey, account: &Account) -> PaymentResult<u64> {
	spl_token::state::Account::unpack(&account.data)
		.map(|acc| acc.amount)
		.map_err(|e| PaymentError::decode(address, format!("token account: {e}")))
}
