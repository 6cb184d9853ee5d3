//! Address derivation and unsigned instruction builders for the ephemeral
//! token program, its permission program, and the delegation program.
//!
//! Every builder is pure: the same inputs always produce the same instruction.
//! Only the paying wallet is ever marked as a signer so that a single wallet
//! signature covers each transaction.

use serde::{Deserialize, Serialize};
use solana_sdk::{
	instruction::{AccountMeta, Instruction},
	pubkey::Pubkey,
	system_program,
};
use spl_associated_token_account as spl_ata;

use crate::error::{PaymentError, PaymentResult};

pub const PERMISSION_SEED: &[u8] = b"permission:";
pub const VAULT_SEED: &[u8] = b"vault";

/// Program ids the factory targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramIds {
	/// Ephemeral token program owning rollup records and vaults.
	pub token_program: Pubkey,
	pub delegation_program: Pubkey,
	pub permission_program: Pubkey,
	/// Rollup validator accounts are delegated to.
	pub validator: Pubkey,
}

/// Operation tag carried in the first data byte of ephemeral token program instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
	InitRollupRecord = 0,
	InitVault = 1,
	FundVault = 2,
	Withdraw = 3,
	Delegate = 4,
	Undelegate = 5,
	CreatePermission = 6,
	DelegatePermission = 7,
}

impl OpCode {
	pub fn from_tag(tag: u8) -> Option<Self> {
		Some(match tag {
			0 => OpCode::InitRollupRecord,
			1 => OpCode::InitVault,
			2 => OpCode::FundVault,
			3 => OpCode::Withdraw,
			4 => OpCode::Delegate,
			5 => OpCode::Undelegate,
			6 => OpCode::CreatePermission,
			7 => OpCode::DelegatePermission,
			_ => return None,
		})
	}

	/// Decodes the tag and, for amount-carrying operations, the amount.
	pub fn decode(data: &[u8]) -> Option<(Self, Option<u64>)> {
		let op = Self::from_tag(*data.first()?)?;
		let amount = match op {
			OpCode::FundVault | OpCode::Withdraw => {
				let raw: [u8; 8] = data.get(1..9)?.try_into().ok()?;
				Some(u64::from_le_bytes(raw))
			}
			_ => None,
		};
		Some((op, amount))
	}
}

#[derive(Debug, Clone)]
pub struct InstructionFactory {
	ids: ProgramIds,
}

impl InstructionFactory {
	pub fn new(ids: ProgramIds) -> Self {
		Self { ids }
	}

	pub fn program_ids(&self) -> &ProgramIds {
		&self.ids
	}

	// Derivations

	/// The owner's associated token account; same address on both ledgers.
	pub fn base_account(&self, owner: &Pubkey, mint: &Pubkey) -> Pubkey {
		spl_ata::get_associated_token_address(owner, mint)
	}

	/// The rollup record tracking custody for (owner, mint).
	pub fn rollup_account(&self, owner: &Pubkey, mint: &Pubkey) -> (Pubkey, u8) {
		Pubkey::find_program_address(&[owner.as_ref(), mint.as_ref()], &self.ids.token_program)
	}

	pub fn permission(&self, rollup_account: &Pubkey) -> (Pubkey, u8) {
		Pubkey::find_program_address(&[PERMISSION_SEED, rollup_account.as_ref()], &self.ids.permission_program)
	}

	pub fn vault(&self, mint: &Pubkey) -> (Pubkey, u8) {
		Pubkey::find_program_address(&[VAULT_SEED, mint.as_ref()], &self.ids.token_program)
	}

	pub fn vault_token_account(&self, mint: &Pubkey) -> Pubkey {
		let (vault, _) = self.vault(mint);
		spl_ata::get_associated_token_address(&vault, mint)
	}

	// Builders

	pub fn init_vault(&self, payer: &Pubkey, mint: &Pubkey) -> Instruction {
		let (vault, bump) = self.vault(mint);
		let accounts = vec![
			AccountMeta::new(vault, false),
			AccountMeta::new(*payer, true),
			AccountMeta::new_readonly(*mint, false),
			AccountMeta::new_readonly(system_program::id(), false),
		];
		self.op(OpCode::InitVault, accounts, &[bump])
	}

	pub fn init_vault_token_account(&self, payer: &Pubkey, mint: &Pubkey) -> Instruction {
		let (vault, _) = self.vault(mint);
		spl_ata::instruction::create_associated_token_account_idempotent(payer, &vault, mint, &spl_token::id())
	}

	/// Idempotent creation of the owner's base-ledger token account.
	pub fn init_base_account(&self, payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Instruction {
		spl_ata::instruction::create_associated_token_account_idempotent(payer, owner, mint, &spl_token::id())
	}

	pub fn init_rollup_account(&self, payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Instruction {
		let (record, bump) = self.rollup_account(owner, mint);
		let accounts = vec![
			AccountMeta::new(record, false),
			AccountMeta::new(*payer, true),
			AccountMeta::new_readonly(*owner, false),
			AccountMeta::new_readonly(*mint, false),
			AccountMeta::new_readonly(system_program::id(), false),
		];
		self.op(OpCode::InitRollupRecord, accounts, &[bump])
	}

	pub fn create_permission(&self, payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Instruction {
		let (record, bump) = self.rollup_account(owner, mint);
		let (permission, _) = self.permission(&record);
		let accounts = vec![
			AccountMeta::new_readonly(record, false),
			AccountMeta::new(permission, false),
			AccountMeta::new(*payer, true),
			AccountMeta::new_readonly(*owner, false),
			AccountMeta::new_readonly(self.ids.permission_program, false),
			AccountMeta::new_readonly(system_program::id(), false),
		];
		self.op(OpCode::CreatePermission, accounts, &[bump])
	}

	pub fn delegate_permission(&self, payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Instruction {
		let (record, bump) = self.rollup_account(owner, mint);
		let (permission, _) = self.permission(&record);
		let accounts = vec![
			AccountMeta::new(*payer, true),
			AccountMeta::new_readonly(record, false),
			AccountMeta::new(permission, false),
			AccountMeta::new_readonly(self.ids.permission_program, false),
			AccountMeta::new_readonly(self.ids.delegation_program, false),
			AccountMeta::new_readonly(self.ids.validator, false),
		];
		self.op(OpCode::DelegatePermission, accounts, &[bump])
	}

	pub fn delegate(&self, payer: &Pubkey, owner: &Pubkey, mint: &Pubkey) -> Instruction {
		let (record, bump) = self.rollup_account(owner, mint);
		let accounts = vec![
			AccountMeta::new(*payer, true),
			AccountMeta::new(record, false),
			AccountMeta::new_readonly(*owner, false),
			AccountMeta::new_readonly(*mint, false),
			AccountMeta::new_readonly(self.ids.delegation_program, false),
			AccountMeta::new_readonly(self.ids.validator, false),
			AccountMeta::new_readonly(system_program::id(), false),
		];
		self.op(OpCode::Delegate, accounts, &[bump])
	}

	/// Sent to the rollup; commits the rollup balance back into the base record.
	pub fn undelegate(&self, owner: &Pubkey, mint: &Pubkey) -> Instruction {
		let (record, _) = self.rollup_account(owner, mint);
		let accounts = vec![
			AccountMeta::new(*owner, true),
			AccountMeta::new(self.base_account(owner, mint), false),
			AccountMeta::new(record, false),
			AccountMeta::new_readonly(*mint, false),
			AccountMeta::new_readonly(self.ids.delegation_program, false),
		];
		self.op(OpCode::Undelegate, accounts, &[])
	}

	/// Moves `amount` from the owner's token account into the vault and credits
	/// the owner's rollup record.
	pub fn fund_vault(&self, owner: &Pubkey, mint: &Pubkey, amount: u64) -> Instruction {
		let (record, _) = self.rollup_account(owner, mint);
		let (vault, _) = self.vault(mint);
		let accounts = vec![
			AccountMeta::new(record, false),
			AccountMeta::new_readonly(vault, false),
			AccountMeta::new_readonly(*mint, false),
			AccountMeta::new(self.base_account(owner, mint), false),
			AccountMeta::new(self.vault_token_account(mint), false),
			AccountMeta::new(*owner, true),
			AccountMeta::new_readonly(spl_token::id(), false),
		];
		self.op(OpCode::FundVault, accounts, &amount.to_le_bytes())
	}

	pub fn withdraw(&self, owner: &Pubkey, mint: &Pubkey, amount: u64) -> Instruction {
		let (record, _) = self.rollup_account(owner, mint);
		let (vault, _) = self.vault(mint);
		let accounts = vec![
			AccountMeta::new(*owner, true),
			AccountMeta::new(record, false),
			AccountMeta::new_readonly(vault, false),
			AccountMeta::new_readonly(*mint, false),
			AccountMeta::new(self.vault_token_account(mint), false),
			AccountMeta::new(self.base_account(owner, mint), false),
			AccountMeta::new_readonly(spl_token::id(), false),
		];
		self.op(OpCode::Withdraw, accounts, &amount.to_le_bytes())
	}

	/// Plain token transfer between the two owners' token accounts, executed on the rollup.
	pub fn transfer(&self, sender: &Pubkey, recipient: &Pubkey, mint: &Pubkey, amount: u64) -> PaymentResult<Instruction> {
		spl_token::instruction::transfer(
			&spl_token::id(),
			&self.base_account(sender, mint),
			&self.base_account(recipient, mint),
			sender,
			&[],
			amount,
		)
		.map_err(|e| PaymentError::Internal(format!("transfer instruction: {e}")))
	}

	fn op(&self, code: OpCode, accounts: Vec<AccountMeta>, args: &[u8]) -> Instruction {
		let mut data = Vec::with_capacity(1 + args.len());
		data.push(code as u8);
		data.extend_from_slice(args);
		Instruction { program_id: self.ids.token_program, accounts, data }
	}
}
