//! Pure planning of cross-ledger operations from a snapshot of resolved state.
//!
//! Plans are recomputed on every invocation and never stored, so re-running
//! a failed transfer only emits the steps the current state still lacks.

use std::fmt;

use solana_sdk::{instruction::Instruction, pubkey::Pubkey};

use crate::error::{PaymentError, PaymentResult};
use crate::instructions::{InstructionFactory, OpCode};
use crate::ledger::Ledger;
use crate::resolver::{TokenAccountState, VaultState};

/// A post-condition observed through the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
	Undelegated,
	Delegated,
	EffectiveBalance(u64),
	EffectiveAtLeast(u64),
	/// Rollup record and permission both exist.
	Initialized,
	WalletBalance(u64),
}

impl Condition {
	pub fn holds(&self, state: &TokenAccountState) -> bool {
		match *self {
			Condition::Undelegated => state.rollup_record_exists && !state.is_delegated,
			Condition::Delegated => state.is_delegated,
			Condition::EffectiveBalance(expected) => state.effective_balance() == Some(expected),
			Condition::EffectiveAtLeast(min) => state.effective_balance().is_some_and(|b| b >= min),
			Condition::Initialized => state.rollup_record_exists && state.permission_exists,
			Condition::WalletBalance(expected) => state.base_balance == Some(expected),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
	pub owner: Pubkey,
	pub condition: Condition,
}

impl Expectation {
	pub fn new(owner: Pubkey, condition: Condition) -> Self {
		Self { owner, condition }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
	Undelegating,
	Scaffolding,
	Executing,
	Withdrawing,
	Initializing,
	Funding,
	Delegating,
}

impl fmt::Display for Stage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Stage::Undelegating => "undelegating",
			Stage::Scaffolding => "scaffolding",
			Stage::Executing => "executing",
			Stage::Withdrawing => "withdrawing",
			Stage::Initializing => "initializing",
			Stage::Funding => "funding",
			Stage::Delegating => "delegating",
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxGroup {
	pub ledger: Ledger,
	pub stage: Stage,
	pub instructions: Vec<Instruction>,
	/// Must all hold before the next group may be sent.
	pub awaits: Vec<Expectation>,
	pub max_wait_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransferPlan {
	pub groups: Vec<TxGroup>,
	pub deficit: u64,
}

impl TransferPlan {
	pub fn groups_on(&self, ledger: Ledger) -> usize {
		self.groups.iter().filter(|g| g.ledger == ledger).count()
	}

	/// Total amount moved into the vault by funding instructions.
	pub fn funded_amount(&self, token_program: &Pubkey) -> u64 {
		self.groups
			.iter()
			.flat_map(|g| g.instructions.iter())
			.filter(|ix| ix.program_id == *token_program)
			.filter_map(|ix| match OpCode::decode(&ix.data) {
				Some((OpCode::FundVault, Some(amount))) => Some(amount),
				_ => None,
			})
			.sum()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
	pub transfer_undelegate_attempts: u32,
	pub withdraw_undelegate_attempts: u32,
	pub convergence_attempts: u32,
}

impl Default for PlanLimits {
	fn default() -> Self {
		Self { transfer_undelegate_attempts: 15, withdraw_undelegate_attempts: 10, convergence_attempts: 30 }
	}
}

pub fn validate_amount(amount: u64) -> PaymentResult<()> {
	if amount == 0 {
		return Err(PaymentError::InvalidRequest("amount must be positive".to_string()));
	}
	Ok(())
}

fn scaffold(factory: &InstructionFactory, payer: &Pubkey, party: &TokenAccountState, ixs: &mut Vec<Instruction>) {
	if !party.base_account_exists {
		ixs.push(factory.init_base_account(payer, &party.owner, &party.mint));
	}
	if !party.rollup_record_exists {
		ixs.push(factory.init_rollup_account(payer, &party.owner, &party.mint));
	}
	if !party.permission_exists {
		ixs.push(factory.create_permission(payer, &party.owner, &party.mint));
	}
	if !party.is_permission_delegated {
		ixs.push(factory.delegate_permission(payer, &party.owner, &party.mint));
	}
}

pub fn plan_transfer(
	factory: &InstructionFactory,
	sender: &TokenAccountState,
	recipient: &TokenAccountState,
	vault: &VaultState,
	amount: u64,
	limits: &PlanLimits,
) -> PaymentResult<TransferPlan> {
	validate_amount(amount)?;
	if sender.owner == recipient.owner {
		return Err(PaymentError::InvalidRequest("sender and recipient are the same".to_string()));
	}
	if sender.mint != recipient.mint {
		return Err(PaymentError::InvalidRequest("sender and recipient hold different mints".to_string()));
	}
	if sender.access_denied() {
		return Err(PaymentError::AccessDenied { owner: sender.owner.to_string() });
	}
	let spendable = sender.spendable();
	if amount > spendable {
		return Err(PaymentError::InsufficientBalance { requested: amount, available: spendable });
	}

	let payer = sender.owner;
	let mint = sender.mint;
	let custody = sender.effective_balance().unwrap_or(0);
	let deficit = amount.saturating_sub(custody);
	let undelegating = deficit > 0 && sender.is_delegated;
	let mut groups = Vec::new();

	if undelegating {
		groups.push(TxGroup {
			ledger: Ledger::Rollup,
			stage: Stage::Undelegating,
			instructions: vec![factory.undelegate(&sender.owner, &mint)],
			awaits: vec![Expectation::new(sender.owner, Condition::Undelegated)],
			max_wait_attempts: limits.transfer_undelegate_attempts,
		});
	}

	let mut base = Vec::new();
	if deficit > 0 {
		if !vault.vault_exists {
			base.push(factory.init_vault(&payer, &mint));
		}
		if !vault.token_account_exists {
			base.push(factory.init_vault_token_account(&payer, &mint));
		}
	}
	scaffold(factory, &payer, sender, &mut base);
	scaffold(factory, &payer, recipient, &mut base);
	if deficit > 0 {
		base.push(factory.fund_vault(&sender.owner, &mint, deficit));
	}
	if !sender.is_delegated || undelegating {
		base.push(factory.delegate(&payer, &sender.owner, &mint));
	}
	if !recipient.is_delegated {
		base.push(factory.delegate(&payer, &recipient.owner, &mint));
	}
	if !base.is_empty() {
		groups.push(TxGroup {
			ledger: Ledger::Base,
			stage: Stage::Scaffolding,
			instructions: base,
			awaits: vec![
				Expectation::new(sender.owner, Condition::Delegated),
				Expectation::new(sender.owner, Condition::EffectiveAtLeast(amount)),
				Expectation::new(recipient.owner, Condition::Delegated),
			],
			max_wait_attempts: limits.convergence_attempts,
		});
	}

	let mut awaits = vec![Expectation::new(sender.owner, Condition::EffectiveBalance(custody + deficit - amount))];
	if let Some(baseline) = recipient.effective_balance() {
		awaits.push(Expectation::new(recipient.owner, Condition::EffectiveBalance(baseline.saturating_add(amount))));
	}
	groups.push(TxGroup {
		ledger: Ledger::Rollup,
		stage: Stage::Executing,
		instructions: vec![factory.transfer(&sender.owner, &recipient.owner, &mint, amount)?],
		awaits,
		max_wait_attempts: limits.convergence_attempts,
	});

	Ok(TransferPlan { groups, deficit })
}

pub fn plan_withdraw(
	factory: &InstructionFactory,
	owner: &TokenAccountState,
	amount: u64,
	limits: &PlanLimits,
) -> PaymentResult<TransferPlan> {
	validate_amount(amount)?;
	if owner.access_denied() {
		return Err(PaymentError::AccessDenied { owner: owner.owner.to_string() });
	}
	let available = owner.effective_balance().unwrap_or(0);
	if amount > available {
		return Err(PaymentError::InsufficientBalance { requested: amount, available });
	}

	let mut groups = Vec::new();
	if owner.is_delegated {
		groups.push(TxGroup {
			ledger: Ledger::Rollup,
			stage: Stage::Undelegating,
			instructions: vec![factory.undelegate(&owner.owner, &owner.mint)],
			awaits: vec![Expectation::new(owner.owner, Condition::Undelegated)],
			max_wait_attempts: limits.withdraw_undelegate_attempts,
		});
	}
	let mut base = Vec::new();
	if !owner.base_account_exists {
		base.push(factory.init_base_account(&owner.owner, &owner.owner, &owner.mint));
	}
	base.push(factory.withdraw(&owner.owner, &owner.mint, amount));
	groups.push(TxGroup {
		ledger: Ledger::Base,
		stage: Stage::Withdrawing,
		instructions: base,
		awaits: vec![
			Expectation::new(owner.owner, Condition::Undelegated),
			Expectation::new(owner.owner, Condition::EffectiveBalance(available - amount)),
		],
		max_wait_attempts: limits.convergence_attempts,
	});
	Ok(TransferPlan { groups, deficit: 0 })
}

/// Single-step management of one deposit. Each action is one transaction
/// on one ledger; nothing is undelegated or scaffolded implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositAction {
	/// Creates the rollup record and its permission for `owner`.
	Initialize { owner: Pubkey },
	/// Moves wallet tokens into custody, creating the vault on first use.
	Deposit { amount: u64 },
	/// Returns custody to the wallet. The deposit must not be delegated.
	Withdraw { amount: u64 },
	/// Token transfer on the rollup when `delegated`, on the base ledger otherwise.
	Transfer { recipient: Pubkey, amount: u64, delegated: bool },
	Delegate { owner: Pubkey },
	Undelegate,
}

impl DepositAction {
	pub fn name(&self) -> &'static str {
		match self {
			DepositAction::Initialize { .. } => "initialize",
			DepositAction::Deposit { .. } => "deposit",
			DepositAction::Withdraw { .. } => "withdraw",
			DepositAction::Transfer { .. } => "transfer",
			DepositAction::Delegate { .. } => "delegate",
			DepositAction::Undelegate => "undelegate",
		}
	}

	/// Owner of the deposit the action is planned against.
	pub fn subject(&self, wallet: Pubkey) -> Pubkey {
		match *self {
			DepositAction::Initialize { owner } | DepositAction::Delegate { owner } => owner,
			_ => wallet,
		}
	}

	pub fn counterparty(&self) -> Option<Pubkey> {
		match *self {
			DepositAction::Transfer { recipient, .. } => Some(recipient),
			_ => None,
		}
	}

	/// Checks that need no ledger state.
	pub fn validate(&self, wallet: &Pubkey) -> PaymentResult<()> {
		match *self {
			DepositAction::Deposit { amount } | DepositAction::Withdraw { amount } => validate_amount(amount),
			DepositAction::Transfer { recipient, amount, .. } => {
				validate_amount(amount)?;
				if recipient == *wallet {
					return Err(PaymentError::InvalidRequest("sender and recipient are the same".to_string()));
				}
				Ok(())
			}
			_ => Ok(()),
		}
	}
}

fn require_undelegated(state: &TokenAccountState) -> PaymentResult<()> {
	if !state.rollup_record_exists {
		return Err(PaymentError::InvalidRequest("deposit account is not initialised".to_string()));
	}
	if state.is_delegated {
		return Err(PaymentError::InvalidRequest("deposit is delegated; undelegate it first".to_string()));
	}
	Ok(())
}

fn ensure_covers(amount: u64, available: u64) -> PaymentResult<()> {
	if amount > available {
		return Err(PaymentError::InsufficientBalance { requested: amount, available });
	}
	Ok(())
}

pub fn plan_deposit_action(
	factory: &InstructionFactory,
	payer: &Pubkey,
	action: &DepositAction,
	subject: &TokenAccountState,
	counterparty: Option<&TokenAccountState>,
	vault: Option<&VaultState>,
	limits: &PlanLimits,
) -> PaymentResult<TransferPlan> {
	action.validate(payer)?;
	let (owner, mint) = (subject.owner, subject.mint);

	let group = match *action {
		DepositAction::Initialize { .. } => {
			if subject.rollup_record_exists && subject.permission_exists {
				return Err(PaymentError::InvalidRequest("deposit account is already initialised".to_string()));
			}
			let mut instructions = Vec::new();
			if !subject.rollup_record_exists {
				instructions.push(factory.init_rollup_account(payer, &owner, &mint));
			}
			if !subject.permission_exists {
				instructions.push(factory.create_permission(payer, &owner, &mint));
			}
			TxGroup {
				ledger: Ledger::Base,
				stage: Stage::Initializing,
				instructions,
				awaits: vec![Expectation::new(owner, Condition::Initialized)],
				max_wait_attempts: limits.convergence_attempts,
			}
		}
		DepositAction::Deposit { amount } => {
			require_undelegated(subject)?;
			let wallet = subject.base_balance.unwrap_or(0);
			ensure_covers(amount, wallet)?;
			let vault = vault.ok_or_else(|| PaymentError::Internal("vault state is required to deposit".to_string()))?;
			let mut instructions = Vec::new();
			if !vault.vault_exists {
				instructions.push(factory.init_vault(payer, &mint));
			}
			if !vault.token_account_exists {
				instructions.push(factory.init_vault_token_account(payer, &mint));
			}
			instructions.push(factory.fund_vault(&owner, &mint, amount));
			let custody = subject.deposit_balance.unwrap_or(0);
			TxGroup {
				ledger: Ledger::Base,
				stage: Stage::Funding,
				instructions,
				awaits: vec![
					Expectation::new(owner, Condition::EffectiveBalance(custody.saturating_add(amount))),
					Expectation::new(owner, Condition::WalletBalance(wallet - amount)),
				],
				max_wait_attempts: limits.convergence_attempts,
			}
		}
		DepositAction::Withdraw { amount } => {
			require_undelegated(subject)?;
			let custody = subject.deposit_balance.unwrap_or(0);
			ensure_covers(amount, custody)?;
			let mut instructions = Vec::new();
			if !subject.base_account_exists {
				instructions.push(factory.init_base_account(payer, &owner, &mint));
			}
			instructions.push(factory.withdraw(&owner, &mint, amount));
			TxGroup {
				ledger: Ledger::Base,
				stage: Stage::Withdrawing,
				instructions,
				awaits: vec![Expectation::new(owner, Condition::EffectiveBalance(custody - amount))],
				max_wait_attempts: limits.convergence_attempts,
			}
		}
		DepositAction::Transfer { recipient, amount, delegated } => {
			let to = counterparty
				.filter(|c| c.owner == recipient)
				.ok_or_else(|| PaymentError::Internal("recipient state is required to transfer".to_string()))?;
			if to.mint != mint {
				return Err(PaymentError::InvalidRequest("sender and recipient hold different mints".to_string()));
			}
			if delegated {
				if !subject.is_delegated {
					return Err(PaymentError::InvalidRequest("sender deposit is not delegated".to_string()));
				}
				if subject.access_denied() {
					return Err(PaymentError::AccessDenied { owner: owner.to_string() });
				}
				if !to.is_delegated {
					return Err(PaymentError::InvalidRequest("recipient deposit is not delegated".to_string()));
				}
				let available = subject.rollup_balance.unwrap_or(0);
				ensure_covers(amount, available)?;
				let mut awaits = vec![Expectation::new(owner, Condition::EffectiveBalance(available - amount))];
				if let Some(baseline) = to.rollup_balance {
					awaits.push(Expectation::new(recipient, Condition::EffectiveBalance(baseline.saturating_add(amount))));
				}
				TxGroup {
					ledger: Ledger::Rollup,
					stage: Stage::Executing,
					instructions: vec![factory.transfer(&owner, &recipient, &mint, amount)?],
					awaits,
					max_wait_attempts: limits.convergence_attempts,
				}
			} else {
				let available = subject.base_balance.unwrap_or(0);
				ensure_covers(amount, available)?;
				let mut instructions = Vec::new();
				if !to.base_account_exists {
					instructions.push(factory.init_base_account(payer, &recipient, &mint));
				}
				instructions.push(factory.transfer(&owner, &recipient, &mint, amount)?);
				let mut awaits = vec![Expectation::new(owner, Condition::WalletBalance(available - amount))];
				if let Some(baseline) = to.base_balance {
					awaits.push(Expectation::new(recipient, Condition::WalletBalance(baseline.saturating_add(amount))));
				}
				TxGroup {
					ledger: Ledger::Base,
					stage: Stage::Executing,
					instructions,
					awaits,
					max_wait_attempts: limits.convergence_attempts,
				}
			}
		}
		DepositAction::Delegate { .. } => {
			require_undelegated(subject)?;
			let mut instructions = Vec::new();
			if subject.permission_exists && !subject.is_permission_delegated {
				instructions.push(factory.delegate_permission(payer, &owner, &mint));
			}
			instructions.push(factory.delegate(payer, &owner, &mint));
			TxGroup {
				ledger: Ledger::Base,
				stage: Stage::Delegating,
				instructions,
				awaits: vec![Expectation::new(owner, Condition::Delegated)],
				max_wait_attempts: limits.convergence_attempts,
			}
		}
		DepositAction::Undelegate => {
			if !subject.is_delegated {
				return Err(PaymentError::InvalidRequest("deposit is not delegated".to_string()));
			}
			TxGroup {
				ledger: Ledger::Rollup,
				stage: Stage::Undelegating,
				instructions: vec![factory.undelegate(&owner, &mint)],
				awaits: vec![Expectation::new(owner, Condition::Undelegated)],
				max_wait_attempts: limits.withdraw_undelegate_attempts,
			}
		}
	};
	Ok(TransferPlan { groups: vec![group], deficit: 0 })
}
