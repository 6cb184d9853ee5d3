use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use solana_sdk::{commitment_config::CommitmentConfig, message::Message, pubkey::Pubkey, signature::Signature, transaction::Transaction};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::blockhash::BlockhashCache;
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{Confirmation, Ledger, Ledgers};
use crate::metrics::Metrics;
use crate::plan::{
	plan_deposit_action, plan_transfer, plan_withdraw, validate_amount, DepositAction, PlanLimits, TransferPlan, TxGroup,
};
use crate::resolver::{AccountResolver, TokenAccountState};
use crate::retry::{retry_until, RetryPolicy};
use crate::signer::WalletSigner;

#[derive(Debug, Clone)]
pub struct SagaConfig {
	pub poll_interval: Duration,
	pub confirm_attempts: u32,
	pub commitment: CommitmentConfig,
	pub limits: PlanLimits,
}

impl Default for SagaConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_millis(400),
			confirm_attempts: 30,
			commitment: CommitmentConfig::confirmed(),
			limits: PlanLimits::default(),
		}
	}
}

/// Stops a running saga before its next step. Transactions already sent stay sent.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}

	fn check(&self) -> PaymentResult<()> {
		if self.is_cancelled() {
			return Err(PaymentError::Cancelled);
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct SentTransaction {
	pub ledger: Ledger,
	pub stage: String,
	pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SagaReceipt {
	pub saga_id: Uuid,
	pub deficit: u64,
	pub transactions: Vec<SentTransaction>,
	pub owner: TokenAccountState,
	pub counterparty: Option<TokenAccountState>,
}

/// Plans and drives transfers, withdrawals and single-step deposit actions
/// for the signing wallet.
pub struct PaymentSaga {
	ledgers: Ledgers,
	resolver: Arc<AccountResolver>,
	blockhashes: Arc<BlockhashCache>,
	signer: Arc<dyn WalletSigner>,
	metrics: Arc<Metrics>,
	config: SagaConfig,
}

impl PaymentSaga {
	pub fn new(
		ledgers: Ledgers,
		resolver: Arc<AccountResolver>,
		blockhashes: Arc<BlockhashCache>,
		signer: Arc<dyn WalletSigner>,
		metrics: Arc<Metrics>,
		config: SagaConfig,
	) -> Self {
		Self { ledgers, resolver, blockhashes, signer, metrics, config }
	}

	pub fn wallet(&self) -> Pubkey {
		self.signer.pubkey()
	}

	pub async fn transfer(&self, sender: Pubkey, recipient: Pubkey, mint: Pubkey, amount: u64) -> PaymentResult<SagaReceipt> {
		self.transfer_cancellable(sender, recipient, mint, amount, &Cancellation::new()).await
	}

	pub async fn transfer_cancellable(
		&self,
		sender: Pubkey,
		recipient: Pubkey,
		mint: Pubkey,
		amount: u64,
		cancel: &Cancellation,
	) -> PaymentResult<SagaReceipt> {
		let saga_id = Uuid::new_v4();
		let span = info_span!("transfer", %saga_id, %sender, %recipient, %mint, amount);
		let started = Instant::now();
		let result = self.run_transfer(saga_id, sender, recipient, mint, amount, cancel).instrument(span).await;
		self.record("transfer", started, &result);
		result
	}

	async fn run_transfer(
		&self,
		saga_id: Uuid,
		sender: Pubkey,
		recipient: Pubkey,
		mint: Pubkey,
		amount: u64,
		cancel: &Cancellation,
	) -> PaymentResult<SagaReceipt> {
		validate_amount(amount)?;
		if sender != self.signer.pubkey() {
			return Err(PaymentError::InvalidRequest("sender must be the signing wallet".to_string()));
		}
		cancel.check()?;
		info!(stage = "planning", "resolving parties");
		let (sender_state, recipient_state, vault) = tokio::try_join!(
			self.resolver.try_resolve(sender, mint),
			self.resolver.try_resolve(recipient, mint),
			self.resolver.resolve_vault(mint),
		)?;
		let plan = plan_transfer(self.resolver.factory(), &sender_state, &recipient_state, &vault, amount, &self.config.limits)?;
		info!(groups = plan.groups.len(), deficit = plan.deficit, "planned transfer");

		let transactions = self.execute(&plan, mint, cancel).await?;
		let (owner, counterparty) =
			tokio::join!(self.resolver.resolve(sender, mint), self.resolver.resolve(recipient, mint));
		info!(stage = "done", sender_balance = ?owner.effective_balance(), "transfer complete");
		Ok(SagaReceipt { saga_id, deficit: plan.deficit, transactions, owner, counterparty: Some(counterparty) })
	}

	pub async fn withdraw(&self, mint: Pubkey, amount: u64) -> PaymentResult<SagaReceipt> {
		self.withdraw_cancellable(mint, amount, &Cancellation::new()).await
	}

	pub async fn withdraw_cancellable(&self, mint: Pubkey, amount: u64, cancel: &Cancellation) -> PaymentResult<SagaReceipt> {
		let saga_id = Uuid::new_v4();
		let owner = self.signer.pubkey();
		let span = info_span!("withdraw", %saga_id, %owner, %mint, amount);
		let started = Instant::now();
		let result = self.run_withdraw(saga_id, owner, mint, amount, cancel).instrument(span).await;
		self.record("withdraw", started, &result);
		result
	}

	async fn run_withdraw(
		&self,
		saga_id: Uuid,
		owner: Pubkey,
		mint: Pubkey,
		amount: u64,
		cancel: &Cancellation,
	) -> PaymentResult<SagaReceipt> {
		validate_amount(amount)?;
		cancel.check()?;
		info!(stage = "planning", "resolving owner");
		let state = self.resolver.try_resolve(owner, mint).await?;
		let plan = plan_withdraw(self.resolver.factory(), &state, amount, &self.config.limits)?;
		info!(groups = plan.groups.len(), delegated = state.is_delegated, "planned withdrawal");

		let transactions = self.execute(&plan, mint, cancel).await?;
		let owner_state = self.resolver.resolve(owner, mint).await;
		info!(stage = "done", balance = ?owner_state.effective_balance(), "withdrawal complete");
		Ok(SagaReceipt { saga_id, deficit: 0, transactions, owner: owner_state, counterparty: None })
	}

	pub async fn manage_deposit(&self, mint: Pubkey, action: DepositAction) -> PaymentResult<SagaReceipt> {
		self.manage_deposit_cancellable(mint, action, &Cancellation::new()).await
	}

	pub async fn manage_deposit_cancellable(
		&self,
		mint: Pubkey,
		action: DepositAction,
		cancel: &Cancellation,
	) -> PaymentResult<SagaReceipt> {
		let saga_id = Uuid::new_v4();
		let wallet = self.signer.pubkey();
		let span = info_span!("deposit", %saga_id, action = action.name(), %wallet, %mint);
		let started = Instant::now();
		let result = self.run_deposit_action(saga_id, wallet, mint, action, cancel).instrument(span).await;
		self.record("deposit", started, &result);
		result
	}

	async fn run_deposit_action(
		&self,
		saga_id: Uuid,
		wallet: Pubkey,
		mint: Pubkey,
		action: DepositAction,
		cancel: &Cancellation,
	) -> PaymentResult<SagaReceipt> {
		action.validate(&wallet)?;
		cancel.check()?;
		let subject = action.subject(wallet);
		info!(stage = "planning", %subject, "resolving deposit");
		let subject_state = self.resolver.try_resolve(subject, mint).await?;
		let counterparty_state = match action.counterparty() {
			Some(other) => Some(self.resolver.try_resolve(other, mint).await?),
			None => None,
		};
		let vault = match action {
			DepositAction::Deposit { .. } => Some(self.resolver.resolve_vault(mint).await?),
			_ => None,
		};
		let plan = plan_deposit_action(
			self.resolver.factory(),
			&wallet,
			&action,
			&subject_state,
			counterparty_state.as_ref(),
			vault.as_ref(),
			&self.config.limits,
		)?;

		let transactions = self.execute(&plan, mint, cancel).await?;
		let owner = self.resolver.resolve(subject, mint).await;
		let counterparty = match action.counterparty() {
			Some(other) => Some(self.resolver.resolve(other, mint).await),
			None => None,
		};
		info!(stage = "done", balance = ?owner.effective_balance(), "deposit action complete");
		Ok(SagaReceipt { saga_id, deficit: 0, transactions, owner, counterparty })
	}

	async fn execute(&self, plan: &TransferPlan, mint: Pubkey, cancel: &Cancellation) -> PaymentResult<Vec<SentTransaction>> {
		cancel.check()?;
		let signed = self.sign_plan(plan).await?;
		let mut sent = Vec::with_capacity(signed.len());
		for (group, tx) in plan.groups.iter().zip(signed) {
			cancel.check()?;
			info!(stage = %group.stage, ledger = %group.ledger, instructions = group.instructions.len(), "sending group");
			let signature = self.send_and_confirm(group.ledger, &tx).await?;
			sent.push(SentTransaction { ledger: group.ledger, stage: group.stage.to_string(), signature: signature.to_string() });
			self.converge(group, mint, cancel).await?;
		}
		Ok(sent)
	}

	/// One signing round per ledger, in order of first appearance in the plan.
	async fn sign_plan(&self, plan: &TransferPlan) -> PaymentResult<Vec<Transaction>> {
		let payer = self.signer.pubkey();
		let mut ledgers: Vec<Ledger> = Vec::new();
		for group in &plan.groups {
			if !ledgers.contains(&group.ledger) {
				ledgers.push(group.ledger);
			}
		}

		let mut slots: Vec<Option<Transaction>> = vec![None; plan.groups.len()];
		for ledger in ledgers {
			let entry = self.blockhashes.get(ledger).await?;
			if !entry.is_fresh() {
				warn!(%ledger, "signing with a stale blockhash");
			}
			let indices: Vec<usize> = (0..plan.groups.len()).filter(|&i| plan.groups[i].ledger == ledger).collect();
			let unsigned: Vec<Transaction> = indices
				.iter()
				.map(|&i| {
					let mut message = Message::new(&plan.groups[i].instructions, Some(&payer));
					message.recent_blockhash = entry.blockhash;
					Transaction::new_unsigned(message)
				})
				.collect();
			let signed = self.signer.sign_transactions(unsigned).await?;
			if signed.len() != indices.len() {
				return Err(PaymentError::Rejection(format!(
					"signer returned {} of {} transactions",
					signed.len(),
					indices.len()
				)));
			}
			for (i, tx) in indices.into_iter().zip(signed) {
				slots[i] = Some(tx);
			}
		}
		slots
			.into_iter()
			.collect::<Option<Vec<_>>>()
			.ok_or_else(|| PaymentError::Internal("unsigned transaction group".to_string()))
	}

	async fn send_and_confirm(&self, ledger: Ledger, tx: &Transaction) -> PaymentResult<Signature> {
		let bytes = bincode::serialize(tx).map_err(|e| PaymentError::Internal(format!("serialize tx: {e}")))?;
		let client = self.ledgers.client(ledger).clone();
		let signature = match client.send_raw_transaction(&bytes).await {
			Ok(sig) => sig,
			Err(e) => {
				self.metrics.transaction_failures.inc();
				return Err(e);
			}
		};
		self.metrics.transactions_sent.inc();
		// A blockhash signs each message once; identical follow-ups need a new one.
		self.blockhashes.invalidate(ledger).await;
		debug!(%ledger, %signature, "transaction sent");

		let commitment = self.config.commitment;
		let policy = RetryPolicy::new(self.config.confirm_attempts, self.config.poll_interval);
		let outcome = retry_until(policy, move |_| {
			let client = client.clone();
			async move {
				match client.confirm_transaction(&signature, commitment).await {
					Ok(Confirmation::Confirmed) => Some(Ok(())),
					Ok(Confirmation::Failed(reason)) => Some(Err(reason)),
					Ok(Confirmation::Pending) => None,
					Err(e) => {
						debug!(%signature, error = %e, "confirmation poll failed");
						None
					}
				}
			}
		})
		.await;
		match outcome {
			Ok(Ok(())) => Ok(signature),
			Ok(Err(reason)) => {
				self.metrics.transaction_failures.inc();
				Err(PaymentError::TransactionFailed { ledger, signature: signature.to_string(), reason })
			}
			Err(exhausted) => {
				self.metrics.transaction_failures.inc();
				Err(PaymentError::ConfirmationTimeout { ledger, signature: signature.to_string(), attempts: exhausted.attempts })
			}
		}
	}

	/// Polls the resolver until every expectation of `group` holds.
	async fn converge(&self, group: &TxGroup, mint: Pubkey, cancel: &Cancellation) -> PaymentResult<()> {
		if group.awaits.is_empty() {
			return Ok(());
		}
		let mut owners: Vec<Pubkey> = group.awaits.iter().map(|e| e.owner).collect();
		owners.sort();
		owners.dedup();
		info!(stage = %group.stage, "awaiting convergence");
		let policy = RetryPolicy::new(group.max_wait_attempts, self.config.poll_interval);
		let owners = &owners;
		let outcome = retry_until(policy, |attempt| async move {
			if cancel.is_cancelled() {
				return Some(Err(PaymentError::Cancelled));
			}
			self.metrics.convergence_polls.inc();
			let mut states: HashMap<Pubkey, TokenAccountState> = HashMap::with_capacity(owners.len());
			for owner in owners {
				states.insert(*owner, self.resolver.resolve(*owner, mint).await);
			}
			let converged = group
				.awaits
				.iter()
				.all(|e| states.get(&e.owner).is_some_and(|s| e.condition.holds(s)));
			if !converged {
				debug!(stage = %group.stage, attempt, "not converged yet");
			}
			converged.then_some(Ok(()))
		})
		.await;
		match outcome {
			Ok(result) => result,
			Err(exhausted) => {
				warn!(stage = %group.stage, attempts = exhausted.attempts, "state never converged");
				Err(PaymentError::ConvergenceTimeout { stage: group.stage.to_string(), attempts: exhausted.attempts })
			}
		}
	}

	fn record(&self, kind: &str, started: Instant, result: &PaymentResult<SagaReceipt>) {
		self.metrics.saga_duration.observe(started.elapsed().as_secs_f64());
		match result {
			Ok(_) => match kind {
				"transfer" => self.metrics.transfers.inc(),
				"withdraw" => self.metrics.withdrawals.inc(),
				_ => self.metrics.deposit_actions.inc(),
			},
			Err(e) => {
				self.metrics.saga_failures.inc();
				warn!(kind, error = %e, pre_network = e.is_pre_network(), "saga failed");
			}
		}
	}
}
