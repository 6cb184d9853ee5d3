use std::str::FromStr;

use axum::{
	extract::{Path, State},
	http::{header, StatusCode},
	response::IntoResponse,
	Json,
};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use tracing::info;

use super::AppState;
use crate::{
	error::{PaymentError, PaymentResult},
	plan::DepositAction,
	resolver::TokenAccountState,
	saga::SagaReceipt,
	tokens::TokenListEntry,
};

fn parse_pubkey(field: &str, value: &str) -> PaymentResult<Pubkey> {
	Pubkey::from_str(value).map_err(|_| PaymentError::InvalidRequest(format!("invalid {field}")))
}

pub async fn health() -> Json<serde_json::Value> {
	Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
pub struct AccountView {
	#[serde(flatten)]
	pub state: TokenAccountState,
	pub effective_balance: Option<u64>,
	pub access_denied: bool,
}

pub async fn account_state(
	State(state): State<AppState>,
	Path((owner, mint)): Path<(String, String)>,
) -> PaymentResult<Json<AccountView>> {
	let owner = parse_pubkey("owner", &owner)?;
	let mint = parse_pubkey("mint", &mint)?;
	let resolved = state.resolver.resolve(owner, mint).await;
	Ok(Json(AccountView {
		effective_balance: resolved.effective_balance(),
		access_denied: resolved.access_denied(),
		state: resolved,
	}))
}

#[derive(Deserialize)]
pub struct TransferRequest {
	pub recipient: String,
	pub mint: String,
	pub amount: u64,
}

pub async fn transfer(State(state): State<AppState>, Json(req): Json<TransferRequest>) -> PaymentResult<Json<SagaReceipt>> {
	let recipient = parse_pubkey("recipient", &req.recipient)?;
	let mint = parse_pubkey("mint", &req.mint)?;
	let sender = state.saga.wallet();
	info!(%sender, %recipient, %mint, amount = req.amount, "transfer requested");
	let receipt = state.saga.transfer(sender, recipient, mint, req.amount).await?;
	Ok(Json(receipt))
}

#[derive(Deserialize)]
pub struct WithdrawRequest {
	pub mint: String,
	pub amount: u64,
}

pub async fn withdraw(State(state): State<AppState>, Json(req): Json<WithdrawRequest>) -> PaymentResult<Json<SagaReceipt>> {
	let mint = parse_pubkey("mint", &req.mint)?;
	info!(owner = %state.saga.wallet(), %mint, amount = req.amount, "withdrawal requested");
	let receipt = state.saga.withdraw(mint, req.amount).await?;
	Ok(Json(receipt))
}

#[derive(Deserialize)]
pub struct DepositOwnerRequest {
	pub mint: String,
	/// Defaults to the signing wallet.
	pub owner: Option<String>,
}

#[derive(Deserialize)]
pub struct DepositTransferRequest {
	pub recipient: String,
	pub mint: String,
	pub amount: u64,
	#[serde(default)]
	pub delegated: bool,
}

#[derive(Deserialize)]
pub struct MintRequest {
	pub mint: String,
}

async fn run_deposit_action(state: &AppState, mint: Pubkey, action: DepositAction) -> PaymentResult<Json<SagaReceipt>> {
	info!(owner = %state.saga.wallet(), %mint, action = action.name(), "deposit action requested");
	let receipt = state.saga.manage_deposit(mint, action).await?;
	Ok(Json(receipt))
}

fn owner_or_wallet(state: &AppState, owner: Option<&str>) -> PaymentResult<Pubkey> {
	match owner {
		Some(owner) => parse_pubkey("owner", owner),
		None => Ok(state.saga.wallet()),
	}
}

pub async fn initialize_deposit(
	State(state): State<AppState>,
	Json(req): Json<DepositOwnerRequest>,
) -> PaymentResult<Json<SagaReceipt>> {
	let mint = parse_pubkey("mint", &req.mint)?;
	let owner = owner_or_wallet(&state, req.owner.as_deref())?;
	run_deposit_action(&state, mint, DepositAction::Initialize { owner }).await
}

pub async fn fund_deposit(State(state): State<AppState>, Json(req): Json<WithdrawRequest>) -> PaymentResult<Json<SagaReceipt>> {
	let mint = parse_pubkey("mint", &req.mint)?;
	run_deposit_action(&state, mint, DepositAction::Deposit { amount: req.amount }).await
}

pub async fn withdraw_deposit(State(state): State<AppState>, Json(req): Json<WithdrawRequest>) -> PaymentResult<Json<SagaReceipt>> {
	let mint = parse_pubkey("mint", &req.mint)?;
	run_deposit_action(&state, mint, DepositAction::Withdraw { amount: req.amount }).await
}

pub async fn transfer_deposit(
	State(state): State<AppState>,
	Json(req): Json<DepositTransferRequest>,
) -> PaymentResult<Json<SagaReceipt>> {
	let recipient = parse_pubkey("recipient", &req.recipient)?;
	let mint = parse_pubkey("mint", &req.mint)?;
	let action = DepositAction::Transfer { recipient, amount: req.amount, delegated: req.delegated };
	run_deposit_action(&state, mint, action).await
}

pub async fn delegate_deposit(
	State(state): State<AppState>,
	Json(req): Json<DepositOwnerRequest>,
) -> PaymentResult<Json<SagaReceipt>> {
	let mint = parse_pubkey("mint", &req.mint)?;
	let owner = owner_or_wallet(&state, req.owner.as_deref())?;
	run_deposit_action(&state, mint, DepositAction::Delegate { owner }).await
}

pub async fn undelegate_deposit(State(state): State<AppState>, Json(req): Json<MintRequest>) -> PaymentResult<Json<SagaReceipt>> {
	let mint = parse_pubkey("mint", &req.mint)?;
	run_deposit_action(&state, mint, DepositAction::Undelegate).await
}

#[derive(Serialize)]
pub struct TokensResponse {
	pub tokens: Vec<TokenListEntry>,
	pub selected: Option<TokenListEntry>,
}

pub async fn list_tokens(State(state): State<AppState>) -> PaymentResult<Json<TokensResponse>> {
	let tokens = state.tokens.list().await?;
	let selected = state.tokens.selected().await?;
	Ok(Json(TokensResponse { tokens, selected }))
}

#[derive(Deserialize)]
pub struct AddTokenRequest {
	pub mint: String,
	pub creator: String,
	#[serde(default)]
	pub select: bool,
}

pub async fn add_token(State(state): State<AppState>, Json(req): Json<AddTokenRequest>) -> PaymentResult<impl IntoResponse> {
	parse_pubkey("mint", &req.mint)?;
	let entry = TokenListEntry { mint: req.mint, creator: req.creator };
	let added = state.tokens.add(entry.clone()).await?;
	if req.select {
		state.tokens.select(Some(&entry)).await?;
	}
	let status = if added { StatusCode::CREATED } else { StatusCode::OK };
	Ok((status, Json(serde_json::json!({ "added": added, "mint": entry.mint }))))
}

pub async fn metrics(State(state): State<AppState>) -> PaymentResult<impl IntoResponse> {
	let body = state.metrics.render().map_err(|e| PaymentError::Internal(e.to_string()))?;
	Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
