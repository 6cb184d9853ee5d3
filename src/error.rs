use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

use crate::ledger::Ledger;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
	#[error("{ledger} ledger unreachable: {message}")]
	Connectivity { ledger: Ledger, message: String },
	#[error("Signer rejected the request: {0}")]
	Rejection(String),
	#[error("Transaction {signature} on {ledger} ledger not confirmed after {attempts} attempts")]
	ConfirmationTimeout { ledger: Ledger, signature: String, attempts: u32 },
	#[error("Transaction {signature} failed on {ledger} ledger: {reason}")]
	TransactionFailed { ledger: Ledger, signature: String, reason: String },
	#[error("State did not converge after {attempts} attempts while {stage}")]
	ConvergenceTimeout { stage: String, attempts: u32 },
	#[error("Insufficient balance: requested {requested}, available {available}")]
	InsufficientBalance { requested: u64, available: u64 },
	#[error("Rollup balance of {owner} is not readable")]
	AccessDenied { owner: String },
	#[error("Unexpected layout for account {address}: {reason}")]
	Decode { address: String, reason: String },
	#[error("Invalid request: {0}")]
	InvalidRequest(String),
	#[error("Operation cancelled")]
	Cancelled,
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Internal error: {0}")]
	Internal(String),
}

impl PaymentError {
	pub fn connectivity(ledger: Ledger, err: impl std::fmt::Display) -> Self {
		PaymentError::Connectivity { ledger, message: err.to_string() }
	}

	pub fn decode(address: &impl std::fmt::Display, reason: impl Into<String>) -> Self {
		PaymentError::Decode { address: address.to_string(), reason: reason.into() }
	}

	/// Errors raised before anything was written to either ledger.
	pub fn is_pre_network(&self) -> bool {
		matches!(
			self,
			PaymentError::InvalidRequest(_)
				| PaymentError::InsufficientBalance { .. }
				| PaymentError::AccessDenied { .. }
		)
	}
}

#[derive(Serialize)]
struct ErrorBody {
	code: u16,
	message: String,
}

impl IntoResponse for PaymentError {
	fn into_response(self) -> axum::response::Response {
		let status = match &self {
			PaymentError::Connectivity { .. } => StatusCode::BAD_GATEWAY,
			PaymentError::Rejection(_) => StatusCode::FORBIDDEN,
			PaymentError::ConfirmationTimeout { .. } | PaymentError::ConvergenceTimeout { .. } => {
				StatusCode::GATEWAY_TIMEOUT
			}
			PaymentError::TransactionFailed { .. } => StatusCode::BAD_GATEWAY,
			PaymentError::InsufficientBalance { .. } | PaymentError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
			PaymentError::AccessDenied { .. } => StatusCode::CONFLICT,
			PaymentError::Decode { .. } => StatusCode::UNPROCESSABLE_ENTITY,
			PaymentError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
			PaymentError::Config(_) | PaymentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let body = Json(ErrorBody { code: status.as_u16(), message: self.to_string() });
		(status, body).into_response()
	}
}

pub type PaymentResult<T> = Result<T, PaymentError>;
