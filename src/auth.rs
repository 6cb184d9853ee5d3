//! Challenge/login against a private rollup endpoint. Tokens are cached per
//! wallet in the key-value store so other observers see them too.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::error::{PaymentError, PaymentResult};
use crate::ledger::Ledger;
use crate::signer::WalletSigner;
use crate::store::{get_json, set_json, KeyValueStore};

pub const AUTH_TOKENS_KEY: &str = "private-rollup-auth-tokens";
/// Lifetime assumed when the login response carries no expiry.
const SESSION_DURATION_MS: i64 = 30 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
	pub token: String,
	/// Unix milliseconds.
	pub expires_at: i64,
}

impl AuthToken {
	pub fn is_valid(&self) -> bool {
		self.expires_at > now_ms()
	}

	/// Time left before expiry; zero once expired.
	pub fn remaining(&self) -> Duration {
		Duration::from_millis(self.expires_at.saturating_sub(now_ms()).max(0) as u64)
	}
}

/// Resolves once `token` has expired, logging an error. Rollup connections
/// opened with the token stop authorizing at that point.
pub async fn expiry_alarm(token: AuthToken) {
	tokio::time::sleep(token.remaining()).await;
	error!(expires_at = token.expires_at, "private rollup token expired; restart to re-authenticate");
}

#[derive(Deserialize)]
struct ChallengeResponse {
	challenge: Option<String>,
	error: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
	pubkey: String,
	challenge: &'a str,
	signature: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
	token: Option<String>,
	expires_at: Option<i64>,
	error: Option<String>,
}

fn now_ms() -> i64 {
	(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Appends the auth token to a rollup RPC url.
pub fn authorized_url(url: &str, token: &str) -> String {
	let sep = if url.contains('?') { '&' } else { '?' };
	format!("{url}{sep}token={token}")
}

pub struct RollupAuth {
	http: reqwest::Client,
	rollup_url: String,
	store: Arc<dyn KeyValueStore>,
	signer: Arc<dyn WalletSigner>,
}

impl RollupAuth {
	pub fn new(rollup_url: &str, store: Arc<dyn KeyValueStore>, signer: Arc<dyn WalletSigner>) -> Self {
		Self { http: reqwest::Client::new(), rollup_url: rollup_url.trim_end_matches('/').to_string(), store, signer }
	}

	fn err(&self, e: impl std::fmt::Display) -> PaymentError {
		PaymentError::connectivity(Ledger::Rollup, e)
	}

	async fn tokens(&self) -> PaymentResult<HashMap<String, AuthToken>> {
		Ok(get_json(self.store.as_ref(), AUTH_TOKENS_KEY).await?.unwrap_or_default())
	}

	async fn cached_session(&self) -> PaymentResult<Option<AuthToken>> {
		let pubkey = self.signer.pubkey().to_string();
		Ok(self.tokens().await?.remove(&pubkey).filter(AuthToken::is_valid))
	}

	/// The wallet's unexpired token, if one is cached.
	pub async fn cached_token(&self) -> PaymentResult<Option<String>> {
		Ok(self.cached_session().await?.map(|t| t.token))
	}

	/// Cached session when still valid, otherwise a fresh login.
	pub async fn session(&self) -> PaymentResult<AuthToken> {
		match self.cached_session().await? {
			Some(session) => Ok(session),
			None => self.authenticate().await,
		}
	}

	pub async fn token(&self) -> PaymentResult<String> {
		Ok(self.session().await?.token)
	}

	pub async fn authenticate(&self) -> PaymentResult<AuthToken> {
		let pubkey = self.signer.pubkey().to_string();
		let challenge: ChallengeResponse = self
			.http
			.get(format!("{}/auth/challenge", self.rollup_url))
			.query(&[("pubkey", pubkey.as_str())])
			.send()
			.await
			.map_err(|e| self.err(format!("challenge request failed: {e}")))?
			.json()
			.await
			.map_err(|e| self.err(format!("challenge response: {e}")))?;
		let challenge = match challenge {
			ChallengeResponse { challenge: Some(challenge), error: None } => challenge,
			ChallengeResponse { error, .. } => {
				warn!(%pubkey, error = ?error, "rollup refused challenge");
				return Err(PaymentError::AccessDenied { owner: pubkey });
			}
		};

		let signature = self.signer.sign_message(challenge.as_bytes()).await?;
		let request = LoginRequest {
			pubkey: pubkey.clone(),
			challenge: &challenge,
			signature: bs58::encode(signature.as_ref()).into_string(),
		};
		let resp = self
			.http
			.post(format!("{}/auth/login", self.rollup_url))
			.json(&request)
			.send()
			.await
			.map_err(|e| self.err(format!("login request failed: {e}")))?;
		let status = resp.status();
		let login: LoginResponse = resp.json().await.map_err(|e| self.err(format!("login response: {e}")))?;
		let token = match login.token {
			Some(token) if status.is_success() => token,
			_ => {
				warn!(%pubkey, %status, error = ?login.error, "rollup login refused");
				return Err(PaymentError::AccessDenied { owner: pubkey });
			}
		};
		let auth = AuthToken { token, expires_at: login.expires_at.unwrap_or_else(|| now_ms() + SESSION_DURATION_MS) };

		let mut tokens = self.tokens().await?;
		tokens.insert(pubkey.clone(), auth.clone());
		set_json(self.store.as_ref(), AUTH_TOKENS_KEY, &tokens).await?;
		info!(%pubkey, expires_at = auth.expires_at, "authenticated with private rollup");
		Ok(auth)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_authorized_url() {
		assert_eq!(authorized_url("https://er.example", "abc"), "https://er.example?token=abc");
		assert_eq!(authorized_url("https://er.example?x=1", "abc"), "https://er.example?x=1&token=abc");
	}

	#[test]
	fn test_token_expiry() {
		assert!(AuthToken { token: "t".into(), expires_at: now_ms() + 60_000 }.is_valid());
		assert!(!AuthToken { token: "t".into(), expires_at: now_ms() - 1 }.is_valid());
	}

	#[test]
	fn test_remaining_is_zero_once_expired() {
		assert_eq!(AuthToken { token: "t".into(), expires_at: 1 }.remaining(), Duration::ZERO);
		let live = AuthToken { token: "t".into(), expires_at: now_ms() + 60_000 };
		assert!(live.remaining() > Duration::from_secs(50));
	}

	#[tokio::test]
	async fn test_expiry_alarm_fires_for_an_expired_token() {
		let expired = AuthToken { token: "t".into(), expires_at: now_ms() - 1_000 };
		let fired = tokio::time::timeout(Duration::from_secs(1), expiry_alarm(expired)).await;
		assert!(fired.is_ok());

		let live = AuthToken { token: "t".into(), expires_at: now_ms() + 60_000 };
		let fired = tokio::time::timeout(Duration::from_millis(20), expiry_alarm(live)).await;
		assert!(fired.is_err());
	}

	#[test]
	fn test_token_json_shape() {
		let t: AuthToken = serde_json::from_str(r#"{"token":"t","expiresAt":5}"#).unwrap();
		assert_eq!(t.expires_at, 5);
	}
}
