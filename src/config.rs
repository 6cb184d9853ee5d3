use std::str::FromStr;
use std::time::Duration;

use solana_sdk::pubkey::Pubkey;

use crate::error::{PaymentError, PaymentResult};
use crate::instructions::ProgramIds;
use crate::plan::PlanLimits;
use crate::saga::SagaConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
	pub host: String,
	pub port: u16,
	pub base_rpc_url: String,
	pub base_ws_url: String,
	pub rollup_rpc_url: String,
	pub rollup_ws_url: String,
	pub program_ids: ProgramIds,
	pub wallet_keypair_path: String,
	pub redis_url: Option<String>,
	pub blockhash_ttl: Duration,
	pub blockhash_refresh_slots: u64,
	pub poll_interval: Duration,
	pub confirm_attempts: u32,
	pub transfer_undelegate_attempts: u32,
	pub withdraw_undelegate_attempts: u32,
	pub convergence_attempts: u32,
	/// When set, the rollup requires an auth token obtained through challenge/login.
	pub rollup_auth: bool,
}

fn var_or(key: &str, default: &str) -> String {
	std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
	std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn pubkey_var(key: &str, default: Option<Pubkey>) -> PaymentResult<Pubkey> {
	match std::env::var(key) {
		Ok(v) => Pubkey::from_str(v.trim()).map_err(|e| PaymentError::Config(format!("{key}: {e}"))),
		Err(_) => default.ok_or_else(|| PaymentError::Config(format!("{key} must be set"))),
	}
}

fn ws_default(rpc_url: &str) -> String {
	rpc_url.replace("https://", "wss://").replace("http://", "ws://")
}

impl AppConfig {
	pub fn from_env() -> PaymentResult<Self> {
		let base_rpc_url = var_or("BASE_RPC_URL", "https://api.devnet.solana.com");
		let rollup_rpc_url = var_or("ROLLUP_RPC_URL", "https://devnet.magicblock.app");
		let program_ids = ProgramIds {
			token_program: pubkey_var("TOKEN_PROGRAM_ID", None)?,
			delegation_program: pubkey_var("DELEGATION_PROGRAM_ID", None)?,
			permission_program: pubkey_var("PERMISSION_PROGRAM_ID", None)?,
			validator: pubkey_var("VALIDATOR_ID", None)?,
		};
		let defaults = PlanLimits::default();
		Ok(Self {
			host: var_or("HOST", "0.0.0.0"),
			port: parsed_or("PORT", 8080),
			base_ws_url: std::env::var("BASE_WS_URL").unwrap_or_else(|_| ws_default(&base_rpc_url)),
			rollup_ws_url: std::env::var("ROLLUP_WS_URL").unwrap_or_else(|_| ws_default(&rollup_rpc_url)),
			base_rpc_url,
			rollup_rpc_url,
			program_ids,
			wallet_keypair_path: var_or("WALLET_KEYPAIR_PATH", "wallet.json"),
			redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
			blockhash_ttl: Duration::from_secs(parsed_or("BLOCKHASH_TTL_SECS", 30)),
			blockhash_refresh_slots: parsed_or("BLOCKHASH_REFRESH_SLOTS", 10),
			poll_interval: Duration::from_millis(parsed_or("POLL_INTERVAL_MS", 400)),
			confirm_attempts: parsed_or("CONFIRM_ATTEMPTS", 30),
			transfer_undelegate_attempts: parsed_or("TRANSFER_UNDELEGATE_ATTEMPTS", defaults.transfer_undelegate_attempts),
			withdraw_undelegate_attempts: parsed_or("WITHDRAW_UNDELEGATE_ATTEMPTS", defaults.withdraw_undelegate_attempts),
			convergence_attempts: parsed_or("CONVERGENCE_ATTEMPTS", defaults.convergence_attempts),
			rollup_auth: parsed_or("ROLLUP_AUTH", false),
		})
	}

	pub fn saga_config(&self) -> SagaConfig {
		SagaConfig {
			poll_interval: self.poll_interval,
			confirm_attempts: self.confirm_attempts,
			limits: PlanLimits {
				transfer_undelegate_attempts: self.transfer_undelegate_attempts,
				withdraw_undelegate_attempts: self.withdraw_undelegate_attempts,
				convergence_attempts: self.convergence_attempts,
			},
			..SagaConfig::default()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_ws_default_follows_scheme() {
		assert_eq!(ws_default("https://rpc.example"), "wss://rpc.example");
		assert_eq!(ws_default("http://localhost:8899"), "ws://localhost:8899");
	}

	#[test]
	fn test_invalid_pubkey_is_config_error() {
		std::env::set_var("CONFIG_TEST_BAD_KEY", "not-a-key");
		let err = pubkey_var("CONFIG_TEST_BAD_KEY", None).unwrap_err();
		assert!(matches!(err, PaymentError::Config(_)));
		let fallback = Pubkey::new_unique();
		assert_eq!(pubkey_var("CONFIG_TEST_UNSET_KEY", Some(fallback)).unwrap(), fallback);
	}
}
