use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use dotenvy::dotenv;
use solana_sdk::commitment_config::CommitmentConfig;
use tracing::{info, warn};

use ephemeral_payments::{
	api::{self, AppState},
	auth::{authorized_url, expiry_alarm, RollupAuth},
	blockhash::BlockhashCache,
	config::AppConfig,
	instructions::InstructionFactory,
	ledger::{Ledger, Ledgers},
	metrics::Metrics,
	resolver::AccountResolver,
	saga::PaymentSaga,
	signer::{KeypairSigner, WalletSigner},
	solana_client::RpcLedgerClient,
	store::{KeyValueStore, MemoryStore, RedisStore},
	subscription::SubscriptionRegistry,
	tasks::balance_monitor::run_balance_monitor,
	telemetry::init_tracing,
	tokens::TokenRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
	// Load environment variables from .env if present
	dotenv().ok();
	init_tracing();

	let cfg = AppConfig::from_env()?;
	let signer: Arc<dyn WalletSigner> = Arc::new(KeypairSigner::load(&cfg.wallet_keypair_path)?);
	let wallet = signer.pubkey();

	let store: Arc<dyn KeyValueStore> = match &cfg.redis_url {
		Some(url) => Arc::new(RedisStore::new(url, "ephemeral-payments")?),
		None => Arc::new(MemoryStore::default()),
	};

	let (mut rollup_rpc, mut rollup_ws) = (cfg.rollup_rpc_url.clone(), cfg.rollup_ws_url.clone());
	let mut token_alarm = None;
	if cfg.rollup_auth {
		let auth = RollupAuth::new(&cfg.rollup_rpc_url, store.clone(), signer.clone());
		let session = auth.session().await?;
		info!(expires_at = session.expires_at, remaining_secs = session.remaining().as_secs(), "private rollup session");
		rollup_rpc = authorized_url(&rollup_rpc, &session.token);
		rollup_ws = authorized_url(&rollup_ws, &session.token);
		token_alarm = Some(tokio::spawn(expiry_alarm(session)));
	}

	let commitment = CommitmentConfig::confirmed();
	let ledgers = Ledgers::new(
		Arc::new(RpcLedgerClient::new(Ledger::Base, &cfg.base_rpc_url, &cfg.base_ws_url, commitment)),
		Arc::new(RpcLedgerClient::new(Ledger::Rollup, &rollup_rpc, &rollup_ws, commitment)),
	);

	let factory = Arc::new(InstructionFactory::new(cfg.program_ids.clone()));
	let registry = Arc::new(SubscriptionRegistry::new(ledgers.clone()));
	let resolver = Arc::new(AccountResolver::new(ledgers.clone(), factory, registry));
	let blockhashes = Arc::new(BlockhashCache::new(ledgers.clone(), cfg.blockhash_ttl));
	let renewal = match blockhashes.start_renewal(cfg.blockhash_refresh_slots).await {
		Ok(handle) => Some(handle),
		Err(e) => {
			warn!(error = %e, "blockhash renewal unavailable; fetching on demand");
			None
		}
	};

	let metrics = Metrics::new()?;
	let saga = Arc::new(PaymentSaga::new(
		ledgers,
		resolver.clone(),
		blockhashes,
		signer,
		metrics.clone(),
		cfg.saga_config(),
	));
	let tokens = TokenRegistry::new(store);
	let monitor = tokio::spawn(run_balance_monitor(resolver.clone(), tokens.clone(), wallet));

	let app = api::router(AppState { resolver, saga, tokens, metrics });
	let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
	info!(%addr, %wallet, "starting server");
	axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
		})
		.await?;

	monitor.abort();
	if let Some(alarm) = token_alarm {
		alarm.abort();
	}
	if let Some(renewal) = renewal {
		renewal.stop().await;
	}
	Ok(())
}
