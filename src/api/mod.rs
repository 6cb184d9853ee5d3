use std::sync::Arc;

use axum::{routing::{get, post}, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{metrics::Metrics, resolver::AccountResolver, saga::PaymentSaga, tokens::TokenRegistry};

mod routes;

#[derive(Clone)]
pub struct AppState {
	pub resolver: Arc<AccountResolver>,
	pub saga: Arc<PaymentSaga>,
	pub tokens: TokenRegistry,
	pub metrics: Arc<Metrics>,
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(routes::health))
		.route("/accounts/:owner/:mint", get(routes::account_state))
		.route("/transfer", post(routes::transfer))
		.route("/withdraw", post(routes::withdraw))
		.route("/deposits/initialize", post(routes::initialize_deposit))
		.route("/deposits/fund", post(routes::fund_deposit))
		.route("/deposits/withdraw", post(routes::withdraw_deposit))
		.route("/deposits/transfer", post(routes::transfer_deposit))
		.route("/deposits/delegate", post(routes::delegate_deposit))
		.route("/deposits/undelegate", post(routes::undelegate_deposit))
		.route("/tokens", get(routes::list_tokens).post(routes::add_token))
		.route("/metrics", get(routes::metrics))
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.with_state(state)
}
