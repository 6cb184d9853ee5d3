use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Used when `RUST_LOG` is unset; quiets the RPC and pubsub clients.
pub const DEFAULT_DIRECTIVES: &str = "info,solana_client=warn,solana_pubsub_client=warn,hyper=warn,reqwest=warn";

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVES))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_tracing() {
    let fmt_layer = fmt::layer().with_target(true).with_level(true);
    let subscriber = Registry::default().with(env_filter()).with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}
