pub mod api;
pub mod auth;
pub mod blockhash;
pub mod config;
pub mod error;
pub mod instructions;
pub mod ledger;
pub mod metrics;
pub mod plan;
pub mod records;
pub mod resolver;
pub mod retry;
pub mod saga;
pub mod signer;
pub mod solana_client;
pub mod store;
pub mod subscription;
pub mod tasks;
pub mod telemetry;
pub mod tokens;
