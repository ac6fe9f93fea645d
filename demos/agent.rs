//! Example paying agent.
//!
//! Calls a priced endpoint, pays the 402 challenge on-chain from its own key
//! and retries with the transaction hash.
//!
//! Run with:
//! ```bash
//! cargo run --example agent
//! ```
//!
//! Environment variables:
//! - APTOS_PRIVATE_KEY: Key that pays for requests (required)
//! - APTOS_NODE_URL: Fullnode REST endpoint
//! - API_URL: The protected endpoint (default: http://localhost:3000/api/scan)
//! - MAX_OCTAS: Refuse challenges above this amount (default: 1000000)

use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use x402_gate::client::X402Client;
use x402_gate::ledger::aptos::AptosClient;
use x402_gate::utils::{decode_payment_response, octas_to_apt};
use x402_gate::{GateConfig, TransactionSubmitter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GateConfig::from_env()?;
    if config.private_key.is_none() {
        anyhow::bail!("APTOS_PRIVATE_KEY must be set for the agent to pay");
    }
    let api_url = std::env::var("API_URL").unwrap_or_else(|_| "http://localhost:3000/api/scan".to_string());
    let max_octas: u128 = std::env::var("MAX_OCTAS")
        .unwrap_or_else(|_| "1000000".to_string())
        .parse()?;

    let ledger = Arc::new(AptosClient::new(&config.node_url)?);
    let submitter = Arc::new(TransactionSubmitter::new(
        ledger,
        config.private_key.clone(),
        config.submitter.clone(),
    ));

    let address = submitter.address().await?;
    let balance = submitter.balance().await?;
    tracing::info!(%address, balance = %octas_to_apt(balance), "agent ready");

    let client = X402Client::new(submitter)
        .with_network(config.network.clone())
        .with_max_amount(max_octas);

    let response = client
        .post(&api_url, json!({ "protocol": "0x1::demo", "action": "analyze" }))
        .await?;

    let status = response.status();
    let receipt = response
        .headers()
        .get("x-payment-response")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| decode_payment_response(v).ok());
    let body = response.text().await?;

    match receipt {
        Some(receipt) => tracing::info!(%status, tx_hash = %receipt.tx_hash, "paid request completed"),
        None => tracing::info!(%status, "request completed without payment"),
    }
    println!("{}", body);

    Ok(())
}
