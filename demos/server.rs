//! Example x402 gate server using Axum.
//!
//! Serves a threat-scan endpoint priced as a whole route and an agent endpoint
//! whose price depends on the `action` field of the request body.
//!
//! Run with:
//! ```bash
//! cargo run --example server
//! ```
//!
//! Environment variables (a `.env` file is loaded if present):
//! - X402_RECIPIENT: Address to receive payments (unset: fallback mode)
//! - APTOS_NODE_URL: Fullnode REST endpoint
//! - APTOS_PRIVATE_KEY: Key the agent action uses to pay for its own scans
//! - PORT: Server port (default: 3000)
//!
//! See `GateConfig::from_env` for the remaining options.

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use x402_gate::ledger::aptos::AptosClient;
use x402_gate::{payment_gate, GateConfig, PaymentGate, TransactionSubmitter, VerifiedPayment};

struct AppState {
    gate: Arc<PaymentGate>,
    submitter: TransactionSubmitter,
}

/// Priced route: one scan per payment.
async fn scan_handler(
    Extension(payment): Extension<VerifiedPayment>,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    Json(json!({
        "protocol": request.get("protocol").cloned().unwrap_or(Value::Null),
        "riskScore": 42,
        "findings": ["unchecked external call in withdraw()"],
        "paid": true,
        "txHash": payment.tx_ref,
        "verifiedOnChain": !payment.fallback,
    }))
}

/// Multi-action route: `status` is free, `analyze` and `submit-report` are priced.
async fn agent_handler(
    State(state): State<Arc<AppState>>,
    payment: Option<Extension<VerifiedPayment>>,
    Json(request): Json<Value>,
) -> Result<Response, AppError> {
    let action = request.get("action").and_then(Value::as_str).unwrap_or("status");

    match action {
        "status" => {
            let balance = match state.submitter.balance().await {
                Ok(octas) => json!(octas.to_string()),
                Err(_) => Value::Null,
            };
            Ok(Json(json!({
                "agent": "online",
                "balanceOctas": balance,
                "outstandingNonces": state.gate.nonces().len().await,
            }))
            .into_response())
        }
        "analyze" => {
            let Some(Extension(payment)) = payment else {
                return Err(AppError::ServerError("analyze reached without payment".into()));
            };

            // The agent pays the treasury for the scan it runs on the caller's behalf.
            let treasury = request
                .get("treasury")
                .and_then(Value::as_str)
                .ok_or_else(|| AppError::BadRequest("missing 'treasury' address".into()))?;
            let result = state.submitter.transfer(treasury, 10_000).await;
            if !result.success {
                return Err(AppError::PaymentFailed(result.error.unwrap_or_default()));
            }

            Ok(Json(json!({
                "action": "analyze",
                "callerPayment": payment.tx_ref,
                "scanPayment": result.hash,
                "gasUsed": result.gas_used,
            }))
            .into_response())
        }
        "submit-report" => Ok(Json(json!({
            "action": "submit-report",
            "accepted": true,
            "paid": payment.is_some(),
        }))
        .into_response()),
        other => Err(AppError::BadRequest(format!("unknown action '{}'", other))),
    }
}

/// Lists priced routes and actions (free).
async fn pricing_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "fallbackMode": state.gate.is_fallback(),
        "prices": state.gate.pricing().entries(),
    }))
}

/// Health check endpoint (no payment required).
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "protocol": "x402",
        "version": x402_gate::X402_VERSION,
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,x402_gate=debug")))
        .init();

    let config = GateConfig::from_env()?;
    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse::<u16>()?;

    let ledger = Arc::new(AptosClient::new(&config.node_url)?);
    let submitter = TransactionSubmitter::new(ledger.clone(), config.private_key.clone(), config.submitter.clone());
    let gate = Arc::new(PaymentGate::new(config, ledger));
    gate.nonces().spawn_sweeper(Duration::from_secs(60));

    let state = Arc::new(AppState {
        gate: gate.clone(),
        submitter,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/pricing", get(pricing_handler))
        .route("/api/scan", post(scan_handler))
        .route("/api/agent", post(agent_handler))
        .layer(middleware::from_fn_with_state(gate, payment_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "x402 gate listening");

    axum::serve(listener, app).await?;

    Ok(())
}

// Error handling
enum AppError {
    BadRequest(String),
    PaymentFailed(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::PaymentFailed(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
