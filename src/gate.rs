//! The HTTP 402 payment gate.
//!
//! [`payment_gate`] is an axum middleware that sits in front of priced routes.
//! For each request it decides between three outcomes:
//!
//! 1. **Free**: the route (or the body's `action`) has no price; the request
//!    passes through untouched.
//! 2. **Challenge**: a price applies but the request carries no payment
//!    evidence; a fresh nonce is issued and a 402 is returned with the
//!    requirements both as JSON and as `X-Payment-*` headers.
//! 3. **Verify**: evidence is present; the [`PaymentVerifier`] decides whether
//!    the request is admitted or rejected with a 402 `{error, details}` body.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use axum::{middleware, routing::post, Router};
//! use x402_gate::config::GateConfig;
//! use x402_gate::gate::{payment_gate, PaymentGate};
//!
//! # fn example() -> x402_gate::Result<()> {
//! let config = GateConfig::from_env()?;
//! let gate = Arc::new(PaymentGate::from_config(config)?);
//!
//! let app: Router = Router::new()
//!     .route("/api/scan", post(|| async { "scanned" }))
//!     .layer(middleware::from_fn_with_state(gate, payment_gate));
//! # Ok(())
//! # }
//! ```
//!
//! # Fallback mode
//!
//! Without a configured recipient, or with the override flag set, the gate
//! admits any request whose `X-Payment` value looks like a transaction hash.
//! Nothing is checked against the ledger and no nonce is required. This is a
//! known weakening for environments without ledger access; every such
//! admission is logged at `warn` with `mode = "fallback"`.

use crate::config::GateConfig;
use crate::errors::{Result, VerifyError};
use crate::ledger::aptos::AptosClient;
use crate::ledger::Ledger;
use crate::nonce::NonceLedger;
use crate::pricing::{PriceEntry, PricingPolicy};
use crate::types::{
    headers, PaymentErrorResponse, PaymentRequiredResponse, PaymentRequirements, PaymentResponse, VerifiedPayment,
    SCHEME_EXACT, TOKEN_DECIMALS, TOKEN_SYMBOL, X402_VERSION,
};
use crate::utils::{encode_payment_response, explorer_account_url};
use crate::verifier::PaymentVerifier;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Largest request body buffered to read a multi-action discriminator.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Body field naming the action of a multi-action route.
const ACTION_FIELD: &str = "action";

/// Body fields that may carry evidence on multi-action routes.
const PROOF_FIELD: &str = "paymentProof";
const NONCE_FIELD: &str = "paymentNonce";

/// Payment evidence supplied by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Evidence {
    proof: String,
    nonce: Option<String>,
}

/// Evidence fields read from one place (headers or body), each optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct EvidenceFields {
    proof: Option<String>,
    nonce: Option<String>,
}

impl EvidenceFields {
    /// Fills each missing field from `other`.
    fn or(self, other: EvidenceFields) -> EvidenceFields {
        EvidenceFields {
            proof: self.proof.or(other.proof),
            nonce: self.nonce.or(other.nonce),
        }
    }

    fn into_evidence(self) -> Option<Evidence> {
        Some(Evidence {
            proof: self.proof?,
            nonce: self.nonce,
        })
    }
}

/// Shared state of the payment middleware.
pub struct PaymentGate {
    pricing: PricingPolicy,
    nonces: NonceLedger,
    verifier: PaymentVerifier,
    recipient: String,
    network: String,
    chain_id: u8,
    nonce_ttl: Duration,
    fallback: bool,
}

impl PaymentGate {
    /// Creates a gate that verifies payments against `ledger`.
    pub fn new(config: GateConfig, ledger: Arc<dyn Ledger>) -> Self {
        let fallback = config.fallback_active();
        let nonces = NonceLedger::new();
        let verifier = PaymentVerifier::new(ledger, nonces.clone(), fallback, config.nonce_ttl);

        if fallback {
            tracing::warn!(
                mode = "fallback",
                "payment gate running in fallback mode; payments are NOT verified on the ledger"
            );
        } else {
            tracing::info!(
                mode = "strict",
                recipient = config.effective_recipient(),
                network = %config.network,
                "payment gate verifying payments on the ledger"
            );
        }

        Self {
            recipient: config.effective_recipient().to_string(),
            network: config.network,
            chain_id: config.chain_id,
            nonce_ttl: config.nonce_ttl,
            pricing: config.pricing,
            nonces,
            verifier,
            fallback,
        }
    }

    /// Creates a gate backed by the Aptos node named in `config`.
    pub fn from_config(config: GateConfig) -> Result<Self> {
        let ledger = Arc::new(AptosClient::new(&config.node_url)?);
        Ok(Self::new(config, ledger))
    }

    /// The price table in force.
    pub fn pricing(&self) -> &PricingPolicy {
        &self.pricing
    }

    /// The nonce ledger backing issued challenges.
    pub fn nonces(&self) -> &NonceLedger {
        &self.nonces
    }

    /// Whether payments are admitted without ledger verification.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Issues a nonce for `entry` and builds the requirements sent to the client.
    pub async fn challenge(&self, entry: &PriceEntry) -> PaymentRequirements {
        let nonce = self.nonces.issue(entry.price_octas, &self.recipient, self.nonce_ttl).await;

        PaymentRequirements {
            x402_version: X402_VERSION,
            scheme: SCHEME_EXACT.to_string(),
            network: self.network.clone(),
            chain_id: self.chain_id,
            token: TOKEN_SYMBOL.to_string(),
            token_decimals: TOKEN_DECIMALS,
            amount_required: entry.price.clone(),
            amount_required_octas: entry.price_octas.to_string(),
            resource: self.recipient.clone(),
            payment_nonce: nonce.token,
            nonce_expiry: nonce.expires_at,
            description: entry.description.clone(),
            explorer_url: explorer_account_url(&self.network, &self.recipient),
        }
    }

    /// Checks `evidence` against the price, returning the admitted payment.
    async fn verify(&self, evidence: &Evidence, entry: &PriceEntry) -> std::result::Result<VerifiedPayment, VerifyError> {
        let nonce = evidence.nonce.as_deref().unwrap_or_default();
        self.verifier.verify(&evidence.proof, nonce, entry.price_octas).await
    }
}

/// Axum middleware enforcing the price table of a [`PaymentGate`].
///
/// Use with [`axum::middleware::from_fn_with_state`]. Admitted requests carry
/// the [`VerifiedPayment`] in their extensions.
pub async fn payment_gate(State(gate): State<Arc<PaymentGate>>, request: Request, next: Next) -> Response {
    let route = request.uri().path().to_string();

    let (request, action, body_evidence) = if gate.pricing.is_multi_action(&route) {
        let (parts, body) = request.into_parts();
        let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(route = %route, error = %e, "could not buffer request body");
                return (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(json!({ "error": "InvalidBody", "details": e.to_string() })),
                )
                    .into_response();
            }
        };
        let parsed: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        let action = body_str(&parsed, ACTION_FIELD);
        let evidence = EvidenceFields {
            proof: body_str(&parsed, PROOF_FIELD),
            nonce: body_str(&parsed, NONCE_FIELD),
        };
        (Request::from_parts(parts, Body::from(bytes)), action, evidence)
    } else {
        (request, None, EvidenceFields::default())
    };

    let Some(entry) = gate.pricing.lookup(&route, action.as_deref()).cloned() else {
        return next.run(request).await;
    };

    let evidence = header_evidence(request.headers()).or(body_evidence).into_evidence();
    let evidence = match evidence {
        Some(e) if e.nonce.is_some() || gate.fallback => e,
        _ => return challenge_response(&gate, &entry, &route).await,
    };

    let payment = match gate.verify(&evidence, &entry).await {
        Ok(payment) => payment,
        Err(e) => {
            tracing::info!(route = %route, code = e.code(), error = %e, "payment rejected");
            return rejection_response(&e);
        }
    };

    let mut request = request;
    request.extensions_mut().insert(payment.clone());
    let mut response = next.run(request).await;

    if !response.status().is_success() {
        tracing::warn!(
            route = %route,
            status = response.status().as_u16(),
            tx_hash = %payment.tx_ref,
            "paid action did not succeed; payment stays consumed"
        );
    }
    add_admission_headers(response.headers_mut(), &payment);
    response
}

/// Reads `X-Payment` / `X-Payment-Nonce`; an empty value counts as absent.
fn header_evidence(map: &HeaderMap) -> EvidenceFields {
    let read = |name: &str| {
        map.get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    EvidenceFields {
        proof: read(headers::X_PAYMENT),
        nonce: read(headers::X_PAYMENT_NONCE),
    }
}

fn body_str(body: &Value, field: &str) -> Option<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn challenge_response(gate: &PaymentGate, entry: &PriceEntry, route: &str) -> Response {
    let requirements = gate.challenge(entry).await;
    tracing::info!(
        route = %route,
        amount_octas = %requirements.amount_required_octas,
        expires_at = requirements.nonce_expiry,
        "issued payment challenge"
    );

    let mut response = (
        StatusCode::PAYMENT_REQUIRED,
        Json(PaymentRequiredResponse {
            error: "Payment Required".to_string(),
            message: format!(
                "Transfer {} {} ({} octas) to {}, then retry with the transaction hash in X-Payment and the nonce in X-Payment-Nonce.",
                requirements.amount_required, TOKEN_SYMBOL, requirements.amount_required_octas, requirements.resource,
            ),
            requirements: requirements.clone(),
        }),
    )
        .into_response();
    mirror_requirements(response.headers_mut(), &requirements);
    response
}

/// Copies every requirement field into its `X-Payment-*` header.
fn mirror_requirements(map: &mut HeaderMap, requirements: &PaymentRequirements) {
    let fields: [(&'static str, String); 13] = [
        (headers::X_PAYMENT_REQUIRED, "true".to_string()),
        (headers::X_PAYMENT_VERSION, requirements.x402_version.to_string()),
        (headers::X_PAYMENT_SCHEME, requirements.scheme.clone()),
        (headers::X_PAYMENT_NETWORK, requirements.network.clone()),
        (headers::X_PAYMENT_CHAIN_ID, requirements.chain_id.to_string()),
        (headers::X_PAYMENT_TOKEN, requirements.token.clone()),
        (headers::X_PAYMENT_DECIMALS, requirements.token_decimals.to_string()),
        (headers::X_PAYMENT_AMOUNT, requirements.amount_required.clone()),
        (headers::X_PAYMENT_AMOUNT_OCTAS, requirements.amount_required_octas.clone()),
        (headers::X_PAYMENT_NONCE, requirements.payment_nonce.clone()),
        (headers::X_PAYMENT_NONCE_EXPIRY, requirements.nonce_expiry.to_string()),
        (headers::X_PAYMENT_RECIPIENT, requirements.resource.clone()),
        (headers::X_PAYMENT_DESCRIPTION, requirements.description.clone()),
    ];

    for (name, value) in fields {
        map.insert(HeaderName::from_static(name), header_value(&value));
    }
}

fn rejection_response(err: &VerifyError) -> Response {
    (
        StatusCode::PAYMENT_REQUIRED,
        Json(PaymentErrorResponse {
            error: err.code().to_string(),
            details: err.to_string(),
        }),
    )
        .into_response()
}

fn add_admission_headers(map: &mut HeaderMap, payment: &VerifiedPayment) {
    map.insert(
        HeaderName::from_static(headers::X_PAYMENT_VERIFIED),
        HeaderValue::from_static("true"),
    );
    map.insert(HeaderName::from_static(headers::X_PAYMENT_TX_HASH), header_value(&payment.tx_ref));
    if let Some(amount) = payment.amount {
        map.insert(
            HeaderName::from_static(headers::X_PAYMENT_AMOUNT),
            header_value(&amount.to_string()),
        );
    }

    let receipt = PaymentResponse {
        tx_hash: payment.tx_ref.clone(),
        settled_at: Some(chrono::Utc::now().to_rfc3339()),
        metadata: Some(json!({
            "payer": payment.payer,
            "amountOctas": payment.amount.map(|a| a.to_string()),
            "fallback": payment.fallback,
        })),
    };
    match encode_payment_response(&receipt) {
        Ok(encoded) => {
            map.insert(HeaderName::from_static(headers::X_PAYMENT_RESPONSE), header_value(&encoded));
        }
        Err(e) => tracing::warn!(error = %e, "could not encode payment receipt"),
    }
}

/// Builds a header value, replacing anything outside visible ASCII.
fn header_value(value: &str) -> HeaderValue {
    let visible: String = value
        .chars()
        .map(|c| if c == ' ' || c.is_ascii_graphic() { c } else { '?' })
        .collect();
    HeaderValue::from_str(&visible).unwrap_or_else(|_| HeaderValue::from_static(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request as HttpRequest;

    fn gate() -> PaymentGate {
        let config = GateConfig::new("0xaa").unwrap();
        PaymentGate::from_config(config).unwrap()
    }

    #[tokio::test]
    async fn test_challenge_uses_price_and_recipient() {
        let gate = gate();
        let entry = gate.pricing().lookup("/api/scan", None).unwrap().clone();
        let requirements = gate.challenge(&entry).await;

        assert_eq!(requirements.amount_required, "0.001");
        assert_eq!(requirements.amount_required_octas, "100000");
        assert_eq!(requirements.resource.len(), 66);
        assert!(requirements.resource.ends_with("aa"));
        assert_eq!(requirements.x402_version, 2);
        assert!(requirements.explorer_url.contains("network=testnet"));
        assert!(gate.nonces().validate(&requirements.payment_nonce).await.is_ok());
    }

    #[tokio::test]
    async fn test_every_requirement_is_mirrored() {
        let gate = gate();
        let entry = gate.pricing().lookup("/api/agent", Some("submit-report")).unwrap().clone();
        let requirements = gate.challenge(&entry).await;

        let mut map = HeaderMap::new();
        mirror_requirements(&mut map, &requirements);

        assert_eq!(map.len(), 13);
        assert_eq!(map[headers::X_PAYMENT_REQUIRED], "true");
        assert_eq!(map[headers::X_PAYMENT_AMOUNT_OCTAS], "50000");
        assert_eq!(map[headers::X_PAYMENT_NONCE], requirements.payment_nonce.as_str());
        assert_eq!(map[headers::X_PAYMENT_RECIPIENT], requirements.resource.as_str());
    }

    #[test]
    fn test_header_evidence() {
        let request = HttpRequest::builder()
            .header("X-Payment", " 0xabc ")
            .header("X-Payment-Nonce", "")
            .body(())
            .unwrap();
        assert_eq!(
            header_evidence(request.headers()).into_evidence(),
            Some(Evidence {
                proof: "0xabc".into(),
                nonce: None
            })
        );

        assert_eq!(header_evidence(&HeaderMap::new()).into_evidence(), None);
    }

    #[test]
    fn test_evidence_merged_per_field() {
        let request = HttpRequest::builder().header("X-Payment", "0xabc").body(()).unwrap();
        let body = json!({ "paymentProof": "0xdef", "paymentNonce": "n1" });
        let body_fields = EvidenceFields {
            proof: body_str(&body, PROOF_FIELD),
            nonce: body_str(&body, NONCE_FIELD),
        };

        assert_eq!(
            header_evidence(request.headers()).or(body_fields.clone()).into_evidence(),
            Some(Evidence {
                proof: "0xabc".into(),
                nonce: Some("n1".into())
            })
        );
        assert_eq!(
            header_evidence(&HeaderMap::new()).or(body_fields).into_evidence(),
            Some(Evidence {
                proof: "0xdef".into(),
                nonce: Some("n1".into())
            })
        );

        let nonce_only = EvidenceFields {
            proof: None,
            nonce: Some("n1".into()),
        };
        assert_eq!(nonce_only.or(EvidenceFields::default()).into_evidence(), None);
    }

    #[test]
    fn test_header_value_sanitized() {
        assert_eq!(header_value("Threat scan – v2\n"), "Threat scan ? v2?");
        assert_eq!(header_value("0.001"), "0.001");
    }

    #[test]
    fn test_admission_headers() {
        let payment = VerifiedPayment {
            payer: Some("0xpayer".into()),
            amount: Some(100_000),
            tx_ref: "0x01".into(),
            fallback: false,
        };
        let mut map = HeaderMap::new();
        add_admission_headers(&mut map, &payment);

        assert_eq!(map[headers::X_PAYMENT_VERIFIED], "true");
        assert_eq!(map[headers::X_PAYMENT_AMOUNT], "100000");
        let receipt =
            crate::utils::decode_payment_response(map[headers::X_PAYMENT_RESPONSE].to_str().unwrap()).unwrap();
        assert_eq!(receipt.tx_hash, "0x01");
        assert_eq!(receipt.metadata.unwrap()["payer"], "0xpayer");
    }
}
