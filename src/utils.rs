//! Utility functions for x402 operations.
//!
//! Amount conversion between APT and octas, address and hash normalization,
//! nonce token generation and receipt encoding. Amounts are only ever compared
//! as integer octas; the decimal APT strings produced here are for display.

use crate::errors::{Result, X402Error};
use crate::types::{PaymentResponse, OCTAS_PER_APT, TOKEN_DECIMALS};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Hex digits in a full ledger address or transaction hash.
const HASH_HEX_LEN: usize = 64;

/// Encodes a receipt as Base64 JSON for the `X-Payment-Response` header.
///
/// # Examples
///
/// ```
/// use x402_gate::types::PaymentResponse;
/// use x402_gate::utils::{decode_payment_response, encode_payment_response};
///
/// let receipt = PaymentResponse {
///     tx_hash: "0xabc".to_string(),
///     settled_at: None,
///     metadata: None,
/// };
///
/// let encoded = encode_payment_response(&receipt).unwrap();
/// assert_eq!(decode_payment_response(&encoded).unwrap().tx_hash, "0xabc");
/// ```
pub fn encode_payment_response(response: &PaymentResponse) -> Result<String> {
    let json = serde_json::to_string(response)?;
    Ok(BASE64.encode(json.as_bytes()))
}

/// Decodes a Base64 JSON receipt from the `X-Payment-Response` header.
pub fn decode_payment_response(encoded: &str) -> Result<PaymentResponse> {
    let decoded = BASE64.decode(encoded.as_bytes())?;
    Ok(serde_json::from_slice(&decoded)?)
}

/// Parses a decimal APT amount into octas without going through floats.
///
/// At most eight fractional digits are accepted.
///
/// # Examples
///
/// ```
/// use x402_gate::utils::apt_to_octas;
///
/// assert_eq!(apt_to_octas("0.001").unwrap(), 100_000);
/// assert_eq!(apt_to_octas("2").unwrap(), 200_000_000);
/// assert!(apt_to_octas("0.000000001").is_err());
/// ```
pub fn apt_to_octas(amount: &str) -> Result<u128> {
    let amount = amount.trim();
    let invalid = || X402Error::InvalidAmount(format!("'{}' is not a decimal APT amount", amount));

    let (whole, fraction) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if fraction.len() > TOKEN_DECIMALS as usize {
        return Err(X402Error::InvalidAmount(format!(
            "'{}' has more than {} decimal places",
            amount, TOKEN_DECIMALS
        )));
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let padded = format!("{:0<width$}", fraction, width = TOKEN_DECIMALS as usize);
    let fraction: u128 = padded.parse().map_err(|_| invalid())?;

    whole
        .checked_mul(OCTAS_PER_APT)
        .and_then(|w| w.checked_add(fraction))
        .ok_or_else(|| X402Error::InvalidAmount(format!("'{}' overflows", amount)))
}

/// Renders octas as a decimal APT string with trailing zeros trimmed.
///
/// # Examples
///
/// ```
/// use x402_gate::utils::octas_to_apt;
///
/// assert_eq!(octas_to_apt(100_000), "0.001");
/// assert_eq!(octas_to_apt(150_000_000), "1.5");
/// assert_eq!(octas_to_apt(0), "0");
/// ```
pub fn octas_to_apt(octas: u128) -> String {
    let whole = octas / OCTAS_PER_APT;
    let fraction = octas % OCTAS_PER_APT;
    if fraction == 0 {
        return whole.to_string();
    }

    let fraction = format!("{:0>width$}", fraction, width = TOKEN_DECIMALS as usize);
    format!("{}.{}", whole, fraction.trim_end_matches('0'))
}

/// Normalizes a ledger address to lowercase, `0x`-prefixed, 64 hex digits.
///
/// Addresses may be written with or without leading zeros (`0x1` is the same
/// account as `0x000…001`).
///
/// # Examples
///
/// ```
/// use x402_gate::utils::normalize_address;
///
/// let addr = normalize_address("0xA").unwrap();
/// assert_eq!(addr.len(), 66);
/// assert!(addr.ends_with("0a"));
/// ```
pub fn normalize_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if hex_part.is_empty() || hex_part.len() > HASH_HEX_LEN || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(X402Error::InvalidAddress(address.to_string()));
    }

    Ok(format!("0x{:0>width$}", hex_part.to_ascii_lowercase(), width = HASH_HEX_LEN))
}

/// Compares two addresses, ignoring case and leading-zero padding.
///
/// Unparseable addresses never match anything.
pub fn addresses_match(a: &str, b: &str) -> bool {
    match (normalize_address(a), normalize_address(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Checks that a string looks like a ledger transaction hash (64 hex digits,
/// optional `0x`).
///
/// # Examples
///
/// ```
/// use x402_gate::utils::is_plausible_tx_hash;
///
/// assert!(is_plausible_tx_hash(&format!("0x{}", "ab".repeat(32))));
/// assert!(!is_plausible_tx_hash("0x1234"));
/// ```
pub fn is_plausible_tx_hash(hash: &str) -> bool {
    let hex_part = hash.strip_prefix("0x").unwrap_or(hash);
    hex_part.len() == HASH_HEX_LEN && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

/// Lowercases a transaction hash and ensures the `0x` prefix.
pub fn normalize_tx_hash(hash: &str) -> String {
    let hex_part = hash.strip_prefix("0x").unwrap_or(hash);
    format!("0x{}", hex_part.to_ascii_lowercase())
}

/// Generates a random 256-bit payment nonce token, hex encoded.
///
/// # Examples
///
/// ```
/// use x402_gate::utils::generate_nonce_token;
///
/// let token = generate_nonce_token();
/// assert_eq!(token.len(), 64);
/// ```
pub fn generate_nonce_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

/// Gets the current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Explorer link for an account on the given network.
pub fn explorer_account_url(network: &str, address: &str) -> String {
    let network = network.strip_prefix("aptos-").unwrap_or(network);
    format!("https://explorer.aptoslabs.com/account/{}?network={}", address, network)
}
