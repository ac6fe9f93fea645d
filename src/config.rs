//! Gate and submitter configuration.
//!
//! Everything has a default, so a gate built from an empty environment runs
//! in fallback mode on the Aptos testnet with the default price table.

use crate::errors::{Result, X402Error};
use crate::pricing::PricingPolicy;
use crate::utils::normalize_address;
use std::str::FromStr;
use std::time::Duration;

/// Default fullnode REST endpoint.
pub const DEFAULT_NODE_URL: &str = "https://fullnode.testnet.aptoslabs.com/v1";

/// Default network identifier advertised in challenges.
pub const DEFAULT_NETWORK: &str = "aptos-testnet";

/// Aptos testnet chain id.
pub const DEFAULT_CHAIN_ID: u8 = 2;

/// Default nonce lifetime.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(15 * 60);

/// Recipient advertised when none is configured (fallback mode only).
pub const FALLBACK_RECIPIENT: &str = "0x0";

/// Retry and pacing parameters for the transaction submitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitterConfig {
    /// Attempts per logical submission
    pub max_attempts: u32,

    /// Minimum gap between the end of one submission and the start of the next
    pub min_spacing: Duration,

    /// Backoff after a sequence-number error
    pub sequence_backoff: Duration,

    /// Cooldown after a mempool conflict or an ambiguous timeout
    pub mempool_backoff: Duration,

    /// How long one attempt waits for settlement
    pub settlement_timeout: Duration,

    /// Poll interval while waiting for settlement
    pub poll_interval: Duration,

    /// Gas limit per transaction
    pub max_gas_amount: u64,

    /// Gas price in octas
    pub gas_unit_price: u64,

    /// Transaction expiration window
    pub expiration: Duration,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_spacing: Duration::from_secs(5),
            sequence_backoff: Duration::from_secs(2),
            mempool_backoff: Duration::from_secs(10),
            settlement_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            max_gas_amount: 2_000,
            gas_unit_price: 100,
            expiration: Duration::from_secs(60),
        }
    }
}

/// Configuration of the payment gate.
#[derive(Clone, Debug)]
pub struct GateConfig {
    /// Address that must receive payments; `None` forces fallback mode
    pub recipient: Option<String>,

    /// Fullnode REST endpoint
    pub node_url: String,

    /// Network identifier advertised in challenges
    pub network: String,

    /// Chain id advertised in challenges
    pub chain_id: u8,

    /// Hex Ed25519 key of the server's signing identity
    pub private_key: Option<String>,

    /// Accept format-plausible evidence without contacting the ledger
    pub fallback_override: bool,

    /// Protected routes and their prices
    pub pricing: PricingPolicy,

    /// Lifetime of an issued payment nonce
    pub nonce_ttl: Duration,

    /// Transaction submitter tuning
    pub submitter: SubmitterConfig,
}

impl GateConfig {
    /// Creates a strict-mode configuration paying to `recipient`.
    ///
    /// # Examples
    ///
    /// ```
    /// use x402_gate::config::GateConfig;
    ///
    /// let config = GateConfig::new("0x1234").unwrap();
    /// assert!(!config.fallback_active());
    /// assert_eq!(config.chain_id, 2);
    /// ```
    pub fn new(recipient: &str) -> Result<Self> {
        Ok(Self {
            recipient: Some(normalize_address(recipient)?),
            ..Self::fallback()?
        })
    }

    /// Creates a configuration with no recipient, i.e. fallback mode.
    pub fn fallback() -> Result<Self> {
        Ok(Self {
            recipient: None,
            node_url: DEFAULT_NODE_URL.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            chain_id: DEFAULT_CHAIN_ID,
            private_key: None,
            fallback_override: false,
            pricing: PricingPolicy::default_table()?,
            nonce_ttl: DEFAULT_NONCE_TTL,
            submitter: SubmitterConfig::default(),
        })
    }

    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::fallback()?;

        if let Some(recipient) = var("X402_RECIPIENT") {
            config.recipient = Some(normalize_address(&recipient)?);
        }
        if let Some(url) = var("APTOS_NODE_URL") {
            url::Url::parse(&url)?;
            config.node_url = url.trim_end_matches('/').to_string();
        }
        if let Some(network) = var("APTOS_NETWORK") {
            config.network = network;
        }
        config.chain_id = parse_or("APTOS_CHAIN_ID", var("APTOS_CHAIN_ID"), config.chain_id)?;
        config.private_key = var("APTOS_PRIVATE_KEY");
        config.fallback_override = parse_bool("X402_FALLBACK_MODE", var("X402_FALLBACK_MODE"))?;
        if let Some(table) = var("X402_PRICING") {
            config.pricing = PricingPolicy::from_json(&table)?;
        }
        config.nonce_ttl = Duration::from_secs(parse_or(
            "X402_NONCE_TTL_SECS",
            var("X402_NONCE_TTL_SECS"),
            config.nonce_ttl.as_secs(),
        )?);

        let defaults = SubmitterConfig::default();
        let millis = |name: &str, default: Duration| -> Result<Duration> {
            Ok(Duration::from_millis(parse_or(name, var(name), default.as_millis() as u64)?))
        };
        config.submitter = SubmitterConfig {
            max_attempts: parse_or("X402_SUBMIT_MAX_ATTEMPTS", var("X402_SUBMIT_MAX_ATTEMPTS"), defaults.max_attempts)?,
            min_spacing: millis("X402_SUBMIT_MIN_SPACING_MS", defaults.min_spacing)?,
            sequence_backoff: millis("X402_SEQUENCE_BACKOFF_MS", defaults.sequence_backoff)?,
            mempool_backoff: millis("X402_MEMPOOL_BACKOFF_MS", defaults.mempool_backoff)?,
            settlement_timeout: Duration::from_secs(parse_or(
                "X402_SETTLEMENT_TIMEOUT_SECS",
                var("X402_SETTLEMENT_TIMEOUT_SECS"),
                defaults.settlement_timeout.as_secs(),
            )?),
            ..defaults
        };
        if config.submitter.max_attempts == 0 {
            return Err(X402Error::ConfigError("X402_SUBMIT_MAX_ATTEMPTS must be at least 1".to_string()));
        }

        Ok(config)
    }

    /// Sets the recipient address.
    pub fn with_recipient(mut self, recipient: &str) -> Result<Self> {
        self.recipient = Some(normalize_address(recipient)?);
        Ok(self)
    }

    /// Sets the price table.
    pub fn with_pricing(mut self, pricing: PricingPolicy) -> Self {
        self.pricing = pricing;
        self
    }

    /// Sets the nonce lifetime.
    pub fn with_nonce_ttl(mut self, ttl: Duration) -> Self {
        self.nonce_ttl = ttl;
        self
    }

    /// Forces fallback mode on or off.
    pub fn with_fallback_override(mut self, enabled: bool) -> Self {
        self.fallback_override = enabled;
        self
    }

    /// Sets the signing key of the server identity.
    pub fn with_private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    /// Sets the submitter tuning.
    pub fn with_submitter(mut self, submitter: SubmitterConfig) -> Self {
        self.submitter = submitter;
        self
    }

    /// Whether payments are accepted on format alone.
    pub fn fallback_active(&self) -> bool {
        self.fallback_override || self.recipient.is_none()
    }

    /// Recipient written into challenges.
    pub fn effective_recipient(&self) -> &str {
        self.recipient.as_deref().unwrap_or(FALLBACK_RECIPIENT)
    }
}

fn parse_or<T: FromStr>(name: &str, value: Option<String>, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match value {
        Some(v) => v
            .parse()
            .map_err(|e| X402Error::ConfigError(format!("{}='{}': {}", name, v, e))),
        None => Ok(default),
    }
}

fn parse_bool(name: &str, value: Option<String>) -> Result<bool> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(X402Error::ConfigError(format!("{}='{}' is not a boolean", name, other))),
    }
}
