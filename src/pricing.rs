//! Static price table for protected routes and actions.
//!
//! A route is either priced as a whole, or carries a per-action table when a
//! single endpoint mixes free and paid operations selected by an `action`
//! field in the request body. Unpriced routes and actions are free.

use crate::errors::{Result, X402Error};
use crate::utils::{apt_to_octas, octas_to_apt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Separates the route from the action in configuration keys (`/api/agent#analyze`).
const ACTION_SEPARATOR: char = '#';

/// Price of one protected route or action.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PriceEntry {
    /// Price in APT, normalized decimal string
    pub price: String,

    /// Price in octas
    pub price_octas: u128,

    /// What the payment buys
    pub description: String,
}

impl PriceEntry {
    /// Creates an entry from a decimal APT price.
    pub fn new(price: &str, description: impl Into<String>) -> Result<Self> {
        let price_octas = apt_to_octas(price)?;
        if price_octas == 0 {
            return Err(X402Error::InvalidAmount(format!("price '{}' must be positive", price)));
        }

        Ok(Self {
            price: octas_to_apt(price_octas),
            price_octas,
            description: description.into(),
        })
    }
}

#[derive(Debug, Clone, Default)]
struct RoutePricing {
    whole: Option<PriceEntry>,
    actions: HashMap<String, PriceEntry>,
}

/// Configuration form of a price entry.
#[derive(Deserialize, Debug)]
struct RawPrice {
    price: String,
    #[serde(default)]
    description: String,
}

/// Route/action price table, immutable once built.
#[derive(Debug, Clone, Default)]
pub struct PricingPolicy {
    routes: HashMap<String, RoutePricing>,
}

impl PricingPolicy {
    /// Creates an empty policy; every route is free.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prices a whole route.
    pub fn with_route(mut self, route: &str, entry: PriceEntry) -> Self {
        self.routes.entry(normalize_route(route)).or_default().whole = Some(entry);
        self
    }

    /// Prices one action of a multi-action route.
    pub fn with_action(mut self, route: &str, action: &str, entry: PriceEntry) -> Self {
        self.routes
            .entry(normalize_route(route))
            .or_default()
            .actions
            .insert(action.to_string(), entry);
        self
    }

    /// The table used when nothing is configured.
    pub fn default_table() -> Result<Self> {
        Ok(Self::new()
            .with_route("/api/scan", PriceEntry::new("0.001", "AI threat scan of a registered protocol")?)
            .with_action(
                "/api/agent",
                "analyze",
                PriceEntry::new("0.001", "Autonomous agent threat analysis")?,
            )
            .with_action(
                "/api/agent",
                "submit-report",
                PriceEntry::new("0.0005", "Bounty report submission")?,
            ))
    }

    /// Parses a JSON table keyed by `/route` or `/route#action`.
    ///
    /// # Examples
    ///
    /// ```
    /// use x402_gate::pricing::PricingPolicy;
    ///
    /// let policy = PricingPolicy::from_json(
    ///     r#"{"/api/scan": {"price": "0.002", "description": "scan"},
    ///         "/api/agent#analyze": {"price": "0.001"}}"#,
    /// ).unwrap();
    ///
    /// assert_eq!(policy.lookup("/api/scan", None).unwrap().price_octas, 200_000);
    /// assert!(policy.lookup("/api/agent", Some("status")).is_none());
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: HashMap<String, RawPrice> = serde_json::from_str(json)
            .map_err(|e| X402Error::ConfigError(format!("invalid pricing table: {}", e)))?;

        let mut policy = Self::new();
        for (key, price) in raw {
            let entry = PriceEntry::new(&price.price, price.description)
                .map_err(|e| X402Error::ConfigError(format!("pricing entry '{}': {}", key, e)))?;
            policy = match key.split_once(ACTION_SEPARATOR) {
                Some((route, action)) if !action.is_empty() => policy.with_action(route, action, entry),
                Some(_) => return Err(X402Error::ConfigError(format!("pricing entry '{}' has an empty action", key))),
                None => policy.with_route(&key, entry),
            };
        }
        Ok(policy)
    }

    /// Whether the route selects its price by the body's `action` field.
    pub fn is_multi_action(&self, route: &str) -> bool {
        self.routes
            .get(&normalize_route(route))
            .is_some_and(|r| !r.actions.is_empty())
    }

    /// Finds the price for a request, `None` when it is free.
    ///
    /// An action-level price wins over the route-level one.
    pub fn lookup(&self, route: &str, action: Option<&str>) -> Option<&PriceEntry> {
        let pricing = self.routes.get(&normalize_route(route))?;
        action
            .and_then(|a| pricing.actions.get(a))
            .or(pricing.whole.as_ref())
    }

    /// All priced routes and actions, keyed like the configuration format.
    pub fn entries(&self) -> BTreeMap<String, PriceEntry> {
        let mut out = BTreeMap::new();
        for (route, pricing) in &self.routes {
            if let Some(entry) = &pricing.whole {
                out.insert(route.clone(), entry.clone());
            }
            for (action, entry) in &pricing.actions {
                out.insert(format!("{}{}{}", route, ACTION_SEPARATOR, action), entry.clone());
            }
        }
        out
    }
}

fn normalize_route(route: &str) -> String {
    let trimmed = route.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
