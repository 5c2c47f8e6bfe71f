//! Product catalog
//!
//! Maps store product ids to tiers through an explicit table. Product ids
//! that are not listed are rejected instead of being guessed from their name.

use serde::{Deserialize, Serialize};

use super::types::SubscriptionTier;
use crate::error::ConfigError;

/// How the billing provider models a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    /// Auto-renewing subscription with an expiry
    Subscription,
    /// Single purchase that never expires
    OneTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub product_id: String,
    pub tier: SubscriptionTier,
    pub kind: ProductKind,
}

impl Product {
    pub fn new(product_id: &str, tier: SubscriptionTier, kind: ProductKind) -> Self {
        Self {
            product_id: product_id.to_string(),
            tier,
            kind,
        }
    }
}

/// Ordered product table; the order is also the restoration probe order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCatalog {
    products: Vec<Product>,
}

impl ProductCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self { products }
    }

    pub fn lookup(&self, product_id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.product_id == product_id)
    }

    pub fn tier_for(&self, product_id: &str) -> Option<SubscriptionTier> {
        self.lookup(product_id).map(|p| p.tier)
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    /// Parse `id=Tier[:kind]` entries separated by commas.
    ///
    /// Kind defaults to `subscription`, except Lifetime which defaults to `one_time`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        const KEY: &str = "ENTITLEMENT_PRODUCTS";
        let mut products = Vec::new();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (product_id, rest) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::invalid(KEY, format!("missing '=' in {:?}", entry)))?;
            let (tier, kind) = match rest.split_once(':') {
                Some((tier, kind)) => (tier, Some(kind)),
                None => (rest, None),
            };

            let tier: SubscriptionTier = tier
                .trim()
                .parse()
                .map_err(|e: super::types::ParseEnumError| ConfigError::invalid(KEY, e.to_string()))?;
            if tier == SubscriptionTier::Free {
                return Err(ConfigError::invalid(
                    KEY,
                    format!("product {} cannot grant the free tier", product_id.trim()),
                ));
            }

            let kind = match kind.map(str::trim) {
                Some("subscription") => ProductKind::Subscription,
                Some("one_time") => ProductKind::OneTime,
                Some(other) => {
                    return Err(ConfigError::invalid(
                        KEY,
                        format!("unknown product kind {:?}", other),
                    ))
                }
                None if tier == SubscriptionTier::Lifetime => ProductKind::OneTime,
                None => ProductKind::Subscription,
            };

            products.push(Product::new(product_id.trim(), tier, kind));
        }

        if products.is_empty() {
            return Err(ConfigError::invalid(KEY, "catalog is empty"));
        }
        Ok(Self { products })
    }
}

impl Default for ProductCatalog {
    fn default() -> Self {
        Self::new(vec![
            Product::new(
                "monthly_premium",
                SubscriptionTier::Monthly,
                ProductKind::Subscription,
            ),
            Product::new(
                "yearly_premium",
                SubscriptionTier::Yearly,
                ProductKind::Subscription,
            ),
            Product::new(
                "lifetime_premium",
                SubscriptionTier::Lifetime,
                ProductKind::OneTime,
            ),
        ])
    }
}
