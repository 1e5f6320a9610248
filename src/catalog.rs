//! Core catalog data model: normalized products, fetch requests, and the
//! standardized catalog document the engine caches and serves.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Page budget bounds enforced on every request.
pub const MIN_PAGES: u32 = 1;
pub const MAX_PAGES: u32 = 20;
pub const DEFAULT_PAGES: u32 = 5;

/// A single normalized product entry.
///
/// Every fetch strategy emits this shape regardless of what the upstream
/// returns, so cached documents are interchangeable across strategies.
/// Potency values stay formatted strings ("22.4%", "150mg") exactly as
/// the upstream reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regular_price: Option<f64>,
    /// Discounted price, present only while a special is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thc_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cbd_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strain_type: Option<String>,
    #[serde(default = "default_in_stock")]
    pub in_stock: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_in_stock() -> bool {
    true
}

impl Product {
    pub fn new(name: impl Into<String>) -> Self {
        Product {
            name: name.into(),
            brand: None,
            category: None,
            regular_price: None,
            special_price: None,
            thc_content: None,
            cbd_content: None,
            strain_type: None,
            in_stock: true,
            metadata: HashMap::new(),
        }
    }

    /// The price the product currently sells at: the special price when
    /// one is active and lower, otherwise the regular price.
    pub fn active_price(&self) -> Option<f64> {
        match (self.regular_price, self.special_price) {
            (Some(regular), Some(special)) if special < regular => Some(special),
            (Some(regular), _) => Some(regular),
            (None, special) => special,
        }
    }
}

/// The standardized catalog document. This is the unit of caching: one
/// document per (url, page budget, metadata flag) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub url: String,
    /// Which fetch strategy produced this document.
    pub source: String,
    pub products: Vec<Product>,
    pub total_products: usize,
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Catalog {
    pub fn new(
        url: impl Into<String>,
        source: impl Into<String>,
        products: Vec<Product>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let total_products = products.len();
        Catalog {
            url: url.into(),
            source: source.into(),
            products,
            total_products,
            fetched_at: Utc::now(),
            metadata,
        }
    }
}

/// A request to fetch one storefront catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRequest {
    /// Storefront URL. Scheme-less input is treated as https.
    pub target_url: String,
    /// Upper bound on upstream pages walked, clamped to [1, 20].
    pub max_pages: u32,
    /// Skip the cache read and replace whatever is stored.
    pub force_refresh: bool,
    /// Attach fetch diagnostics (strategy, page count, retailer info)
    /// to the catalog document.
    pub include_metadata: bool,
}

impl CatalogRequest {
    pub fn new(target_url: impl Into<String>) -> Self {
        CatalogRequest {
            target_url: target_url.into(),
            max_pages: DEFAULT_PAGES,
            force_refresh: false,
            include_metadata: false,
        }
    }

    /// Copy with the URL scheme-prefixed and the page budget clamped.
    /// The engine applies this once at entry so every downstream layer
    /// sees canonical values.
    pub fn normalized(&self) -> Self {
        CatalogRequest {
            target_url: normalize_url(&self.target_url),
            max_pages: self.max_pages.clamp(MIN_PAGES, MAX_PAGES),
            force_refresh: self.force_refresh,
            include_metadata: self.include_metadata,
        }
    }

    /// Cache key for this request. Identical catalogs are keyed by what
    /// changes the document content: the URL, the page budget, and the
    /// metadata flag. `force_refresh` changes freshness, not content, so
    /// it is deliberately excluded. Filter criteria never reach the key;
    /// filtering happens downstream of the cache.
    pub fn cache_key(&self) -> String {
        let n = self.normalized();
        format!(
            "dispensary:{}:{}:{}",
            n.target_url, n.max_pages, n.include_metadata
        )
    }
}

impl Default for CatalogRequest {
    fn default() -> Self {
        CatalogRequest::new("")
    }
}

/// Prefix bare hostnames with https. Existing schemes pass through.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}
