//! Product filtering: pure predicate application over a fetched catalog.
//!
//! Filters never participate in cache identity: the engine caches the full
//! document and filtering happens on the way out.

use serde::Deserialize;

use crate::catalog::Product;

/// Caller-supplied product predicates, all optional and ANDed together.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductFilter {
    /// Case-insensitive substring match against the product category.
    pub category: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub in_stock: Option<bool>,
}

impl ProductFilter {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.min_price.is_none()
            && self.max_price.is_none()
            && self.in_stock.is_none()
    }

    /// Whether a single product passes every configured predicate.
    ///
    /// Price bounds compare against the active price (the special price
    /// when one undercuts the regular price). A product with no price at
    /// all fails any supplied bound.
    pub fn matches(&self, product: &Product) -> bool {
        if let Some(wanted) = &self.category {
            let Some(category) = &product.category else {
                return false;
            };
            if !category.to_lowercase().contains(&wanted.to_lowercase()) {
                return false;
            }
        }

        if self.min_price.is_some() || self.max_price.is_some() {
            let Some(price) = product.active_price() else {
                return false;
            };
            if let Some(min) = self.min_price {
                if price < min {
                    return false;
                }
            }
            if let Some(max) = self.max_price {
                if price > max {
                    return false;
                }
            }
        }

        if let Some(wanted) = self.in_stock {
            if product.in_stock != wanted {
                return false;
            }
        }

        true
    }

    /// Apply all predicates, preserving catalog order.
    pub fn apply(&self, products: &[Product]) -> Vec<Product> {
        if self.is_empty() {
            return products.to_vec();
        }
        products
            .iter()
            .filter(|p| self.matches(p))
            .cloned()
            .collect()
    }
}
