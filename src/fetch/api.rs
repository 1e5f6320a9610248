//! Structured-API fetch strategy.
//!
//! Talks to the storefront's GraphQL endpoint directly, skipping the
//! rendered site entirely. Two-phase: resolve the retailer by its URL
//! slug, then pull the menu for the preferred menu type. Fast, but
//! brittle against schema changes and credential blocks, which is why the
//! browser strategy exists as fallback.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::catalog::{Catalog, CatalogRequest, Product};
use crate::error::{FetchError, FetchResult};
use crate::rotation::Identity;

use super::CatalogFetcher;

const RETAILER_QUERY: &str = r#"
query RetailerByUrlName($urlName: String!) {
    retailerByUrlName(urlName: $urlName) {
        id
        name
        menuTypes
        address {
            city
            state
        }
    }
}
"#;

const MENU_QUERY: &str = r#"
query Menu($retailerId: ID!, $menuType: MenuType!) {
    menu(retailerId: $retailerId, menuType: $menuType) {
        products {
            name
            category
            brand {
                name
            }
            potencyThc {
                formatted
            }
            potencyCbd {
                formatted
            }
            strainType
            variants {
                priceRec
                specialPriceRec
                soldOut
            }
        }
    }
}
"#;

/// GraphQL menu fetcher.
pub struct MenuApiFetcher {
    endpoint: String,
    attempt_timeout: Duration,
}

impl MenuApiFetcher {
    pub fn new(endpoint: impl Into<String>, attempt_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            attempt_timeout,
        }
    }

    /// Build a client bound to one identity: its user agent and, when
    /// present, its proxy endpoint.
    fn build_client(&self, identity: &Identity) -> FetchResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(identity.user_agent.clone())
            .timeout(self.attempt_timeout);
        if let Some(proxy) = &identity.proxy_endpoint {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| FetchError::UpstreamUnavailable(format!("bad proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| FetchError::UpstreamUnavailable(format!("client build failed: {e}")))
    }

    async fn post_graphql<T: for<'de> Deserialize<'de>>(
        &self,
        client: &reqwest::Client,
        referer: &str,
        body: serde_json::Value,
    ) -> FetchResult<T> {
        let response = client
            .post(&self.endpoint)
            .header("apollographql-client-name", "dutchie-plus")
            .header("Origin", "https://dutchie.com")
            .header("Referer", referer)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if let Some(err) = classify_status(status.as_u16()) {
            return Err(err);
        }

        let envelope: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|e| FetchError::UpstreamRejected(format!("malformed response: {e}")))?;

        if !envelope.errors.is_empty() {
            let messages: Vec<&str> = envelope.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(FetchError::UpstreamRejected(messages.join("; ")));
        }
        envelope
            .data
            .ok_or_else(|| FetchError::UpstreamRejected("response carried no data".into()))
    }
}

#[async_trait]
impl CatalogFetcher for MenuApiFetcher {
    fn name(&self) -> &'static str {
        "menu-api"
    }

    async fn fetch(&self, request: &CatalogRequest, identity: &Identity) -> FetchResult<Catalog> {
        let slug = retailer_slug(&request.target_url).ok_or_else(|| {
            FetchError::UpstreamRejected(format!(
                "no retailer slug in url: {}",
                request.target_url
            ))
        })?;
        let client = self.build_client(identity)?;

        debug!(slug = %slug, identity = identity.label(), "resolving retailer");
        let retailer_data: RetailerData = self
            .post_graphql(
                &client,
                &request.target_url,
                json!({
                    "query": RETAILER_QUERY,
                    "variables": { "urlName": slug },
                }),
            )
            .await?;
        let retailer = retailer_data
            .retailer_by_url_name
            .ok_or_else(|| FetchError::UpstreamRejected(format!("unknown retailer: {slug}")))?;

        let menu_type = preferred_menu_type(&retailer.menu_types);
        debug!(retailer_id = %retailer.id, menu_type, "fetching menu");
        let menu_data: MenuData = self
            .post_graphql(
                &client,
                &request.target_url,
                json!({
                    "query": MENU_QUERY,
                    "variables": { "retailerId": retailer.id, "menuType": menu_type },
                }),
            )
            .await?;

        let products: Vec<Product> = menu_data
            .menu
            .map(|m| m.products)
            .unwrap_or_default()
            .into_iter()
            .filter_map(normalize_product)
            .collect();

        let mut metadata = HashMap::new();
        if request.include_metadata {
            metadata.insert("strategy".into(), json!(self.name()));
            metadata.insert("retailer_id".into(), json!(retailer.id));
            metadata.insert("retailer_name".into(), json!(retailer.name));
            metadata.insert("menu_type".into(), json!(menu_type));
            metadata.insert("pages_fetched".into(), json!(1));
            if let Some(address) = retailer.address {
                if let Some(city) = address.city {
                    metadata.insert("retailer_city".into(), json!(city));
                }
                if let Some(state) = address.state {
                    metadata.insert("retailer_state".into(), json!(state));
                }
            }
        }

        Ok(Catalog::new(
            request.target_url.clone(),
            self.name(),
            products,
            metadata,
        ))
    }
}

/// The retailer slug is the last non-empty path segment of the
/// storefront URL.
fn retailer_slug(target_url: &str) -> Option<String> {
    let parsed = url::Url::parse(target_url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(|s| s.to_string())
}

/// Recreational menus are public; medical menus often require card
/// verification. Prefer the former when the retailer offers both.
fn preferred_menu_type(menu_types: &[String]) -> &'static str {
    if menu_types.iter().any(|t| t == "RECREATIONAL") || menu_types.is_empty() {
        "RECREATIONAL"
    } else {
        "MEDICAL"
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::UpstreamUnavailable("request timed out".into())
    } else {
        FetchError::UpstreamUnavailable(e.to_string())
    }
}

/// Auth and schema problems are rejections (another attempt would fail
/// the same way); server errors and rate limits are worth retrying.
fn classify_status(status: u16) -> Option<FetchError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(FetchError::UpstreamRejected(format!("status {status}"))),
        429 => Some(FetchError::UpstreamUnavailable("rate limited".into())),
        500..=599 => Some(FetchError::UpstreamUnavailable(format!("status {status}"))),
        _ => Some(FetchError::UpstreamRejected(format!("status {status}"))),
    }
}

/// Collapse a product's variants into one normalized record: lowest
/// regular price, lowest special price when it actually undercuts the
/// regular one, in stock while any variant is not sold out.
fn normalize_product(raw: MenuProduct) -> Option<Product> {
    let mut product = Product::new(raw.name?);
    product.brand = raw.brand.and_then(|b| b.name);
    product.category = raw.category;
    product.thc_content = raw.potency_thc.and_then(|p| p.formatted);
    product.cbd_content = raw.potency_cbd.and_then(|p| p.formatted);
    product.strain_type = raw.strain_type;

    let regular = raw
        .variants
        .iter()
        .filter_map(|v| v.price_rec)
        .fold(None, min_price);
    let special = raw
        .variants
        .iter()
        .filter_map(|v| v.special_price_rec)
        .fold(None, min_price);

    product.regular_price = regular;
    product.special_price = match (regular, special) {
        (Some(r), Some(s)) if s < r => Some(s),
        (None, Some(s)) => Some(s),
        _ => None,
    };
    product.in_stock = raw.variants.iter().any(|v| !v.sold_out.unwrap_or(true));
    Some(product)
}

fn min_price(acc: Option<f64>, price: f64) -> Option<f64> {
    match acc {
        Some(current) if current <= price => Some(current),
        _ => Some(price),
    }
}

// ── Wire types ──

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetailerData {
    retailer_by_url_name: Option<Retailer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Retailer {
    id: String,
    name: String,
    #[serde(default)]
    menu_types: Vec<String>,
    address: Option<Address>,
}

#[derive(Debug, Deserialize)]
struct Address {
    city: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MenuData {
    menu: Option<Menu>,
}

#[derive(Debug, Deserialize)]
struct Menu {
    #[serde(default)]
    products: Vec<MenuProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MenuProduct {
    name: Option<String>,
    category: Option<String>,
    brand: Option<Brand>,
    potency_thc: Option<Potency>,
    potency_cbd: Option<Potency>,
    strain_type: Option<String>,
    #[serde(default)]
    variants: Vec<Variant>,
}

#[derive(Debug, Deserialize)]
struct Brand {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Potency {
    formatted: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Variant {
    price_rec: Option<f64>,
    special_price_rec: Option<f64>,
    sold_out: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_product(json_str: &str) -> MenuProduct {
        serde_json::from_str(json_str).unwrap()
    }

    #[test]
    fn test_retailer_slug_extraction() {
        assert_eq!(
            retailer_slug("https://dutchie.com/dispensary/mission-catonsville").as_deref(),
            Some("mission-catonsville")
        );
        assert_eq!(
            retailer_slug("https://dutchie.com/embedded-menu/store/").as_deref(),
            Some("store")
        );
        assert!(retailer_slug("https://dutchie.com").is_none());
        assert!(retailer_slug("not a url").is_none());
    }

    #[test]
    fn test_menu_type_preference() {
        let both = vec!["MEDICAL".to_string(), "RECREATIONAL".to_string()];
        assert_eq!(preferred_menu_type(&both), "RECREATIONAL");
        let medical_only = vec!["MEDICAL".to_string()];
        assert_eq!(preferred_menu_type(&medical_only), "MEDICAL");
        assert_eq!(preferred_menu_type(&[]), "RECREATIONAL");
    }

    #[test]
    fn test_normalize_takes_minimum_variant_price() {
        let product = normalize_product(raw_product(
            r#"{
                "name": "Blue Dream",
                "variants": [
                    {"priceRec": 45.0, "soldOut": false},
                    {"priceRec": 35.0, "soldOut": true},
                    {"priceRec": 80.0, "soldOut": false}
                ]
            }"#,
        ))
        .unwrap();
        assert_eq!(product.regular_price, Some(35.0));
        assert!(product.in_stock);
    }

    #[test]
    fn test_normalize_special_price_only_when_lower() {
        let discounted = normalize_product(raw_product(
            r#"{
                "name": "Gummies",
                "variants": [{"priceRec": 25.0, "specialPriceRec": 18.0, "soldOut": false}]
            }"#,
        ))
        .unwrap();
        assert_eq!(discounted.regular_price, Some(25.0));
        assert_eq!(discounted.special_price, Some(18.0));

        let not_a_deal = normalize_product(raw_product(
            r#"{
                "name": "Gummies",
                "variants": [{"priceRec": 25.0, "specialPriceRec": 25.0, "soldOut": false}]
            }"#,
        ))
        .unwrap();
        assert_eq!(not_a_deal.special_price, None);
    }

    #[test]
    fn test_normalize_sold_out_inversion() {
        let sold_out = normalize_product(raw_product(
            r#"{
                "name": "Vape Cart",
                "variants": [{"priceRec": 40.0, "soldOut": true}, {"priceRec": 40.0}]
            }"#,
        ))
        .unwrap();
        // A variant without soldOut counts as unavailable.
        assert!(!sold_out.in_stock);

        let available = normalize_product(raw_product(
            r#"{
                "name": "Vape Cart",
                "variants": [{"priceRec": 40.0, "soldOut": true}, {"priceRec": 42.0, "soldOut": false}]
            }"#,
        ))
        .unwrap();
        assert!(available.in_stock);
    }

    #[test]
    fn test_normalize_drops_nameless_products() {
        assert!(normalize_product(raw_product(r#"{"variants": []}"#)).is_none());
    }

    #[test]
    fn test_normalize_carries_descriptive_fields() {
        let product = normalize_product(raw_product(
            r#"{
                "name": "Sour Diesel 1g",
                "category": "Flower",
                "brand": {"name": "House Farms"},
                "potencyThc": {"formatted": "22.4%"},
                "potencyCbd": {"formatted": "0.1%"},
                "strainType": "SATIVA",
                "variants": [{"priceRec": 12.0, "soldOut": false}]
            }"#,
        ))
        .unwrap();
        assert_eq!(product.brand.as_deref(), Some("House Farms"));
        assert_eq!(product.category.as_deref(), Some("Flower"));
        assert_eq!(product.thc_content.as_deref(), Some("22.4%"));
        assert_eq!(product.cbd_content.as_deref(), Some("0.1%"));
        assert_eq!(product.strain_type.as_deref(), Some("SATIVA"));
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(200).is_none());
        assert!(matches!(
            classify_status(401),
            Some(FetchError::UpstreamRejected(_))
        ));
        assert!(matches!(
            classify_status(403),
            Some(FetchError::UpstreamRejected(_))
        ));
        assert!(matches!(
            classify_status(429),
            Some(FetchError::UpstreamUnavailable(_))
        ));
        assert!(matches!(
            classify_status(503),
            Some(FetchError::UpstreamUnavailable(_))
        ));
    }
}
