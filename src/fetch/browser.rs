//! Browser-automation fetch strategy.
//!
//! Drives a real Chromium session against the storefront, waits for the
//! menu to render, and extracts products from the resulting DOM with CSS
//! selectors and regex passes. Slower and heavier than the structured
//! API, but works when the API is blocked or the schema has drifted.
//!
//! HTML parsing happens in synchronous helpers because the `scraper`
//! crate's types are `!Send`; parsed documents never live across an
//! await point.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use tracing::{debug, warn};

use crate::catalog::{Catalog, CatalogRequest, Product};
use crate::error::{FetchError, FetchResult};
use crate::rotation::Identity;

use super::driver::{BrowserDriver, BrowserSession};
use super::CatalogFetcher;

/// Product card containers across storefront themes.
const CONTAINER_SELECTORS: &str =
    ".product, .product-item, [data-product-id], article.product, [data-testid='product-list-item'], [class*='product-card']";

const NAME_SELECTORS: &str =
    "[data-testid='product-title'], [data-test-id='product-title'], .ProductTitle, [class*='product-name'], h3, h4";

const BRAND_SELECTORS: &str =
    "[data-testid='product-brand'], [data-test-id='product-brand'], [class*='brand']";

const CATEGORY_SELECTORS: &str =
    "[data-test-id='product-category'], .ProductCategory, [class*='category']";

const PRICE_SELECTORS: &str =
    "[data-test-id='product-price'], .ProductPrice, [data-price], [class*='price']";

/// Phrases that only appear on block/challenge interstitials, never in a
/// rendered menu.
const BLOCK_MARKERS: &[&str] = &[
    "access denied",
    "verify you are human",
    "unusual traffic from your",
    "pardon our interruption",
    "request has been blocked",
];

const NEXT_PAGE_JS: &str = r#"
(() => {
    const next = document.querySelector(
        "[data-testid='pagination-next'], button[aria-label='Next'], button[aria-label='Next page'], a[rel='next']"
    );
    if (next && !next.disabled && next.getAttribute('aria-disabled') !== 'true') {
        next.click();
        return true;
    }
    return false;
})()
"#;

fn render_probe_js() -> String {
    format!("document.querySelectorAll(\"{CONTAINER_SELECTORS}\").length")
}

/// Session-based catalog fetcher.
pub struct BrowserFetcher {
    driver: Arc<dyn BrowserDriver>,
    nav_timeout_ms: u64,
    poll_interval_ms: u64,
    page_settle_ms: u64,
}

impl BrowserFetcher {
    pub fn new(driver: Arc<dyn BrowserDriver>, nav_timeout: Duration) -> Self {
        Self {
            driver,
            nav_timeout_ms: nav_timeout.as_millis() as u64,
            poll_interval_ms: 500,
            page_settle_ms: 1_000,
        }
    }

    /// Walk the storefront page by page up to the request's budget.
    /// Products are deduplicated by name across pages because paginated
    /// menus re-render overlapping items.
    async fn walk_catalog(
        &self,
        session: &mut dyn BrowserSession,
        request: &CatalogRequest,
    ) -> FetchResult<(Vec<Product>, u32)> {
        session
            .navigate(&request.target_url, self.nav_timeout_ms)
            .await?;
        self.await_menu_render(session).await?;

        let mut products: Vec<Product> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut pages_fetched = 0u32;

        loop {
            let html = session.page_html().await?;
            if let Some(marker) = blocked_marker(&html) {
                return Err(FetchError::BlockedByTarget(marker));
            }

            let page_products = extract_products(&html);
            pages_fetched += 1;
            debug!(
                page = pages_fetched,
                found = page_products.len(),
                "extracted product cards"
            );
            for product in page_products {
                if seen.insert(product.name.clone()) {
                    products.push(product);
                }
            }

            if pages_fetched >= request.max_pages {
                break;
            }
            if !self.advance_page(session).await? {
                break;
            }
        }

        if products.is_empty() {
            return Err(FetchError::UpstreamUnavailable(
                "storefront rendered no product content".into(),
            ));
        }
        Ok((products, pages_fetched))
    }

    /// Poll until at least one product container exists or the deadline
    /// passes. A zero count is not conclusive on its own; the caller
    /// judges the final HTML, which may be a block page or an empty menu.
    async fn await_menu_render(&self, session: &mut dyn BrowserSession) -> FetchResult<()> {
        let probe = render_probe_js();
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.nav_timeout_ms);
        loop {
            let count = session.execute_js(&probe).await?;
            if count.as_u64().unwrap_or(0) > 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(self.poll_interval_ms)).await;
        }
    }

    /// Click the next-page control if one is present and enabled.
    /// Returns false when the walk has reached the last page.
    async fn advance_page(&self, session: &mut dyn BrowserSession) -> FetchResult<bool> {
        let clicked = session.execute_js(NEXT_PAGE_JS).await?;
        if !clicked.as_bool().unwrap_or(false) {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(self.page_settle_ms)).await;
        self.await_menu_render(session).await?;
        Ok(true)
    }
}

#[async_trait]
impl CatalogFetcher for BrowserFetcher {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn fetch(&self, request: &CatalogRequest, identity: &Identity) -> FetchResult<Catalog> {
        let mut session = self.driver.open_session(identity).await?;
        let walked = self.walk_catalog(&mut *session, request).await;
        // Teardown runs on every path so a failed walk never leaks a
        // browser process.
        if let Err(e) = session.close().await {
            warn!(error = %e, "browser session teardown failed");
        }
        let (products, pages_fetched) = walked?;

        let mut metadata = std::collections::HashMap::new();
        if request.include_metadata {
            metadata.insert("strategy".into(), json!(self.name()));
            metadata.insert("pages_fetched".into(), json!(pages_fetched));
        }
        Ok(Catalog::new(
            request.target_url.clone(),
            self.name(),
            products,
            metadata,
        ))
    }

    fn timeout_error(&self, elapsed_ms: u64) -> FetchError {
        FetchError::RenderTimeout(elapsed_ms)
    }
}

// ── Synchronous DOM extraction ──

/// Check the rendered page for block-interstitial phrasing. Returns the
/// matched marker for diagnostics.
fn blocked_marker(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let mut text = String::new();
    if let Ok(sel) = Selector::parse("title") {
        if let Some(title) = document.select(&sel).next() {
            text.push_str(&element_text(&title));
            text.push(' ');
        }
    }
    if let Ok(sel) = Selector::parse("body") {
        if let Some(body) = document.select(&sel).next() {
            text.push_str(&element_text(&body));
        }
    }
    let text = text.to_lowercase();
    BLOCK_MARKERS
        .iter()
        .find(|marker| text.contains(**marker))
        .map(|marker| marker.to_string())
}

/// Extract every product card in the document.
fn extract_products(html: &str) -> Vec<Product> {
    let document = Html::parse_document(html);
    let mut products = Vec::new();
    if let Ok(sel) = Selector::parse(CONTAINER_SELECTORS) {
        for card in document.select(&sel) {
            if let Some(product) = extract_product(&card) {
                products.push(product);
            }
        }
    }
    products
}

/// Pull one normalized product out of a card element. Cards without a
/// recognizable name are skipped.
fn extract_product(card: &ElementRef<'_>) -> Option<Product> {
    let name = first_text(card, NAME_SELECTORS)?;
    let mut product = Product::new(name);
    product.brand = first_text(card, BRAND_SELECTORS);
    product.category = first_text(card, CATEGORY_SELECTORS);

    let card_text = element_text(card);
    let price_text = first_text(card, PRICE_SELECTORS).unwrap_or_else(|| card_text.clone());

    // Menus render discounts as a pair of amounts. The higher one is the
    // regular price, the lower one the special.
    let mut amounts = dollar_amounts(&price_text);
    amounts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if let (Some(&low), Some(&high)) = (amounts.first(), amounts.last()) {
        product.regular_price = Some(high);
        if low < high {
            product.special_price = Some(low);
        }
    }

    product.thc_content = potency_from_text(&card_text, "THC");
    product.cbd_content = potency_from_text(&card_text, "CBD");
    product.strain_type = strain_from_text(&card_text);

    let lower = card_text.to_lowercase();
    product.in_stock = !lower.contains("out of stock") && !lower.contains("sold out");
    Some(product)
}

fn first_text(el: &ElementRef<'_>, selectors: &str) -> Option<String> {
    let sel = Selector::parse(selectors).ok()?;
    el.select(&sel)
        .map(|m| element_text(&m))
        .find(|text| !text.is_empty())
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// All dollar amounts in the text, commas stripped.
fn dollar_amounts(text: &str) -> Vec<f64> {
    let re = Regex::new(r"\$\s*([0-9][0-9,]*(?:\.[0-9]{1,2})?)").expect("price regex is valid");
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .collect()
}

/// Extract a formatted potency value like "22.4%" for the given
/// cannabinoid label.
fn potency_from_text(text: &str, label: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?i){label}:?\s*([0-9]+(?:\.[0-9]+)?)\s*%"))
        .expect("potency regex is valid");
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("{}%", m.as_str()))
}

fn strain_from_text(text: &str) -> Option<String> {
    let re = Regex::new(r"(?i)\b(indica|sativa|hybrid)\b").expect("strain regex is valid");
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_uppercase())
}
