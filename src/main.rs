// Copyright 2026 Trellis Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use trellis::cache::CatalogCache;
use trellis::catalog::CatalogRequest;
use trellis::config::Config;
use trellis::fetch::{BrowserFetcher, ChromiumDriver, MenuApiFetcher};
use trellis::orchestrator::FetchEngine;
use trellis::rest;
use trellis::rotation::IdentityRotator;

#[derive(Parser)]
#[command(
    name = "trellis",
    about = "Trellis — dispensary catalog fetch-and-cache service",
    version,
    after_help = "Run 'trellis <command> --help' for details on each command."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on (overrides TRELLIS_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Fetch one catalog and print it
    Fetch {
        /// Storefront URL (e.g. "dutchie.com/dispensary/green-leaf")
        url: String,
        /// Page budget for paginated storefronts
        #[arg(long)]
        max_pages: Option<u32>,
        /// Bypass the cache and fetch fresh
        #[arg(long)]
        force_refresh: bool,
        /// Print the raw catalog JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Drop cached catalogs matching a key pattern
    Clear {
        /// Glob-style key pattern
        #[arg(long, default_value = "*")]
        pattern: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trellis=info".parse().unwrap()),
        )
        .init();

    let config = Config::from_env();

    match cli.command {
        Commands::Serve { port } => {
            let engine = build_engine(&config).await;
            let port = port.unwrap_or(config.port);
            info!("starting Trellis v{}", env!("CARGO_PKG_VERSION"));
            rest::start(port, engine).await
        }
        Commands::Fetch {
            url,
            max_pages,
            force_refresh,
            json,
        } => {
            let engine = build_engine(&config).await;
            let mut request = CatalogRequest::new(url);
            if let Some(pages) = max_pages {
                request.max_pages = pages;
            }
            request.force_refresh = force_refresh;
            request.include_metadata = json;

            let outcome = engine.fetch(&request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(outcome.catalog.as_ref())?);
            } else {
                print_summary(&outcome);
            }
            Ok(())
        }
        Commands::Cache {
            command: CacheCommands::Clear { pattern },
        } => {
            let cache = CatalogCache::new(&config.cache).await;
            let cleared = cache.clear(&pattern).await;
            println!("cleared {cleared} cached entries matching '{pattern}'");
            Ok(())
        }
    }
}

async fn build_engine(config: &Config) -> FetchEngine {
    let cache = CatalogCache::new(&config.cache).await;
    let rotator = IdentityRotator::new(&config.rotator);
    let api = Arc::new(MenuApiFetcher::new(
        &config.graphql_endpoint,
        config.engine.attempt_timeout,
    ));
    let browser = Arc::new(BrowserFetcher::new(
        Arc::new(ChromiumDriver::new()),
        config.engine.attempt_timeout,
    ));
    FetchEngine::new(cache, rotator, api, browser, &config.engine)
}

fn print_summary(outcome: &trellis::FetchOutcome) {
    let catalog = &outcome.catalog;
    println!(
        "{} ({} products, source: {}, cache: {})",
        catalog.url,
        catalog.total_products,
        catalog.source,
        if outcome.cache_hit { "hit" } else { "miss" }
    );
    for product in &catalog.products {
        let price = product
            .active_price()
            .map(|p| format!("${p:.2}"))
            .unwrap_or_else(|| "n/a".to_string());
        let category = product.category.as_deref().unwrap_or("uncategorized");
        let stock = if product.in_stock { "" } else { "  [out of stock]" };
        println!("  {price:>9}  {category:<14} {}{stock}", product.name);
    }
}
