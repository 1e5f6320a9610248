// Copyright 2026 Trellis Contributors
// SPDX-License-Identifier: Apache-2.0

//! Trellis, a fetch-and-cache engine for dispensary product catalogs.
//!
//! A structured-API fast path (GraphQL menu endpoint) with a
//! browser-automation fallback, behind a dual-tier TTL cache and an
//! egress identity rotator. The [`orchestrator::FetchEngine`] ties the
//! pieces together; [`rest`] exposes them over HTTP.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod orchestrator;
pub mod rest;
pub mod rotation;

pub use catalog::{Catalog, CatalogRequest, Product};
pub use error::{FetchError, FetchResult};
pub use orchestrator::{FetchEngine, FetchOutcome, FetchState};
