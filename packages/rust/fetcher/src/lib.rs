//! Source retrieval and post extraction.
//!
//! This crate provides:
//! - [`HttpFetcher`], a timeout-bounded HTTP client for channel preview pages
//! - [`extract_blocks`], CSS-selector based post extraction

pub mod client;
pub mod extract;

pub use client::HttpFetcher;
pub use extract::{extract_blocks, parse_selector};
