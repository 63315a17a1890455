/// Tab Sorter - Chrome Extension background that sorts tabs into categories
/// Built with Rust + WASM

pub mod background;
pub mod categorizer;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod host;
pub mod messages;
pub mod operations;
pub mod rules;
pub mod storage;
pub mod tab_data;
pub mod tab_store;

#[cfg(target_arch = "wasm32")]
pub mod chrome;

#[cfg(test)]
mod testing;

pub use error::{Result, TabError};

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

// Set up panic hook for better error messages in the browser console
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn main() {
    console_error_panic_hook::set_once();
    wasm_logger::init(wasm_logger::Config::default());
}

// Re-export the categorizer's domain helper for JavaScript access
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub fn extract_domain(url: &str) -> String {
    domain::extract_domain(url).unwrap_or_else(|| "invalid".to_string())
}
