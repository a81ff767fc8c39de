pub mod client;
pub mod graphql;
pub mod models;

pub use client::{FetchError, ShopifyClient, ShopifyClientConfig};
