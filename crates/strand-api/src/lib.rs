//! HTTP/JSON implementation of the engine's `Backend` contract.

pub mod client;
pub mod error;
pub mod routes;

pub use client::HttpBackend;
pub use error::ApiError;
