//! pricefetch library
//!
//! Resolves pricing quotes for many catalog items through a persistent TTL
//! cache and a rate-limited remote pricing service. The binary is a thin
//! adapter over [`runtime::PricingRuntime`]; the modules are public for
//! integration tests and embedding.

pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod fetch;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod region;
pub mod runtime;
