//! Blueberry API clients for external services.
//!
//! This crate provides:
//! - `QuoteProvider`: swap quote abstraction used by the liquidation planner
//! - `ParaswapClient`: Paraswap v5 aggregator quotes with a TTL cache

mod paraswap;
mod quote;

pub use paraswap::ParaswapClient;
pub use quote::{min_return, QuoteProvider, QuoteRequest, SwapQuote};
