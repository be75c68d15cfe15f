//! Escrow domain module
//!
//! Trade offer models, the trading-network adapter, the poll-rate ceiling,
//! and the per-loan status poller.

mod client;
mod model;
mod poller;
mod rate_limit;

pub use client::{EscrowError, EscrowGateway, TradeNetworkClient};
pub use model::*;
pub use poller::TradeStatusPoller;
pub use rate_limit::PollRateLimiter;
