// =============================================================================
// Exchange adapters — the venue-facing seam
// =============================================================================

pub mod adapter;
pub mod rest;

pub use adapter::{
    AccountBalance, ExchangeAdapter, ExchangePosition, OrderAck, OrderError, OrderRequest, Ticker,
};
pub use rest::SignedRestExchange;
