//! Historical rolling-window backtests of retirement withdrawal rules.

pub mod api;
pub mod core;
