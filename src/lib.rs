//! hypermirror: a copy-trading mirror for Hyperliquid perpetuals. Streams a
//! leader account over the venue feed and drives a follower account to an
//! economically equivalent, risk-scaled portfolio: passive orders are
//! mirrored by client id, position drift is closed with marketable orders.

pub mod alo;
pub mod cache;
pub mod cloid;
pub mod config;
pub mod error;
pub mod exchange;
pub mod frame;
pub mod ioc;
pub mod logging;
pub mod models;
pub mod mux;
pub mod pipeline;
pub mod registry;
pub mod scale;
pub mod ws;
