//! Pluggable TCP proxy gateway.
//!
//! The crate is organized around the connection dispatch engine:
//! - [`proxy`]: protocol capability traits, the scheme registry and the
//!   built-in `direct` and `socks5` protocols
//! - [`matcher`]: CIDR/exact-IP/domain-suffix route matching
//! - [`dispatcher`]: accept loop and per-connection state machine
//! - [`relay`]: the bidirectional traffic forwarder

pub mod address;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logger;
pub mod matcher;
pub mod proxy;
pub mod relay;
