//! Round-Robin TCP Proxy
//!
//! A transparent TCP proxy that spreads incoming connections across a fixed
//! list of backend ports in round-robin order. Requests carrying a WebSocket
//! upgrade are relayed full-duplex for the life of the connection; everything
//! else goes through a single readiness-driven copy loop. Bytes are forwarded
//! unmodified in both directions.

pub mod classify;
pub mod config;
pub mod proxy;
pub mod relay;
pub mod selector;
pub mod server;

// Re-export commonly used types and functions
pub use classify::{ConnectionKind, classify};
pub use config::{Config, DEFAULT_CONFIG_FILE, load_config};
pub use proxy::{Outcome, Proxy, handle_connection};
pub use relay::{RelayStats, relay_full_duplex, relay_multiplexed};
pub use selector::TargetSelector;
pub use server::{bind, run, serve};
