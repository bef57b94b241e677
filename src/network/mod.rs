//! Network management module
//!
//! Network entities as seen through the engine, and creation requests.

pub mod config;

pub use config::{
    Network, NetworkSpec, DEFAULT_BRIDGE_NETWORK, DEFAULT_NETWORK_DRIVER, PREDEFINED_NETWORKS,
};
