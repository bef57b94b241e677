//! Keel - container configuration reconciliation and redeploy
//!
//! Keel inspects containers, networks and volumes on a Docker host and
//! changes them without losing what is already running:
//!
//! - Normalized, engine-agnostic views of containers, networks and volumes
//! - Redeploys that recreate a container under the same name, rolling back
//!   to the original when the replacement does not come up
//! - Compose stacks created from pasted text and edited in place, touching
//!   only the services whose configuration changed
//! - Per-resource locks so concurrent changes to one container or stack are
//!   rejected instead of interleaved
//! - Network, volume and image operations, plus engine info and disk usage

pub mod compose;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod image;
pub mod lock;
pub mod manager;
pub mod network;
pub mod normalize;
pub mod reconcile;
pub mod storage;
pub mod system;

pub use error::{KeelError, Result};
