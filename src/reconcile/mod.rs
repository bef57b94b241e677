//! Reconcilers: the only code that mutates containers
//!
//! [`ContainerReconciler`] replaces a single container with one built from
//! a merged target spec, rolling back to the original on failure.
//! [`StackReconciler`] does the same across the services of a compose
//! project in dependency order.

pub mod container;
pub mod stack;

pub use container::ContainerReconciler;
pub use stack::StackReconciler;

use std::time::Duration;

/// Time allowed past the stop grace period before the engine call is
/// abandoned and the container killed
pub const STOP_SLACK: Duration = Duration::from_secs(2);

/// Per-call timeouts used inside a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Grace period given to a container to stop before it is killed
    pub stop: Duration,
    /// Limit for a start call to return
    pub start: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            stop: Duration::from_secs(10),
            start: Duration::from_secs(30),
        }
    }
}
