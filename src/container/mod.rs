//! Container management module
//!
//! Normalized container entities, creation specs, and the partial updates
//! a redeploy merges into them.

pub mod config;
pub mod delta;

pub use config::{
    Container, ContainerSpec, ContainerStatus, Mount, MountKind, NetworkAttachment, PortBinding,
    PortMap, RuntimeSettings, StartedWith,
};
pub use delta::ContainerDelta;
