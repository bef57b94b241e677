//! Storage management module
//!
//! Volume entities as seen through the engine, and creation requests.

pub mod volume;

pub use volume::{Volume, VolumeSpec, DEFAULT_VOLUME_DRIVER};
