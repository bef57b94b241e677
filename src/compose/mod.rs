//! Docker Compose model
//!
//! Parses compose documents into a typed service graph, resolves them into
//! the concrete containers, networks and volumes of a project, and keeps
//! the operator's source text for in-place edits.

pub mod config;
pub mod document;
pub mod graph;
pub mod labels;
pub mod parser;
pub mod project;

pub use config::{ComposeConfig, ServiceConfig};
pub use document::{compose_file_for, ComposeDocument};
pub use parser::ComposeParser;
pub use project::{Project, ProjectNetwork, ProjectVolume, ServiceSpec};
