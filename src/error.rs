//! Error types for Keel

use std::fmt;
use thiserror::Error;

/// Result type for Keel operations
pub type Result<T> = std::result::Result<T, KeelError>;

/// Result type for a single engine call
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Kind of engine resource an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Container,
    Network,
    Volume,
    Image,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Container => write!(f, "container"),
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Image => write!(f, "image"),
        }
    }
}

/// Failures reported by the container engine, classified by cause.
///
/// Nothing at the engine layer is retried; callers decide.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine unreachable: {0}")]
    Unreachable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    #[error("{kind} conflict on {id}: {message}")]
    Conflict {
        kind: ResourceKind,
        id: String,
        message: String,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Timeout during {operation} of {id}")]
    Timeout { operation: String, id: String },

    #[error("Container {id} is {status} right after start")]
    NotRunning { id: String, status: String },

    #[error("Build of {tag} failed: {message}")]
    BuildFailed { tag: String, message: String },

    #[error("Engine API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Engine protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    /// Whether the caller may safely retry the same call
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Unreachable(_) | EngineError::Timeout { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

/// Step of a redeploy transaction at which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeployStep {
    Inspect,
    Pull,
    Stop,
    Create,
    Start,
    Verify,
    RemoveOriginal,
    Rename,
}

impl fmt::Display for RedeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedeployStep::Inspect => write!(f, "inspect"),
            RedeployStep::Pull => write!(f, "pull"),
            RedeployStep::Stop => write!(f, "stop"),
            RedeployStep::Create => write!(f, "create"),
            RedeployStep::Start => write!(f, "start"),
            RedeployStep::Verify => write!(f, "verify"),
            RedeployStep::RemoveOriginal => write!(f, "remove-original"),
            RedeployStep::Rename => write!(f, "rename"),
        }
    }
}

/// Keel error types
#[derive(Error, Debug)]
pub enum KeelError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Invalid compose graph: {0}")]
    InvalidComposeGraph(String),

    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Invalid delta: {0}")]
    InvalidDelta(String),

    #[error("Dockerfile parse error at line {line}: {message}")]
    DockerfileParse { line: usize, message: String },

    #[error("Redeploy of {container} failed at {step}: {source}{}", rollback_note(.step, .rollback))]
    RedeployFailed {
        container: String,
        step: RedeployStep,
        #[source]
        source: EngineError,
        /// Set when the original could not be put back as it was
        rollback: Option<String>,
    },

    #[error(
        "Stack {project} failed {}: {source}{}",
        stage_note(.service),
        cleanup_note(.rollback_failures)
    )]
    PartialStackFailure {
        project: String,
        /// `None` when networks or volumes failed before any service
        service: Option<String>,
        #[source]
        source: Box<KeelError>,
        rollback_failures: Vec<String>,
    },

    #[error("Container {0} was not started with docker compose")]
    NotComposeManaged(String),

    #[error("Compose file unavailable: {0}")]
    ComposeFileUnavailable(String),

    #[error("Stack already exists: {0}")]
    StackExists(String),

    #[error("Operation on {0} cancelled before any change was made")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn rollback_note(step: &RedeployStep, rollback: &Option<String>) -> String {
    match (step, rollback) {
        (_, Some(err)) => format!(" (rollback incomplete: {})", err),
        (RedeployStep::Inspect | RedeployStep::Pull, None) => " (original container untouched)".to_string(),
        (_, None) => " (original container restored)".to_string(),
    }
}

fn stage_note(service: &Option<String>) -> String {
    match service {
        Some(service) => format!("at service {}", service),
        None => "creating networks and volumes".to_string(),
    }
}

fn cleanup_note(failures: &[String]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!(" (cleanup failures: {})", failures.join("; "))
    }
}

impl KeelError {
    /// Whether the error came from lock contention
    pub fn is_busy(&self) -> bool {
        matches!(self, KeelError::ResourceBusy(_))
    }

    /// Engine error underneath this one, if any
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            KeelError::Engine(e) => Some(e),
            KeelError::RedeployFailed { source, .. } => Some(source),
            KeelError::PartialStackFailure { source, .. } => source.engine_error(),
            _ => None,
        }
    }
}
