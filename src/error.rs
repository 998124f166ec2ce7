//! Error types for the unified replication operator
//!
//! Every surfaced error is classified by kind; retryability is a property of
//! the kind, not of the call site.

use crate::translation::Backend;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of an error, independent of its concrete type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Connection,
    Validation,
    Operation,
    Timeout,
    Permission,
    Resource,
    Unknown,
}

impl ErrorKind {
    /// Connection, timeout and resource pressure are transient; everything
    /// else requires an external change before a retry can succeed.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Resource
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "Configuration",
            ErrorKind::Connection => "Connection",
            ErrorKind::Validation => "Validation",
            ErrorKind::Operation => "Operation",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Permission => "Permission",
            ErrorKind::Resource => "Resource",
            ErrorKind::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// An error raised by a backend adapter, carrying enough context to surface
/// in a condition: kind, backend, operation verb and affected object.
#[derive(Debug)]
pub struct BackendError {
    pub kind: ErrorKind,
    pub backend: Backend,
    pub operation: String,
    pub object: String,
    pub message: String,
    pub remediation: Option<String>,
    pub source: Option<Box<Error>>,
}

impl BackendError {
    pub fn new(
        kind: ErrorKind,
        backend: Backend,
        operation: impl Into<String>,
        object: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            backend,
            operation: operation.into(),
            object: object.into(),
            message: message.into(),
            remediation: None,
            source: None,
        }
    }

    pub fn with_remediation(mut self, hint: impl Into<String>) -> Self {
        self.remediation = Some(hint.into());
        self
    }

    pub fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} failed for '{}': {} (kind={}, retryable={})",
            self.backend, self.operation, self.object, self.message, self.kind,
            self.kind.is_retriable()
        )
    }
}

/// Operator-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("translation error: {0}")]
    TranslationError(String),

    #[error("{0}")]
    BackendError(BackendError),

    #[error("operation timed out after {0:?}")]
    TimeoutError(std::time::Duration),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Classify this error per the kind table.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::KubeError(e) => classify_kube_error(e),
            Error::ConfigError(_) => ErrorKind::Configuration,
            Error::ValidationError(_) => ErrorKind::Validation,
            Error::TranslationError(_) => ErrorKind::Validation,
            Error::BackendError(e) => e.kind,
            Error::TimeoutError(_) => ErrorKind::Timeout,
            Error::SerializationError(_) => ErrorKind::Operation,
            Error::FinalizerError(_) => ErrorKind::Operation,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Optimistic-concurrency conflicts are requeued immediately, without
    /// backoff, so they get their own predicate.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }
}

fn classify_kube_error(err: &kube::Error) -> ErrorKind {
    match err {
        kube::Error::Api(resp) => match resp.code {
            401 | 403 => ErrorKind::Permission,
            400 | 422 => ErrorKind::Validation,
            408 => ErrorKind::Timeout,
            409 => ErrorKind::Resource,
            429 => ErrorKind::Resource,
            500..=599 => ErrorKind::Connection,
            _ => ErrorKind::Operation,
        },
        kube::Error::HyperError(_) | kube::Error::Service(_) => ErrorKind::Connection,
        kube::Error::Auth(_) => ErrorKind::Permission,
        _ => ErrorKind::Unknown,
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(err))
    }
}
