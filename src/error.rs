use crate::target::{GroupKind, ObjectId};

/// Boxed error returned by externally supplied capabilities.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the reporter and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// [`Reporter::start`](crate::Reporter::start) was called more than once.
    #[error("reporter cannot be restarted")]
    AlreadyStarted,
    /// The event funnel stopped accepting input.
    #[error("event funnel already closed")]
    FunnelClosed,
    /// The server has no resource mapping for a group kind,
    /// usually because its CRD is not installed yet.
    #[error("no matches for kind {group_kind}")]
    NoMatch { group_kind: GroupKind },
    /// Kubernetes API error
    #[error("{0}")]
    Kube(#[from] kube_client::Error),
    /// Status computation failed for an object.
    #[error("failed to compute object status: {id}: {source}")]
    Status {
        id: ObjectId,
        #[source]
        source: Box<Error>,
    },
    /// The operation was abandoned because the reporter is shutting down.
    #[error("operation cancelled")]
    Cancelled,
    /// Errors from external capabilities
    #[error("{0}")]
    Custom(#[source] BoxError),
}

impl Error {
    pub fn custom(err: impl Into<BoxError>) -> Self {
        Self::Custom(err.into())
    }

    pub fn is_no_match(&self) -> bool {
        matches!(self, Error::NoMatch { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Status { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
}

impl ExtKubeApiError for kube_client::Error {
    fn is_not_found(&self) -> bool {
        matches!(self, kube_client::Error::Api(e) if e.code == 404)
    }
}

impl ExtKubeApiError for Error {
    fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(e) => e.is_not_found(),
            _ => false,
        }
    }
}
