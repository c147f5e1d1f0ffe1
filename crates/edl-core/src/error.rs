use thiserror::Error;

/// Result alias used on the data path.
pub type LayerResult<T> = Result<T, LayerError>;

/// Error kinds surfaced by the layer.
///
/// The data path never retries; the first error is surfaced with its kind so
/// the HTTP boundary can map it to a status code. Bad parameters and
/// unsupported operations map to 400, everything else to 500.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Unknown dataset, unparseable since token or malformed body.
    #[error("bad parameter. {0}")]
    BadParameter(String),

    /// Driver error, mapping failure, batch mismatch or SQL build failure.
    #[error("internal error. {0}")]
    Internal(#[source] anyhow::Error),

    /// Operation the layer refuses to guess at, such as latest-only reads.
    #[error("operation not supported in this layer. {0}")]
    NotSupported(String),

    /// Pool creation or ping failure.
    #[error("database connection error. {0}")]
    Connection(#[source] anyhow::Error),
}

impl LayerError {
    pub fn dataset_not_found(name: &str) -> Self {
        LayerError::BadParameter(format!("dataset {name} not found"))
    }

    pub fn query(err: impl Into<anyhow::Error>) -> Self {
        LayerError::Internal(err.into().context("failed to query database"))
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        LayerError::Internal(err.into())
    }

    pub fn connection(err: impl Into<anyhow::Error>) -> Self {
        LayerError::Connection(err.into())
    }

    /// True for errors a client can correct, i.e. those reported as 400.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LayerError::BadParameter(_) | LayerError::NotSupported(_)
        )
    }
}
