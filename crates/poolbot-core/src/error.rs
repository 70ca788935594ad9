use poolbot_providers::UpstreamError;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no usable upstream accounts in the pool")]
    Exhausted,
}

/// Failure of a single send attempt below the router boundary.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl RouteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RouteError::Pool(_) => None,
            RouteError::Upstream(err) => err.status(),
        }
    }
}
