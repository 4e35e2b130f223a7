use crate::cache::QueryError;
use std::fmt;
use std::sync::Arc;

/// Outcome of one settled attempt
pub enum ResponseKind<A> {
    Success(Arc<A>),
    Error(QueryError),
}

/// Event published for every settle, even when the data did not change
pub struct Response<A, P> {
    pub kind: ResponseKind<A>,
    pub param: P,
    /// Issued by a refetch source or `reload` rather than `fetch`
    pub refetch: bool,
}

impl<A, P> Response<A, P> {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.kind, ResponseKind::Success(_))
    }

    #[must_use]
    pub fn data(&self) -> Option<&Arc<A>> {
        match &self.kind {
            ResponseKind::Success(data) => Some(data),
            ResponseKind::Error(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&QueryError> {
        match &self.kind {
            ResponseKind::Success(_) => None,
            ResponseKind::Error(error) => Some(error),
        }
    }
}

impl<A> Clone for ResponseKind<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Success(data) => Self::Success(Arc::clone(data)),
            Self::Error(error) => Self::Error(error.clone()),
        }
    }
}

impl<A, P: Clone> Clone for Response<A, P> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            param: self.param.clone(),
            refetch: self.refetch,
        }
    }
}

impl<A, P: fmt::Debug> fmt::Debug for Response<A, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ResponseKind::Success(_) => "success".to_string(),
            ResponseKind::Error(error) => format!("error: {error}"),
        };
        f.debug_struct("Response")
            .field("kind", &kind)
            .field("param", &self.param)
            .field("refetch", &self.refetch)
            .finish()
    }
}
