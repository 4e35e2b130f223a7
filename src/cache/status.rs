use crate::equality::Structural;
use std::fmt;
use std::sync::Arc;

/// Failure of a query function, shared between status records and response events
#[derive(Clone)]
pub struct QueryError(Arc<anyhow::Error>);

impl QueryError {
    #[must_use]
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<anyhow::Error> for QueryError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl fmt::Debug for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryError({:#})", self.0)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl Structural for QueryError {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        self.ptr_eq(other) || (depth > 0 && self.to_string() == other.to_string())
    }
}

/// Status record of one snapshot
#[derive(Debug)]
pub struct Status<A> {
    /// Milliseconds since epoch of the last success, `0` if it never succeeded
    pub timestamp: i64,
    pub data: Arc<A>,
    pub loading: bool,
    pub error: Option<QueryError>,
    /// Data is the initial value, failed to refresh, went stale or was mutated locally
    pub untrusted_data: bool,
}

impl<A> Status<A> {
    #[must_use]
    pub const fn initial(data: Arc<A>) -> Self {
        Self {
            timestamp: 0,
            data,
            loading: false,
            error: None,
            untrusted_data: true,
        }
    }

    #[must_use]
    pub const fn has_succeeded(&self) -> bool {
        self.timestamp != 0
    }
}

impl<A> Clone for Status<A> {
    fn clone(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            data: Arc::clone(&self.data),
            loading: self.loading,
            error: self.error.clone(),
            untrusted_data: self.untrusted_data,
        }
    }
}

impl<A: Structural> Structural for Status<A> {
    fn eq_depth(&self, other: &Self, depth: usize) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if depth == 0 {
            return false;
        }
        let depth = depth - 1;
        self.timestamp == other.timestamp
            && self.loading == other.loading
            && self.untrusted_data == other.untrusted_data
            && self.error.eq_depth(&other.error, depth)
            && self.data.eq_depth(&other.data, depth)
    }
}

/// Identity of a snapshot inside its group
#[derive(Debug, Clone)]
pub enum CacheKey {
    /// Reserved key of the group's initial snapshot
    Init,
    Value(serde_json::Value),
}

impl CacheKey {
    /// Keys match when both are the sentinel or their values are equal one level deep
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Init, Self::Init) => true,
            (Self::Value(a), Self::Value(b)) => a.eq_depth(b, 1),
            _ => false,
        }
    }

    #[must_use]
    pub const fn is_init(&self) -> bool {
        matches!(self, Self::Init)
    }
}

impl From<serde_json::Value> for CacheKey {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "<init>"),
            Self::Value(value) => write!(f, "{value}"),
        }
    }
}
