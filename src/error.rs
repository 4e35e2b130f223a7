use derive_more::From;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    /// Param could not be turned into a cache key
    #[from]
    Json(serde_json::Error),

    /// Spawning background work needs a running tokio runtime
    #[from]
    Runtime(tokio::runtime::TryCurrentError),

    /// A cache group was used before `connect` (or after `freeze`)
    NotConnected(String),

    /// A cache group was used after `destroy`
    GroupDestroyed(String),

    /// A query or store handle was used after `destroy`
    QueryDestroyed(String),

    /// Operation not offered by this kind of store
    Unsupported(&'static str),

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

impl std::error::Error for Error {}
