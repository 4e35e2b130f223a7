pub mod config;
pub mod group;
pub mod snapshot;
pub mod status;

pub use config::{Defaults, DefaultsError};
pub use group::{CacheGroup, ConnectOptions};
pub use snapshot::{Snapshot, StatusSink};
pub use status::{CacheKey, QueryError, Status};
