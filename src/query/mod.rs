pub mod handle;
pub mod options;
pub mod orchestrator;
pub mod response;
pub mod scheduler;

pub use handle::StoreHandle;
pub use options::{CachingKey, Fetcher, QueryFn, QueryOptions, QueryStream, ResolvedOptions};
pub use orchestrator::Query;
pub use response::{Response, ResponseKind};
pub use scheduler::RefetchSource;
