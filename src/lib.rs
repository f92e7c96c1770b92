pub mod checkpoint;
pub mod config;
pub mod error;
pub mod graceful_shutdown;
pub mod health;
pub mod ingest;
pub mod json_util;
pub mod normalize;
pub mod paginate;
pub mod schema;
pub mod sink;
pub mod source;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
