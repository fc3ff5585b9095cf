pub mod cache;
pub mod model;
pub mod selector;

#[cfg(test)]
pub(crate) mod fixtures;

pub use cache::{CacheStatus, ServerCache};
pub use model::{Feature, LogicalServer, PhysicalServer, ServerCacheEnvelope, ServerLoad};
pub use selector::ServerIntent;
