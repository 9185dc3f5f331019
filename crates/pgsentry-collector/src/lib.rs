//! Connectivity to monitored endpoints.
//!
//! One shared connection per endpoint with a concurrency cap, probe
//! serialization, the server descriptor cache (version / recovery /
//! size / reachability state), simple-query row conversion, pool
//! frontend normalization, and the instance-level metric cache.

pub mod instance_cache;
pub mod manager;
pub mod pools;
pub mod probe;
pub mod rows;

pub use instance_cache::InstanceCache;
pub use manager::ConnectionManager;
pub use probe::DescriptorCache;
