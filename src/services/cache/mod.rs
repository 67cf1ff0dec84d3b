pub mod client;
pub mod sweeper;
pub mod ttl;
pub mod valkey;

pub use client::{CacheClient, CacheError, CacheResult};
pub use sweeper::SweeperHandle;
pub use ttl::{MAX_TTL, TtlCache, expires_after};
pub use valkey::ValkeyClient;
