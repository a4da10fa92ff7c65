pub mod config;
pub mod entry;
pub mod key;
pub mod request_cache;

pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use key::CacheKey;
pub use request_cache::{CacheStats, RequestCache};
