pub mod environment_cache;
pub mod memory;
pub mod traits;
pub mod version_cache;

pub use environment_cache::EnvironmentCache;
pub use memory::MemoryStore;
pub use traits::*;
pub use version_cache::CachedContentContainer;
