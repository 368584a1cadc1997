pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod repository;
pub mod seed;
pub mod store;

pub use config::EngineConfig;
pub use error::{Error, Result};

// Export logic types
pub use logic::{
    ContentEngine, DeltaEngine, NewInstance, PermissionEvaluator, PermissionSet, RemoveOptions,
    SecurityInfo, StructureEngine,
};

// Export all model types
pub use model::*;

pub use repository::Repository;
pub use seed::{load_seed_data, SystemIds};

// Export store types
pub use store::{EnvironmentCache, MemoryStore, Store};
