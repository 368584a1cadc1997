pub mod assignment_engine;
pub mod content_engine;
pub mod delta;
pub mod permission;
pub mod position;
pub mod structure_engine;
pub mod type_engine;

pub use assignment_engine::RemoveOptions;
pub use content_engine::{ContentEngine, NewInstance};
pub use delta::DeltaEngine;
pub use permission::{PermissionEvaluator, PermissionSet, SecurityInfo};
pub use structure_engine::StructureEngine;
