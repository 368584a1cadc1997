pub mod data;

pub use data::{load_seed_data, SystemIds, DEFAULT_WORKFLOW};
