pub mod common;
pub mod content;
pub mod data;
pub mod delta;
pub mod environment;
pub mod history;
pub mod pk;
pub mod security;
pub mod structure;
pub mod value;
pub mod xpath;

pub use common::*;
pub use content::*;
pub use data::*;
pub use delta::*;
pub use environment::*;
pub use history::*;
pub use pk::*;
pub use security::*;
pub use structure::*;
pub use value::*;
