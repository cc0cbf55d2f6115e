/// Behavioral specification loading and lookup
pub mod document;
pub mod registry;

pub use document::SpecDocument;
pub use registry::{Sla, SpecFormat, SpecRegistry};
