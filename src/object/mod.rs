//! Object identity and the registry that tracks object lifetimes.

pub mod id;
pub mod registry;

pub use id::LogicalObjectId;
pub use registry::{ObjectBuffer, ObjectInfo, ObjectRegistry, PendingRefs};
