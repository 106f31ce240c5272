//! Change handlers and the registry the dispatcher fans out to.

pub mod mark_failed_to_enqueue;
pub mod registry;

pub use mark_failed_to_enqueue::{MarkFailedToEnqueueConfig, MarkFailedToEnqueueHandler, is_stale};
pub use registry::{HandlerRegistry, RegistryError};
