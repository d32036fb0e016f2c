//! Task handlers: the adapter interface between the manager and the code
//! that actually performs each task type, plus the built-in handlers.

pub mod provision;
pub mod registry;
pub mod trait_def;

pub use registry::HandlerRegistry;
pub use trait_def::TaskHandler;
