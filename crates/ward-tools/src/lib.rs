//! ward-tools: the tool collaborator interface, registry, and the bash builtin.

pub mod builtin;
mod error;
pub mod registry;
pub mod traits;

pub use builtin::register_all;
pub use error::ToolError;
pub use registry::ToolRegistry;
pub use traits::{Tool, ToolContext, ToolResult};
