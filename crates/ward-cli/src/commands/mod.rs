//! Command implementations.

pub mod check;
pub mod plan;
pub mod rules;
pub mod tools;

use ward_tools::ToolRegistry;

/// Registry with every built-in tool.
pub fn load_tool_registry() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    ward_tools::register_all(&mut tools);
    tools
}
