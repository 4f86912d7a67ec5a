pub mod end_call;
pub mod registry;
pub mod tool;

pub use end_call::EndCallTool;
pub use registry::ToolRegistry;
pub use tool::ToolDeclaration;

// 注册每个通话都带有的内置工具
pub fn init_call_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register_tool(Box::new(EndCallTool));
    log::info!("Registered call tool: {}", end_call::END_CALL);
    registry
}
