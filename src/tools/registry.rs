use serde_json::{Value, json};
use std::collections::BTreeMap;

use super::tool::{CallTool, ToolAction, ToolDeclaration, ToolError};

/// 工具调用结果：回传给模型的内容，以及通话需要执行的动作（如果有）
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub action: Option<ToolAction>,
    pub response: Value,
}

impl ToolOutcome {
    pub fn ends_call(&self) -> bool {
        self.action == Some(ToolAction::EndCall)
    }

    fn failed(err: &ToolError) -> Self {
        Self {
            action: None,
            response: json!({ "error": err.to_string() }),
        }
    }
}

pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn CallTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register_tool(&mut self, tool: Box<dyn CallTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools.values().map(|t| t.declaration()).collect()
    }

    /// 按名称分发，失败时返回 `{"error": ..}` 内容而不是 `Err`
    pub async fn invoke(&self, name: &str, args: Value) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            let err = ToolError::UnknownTool(name.to_string());
            log::warn!("{}", err);
            return ToolOutcome::failed(&err);
        };

        match tool.call(args).await {
            Ok(reply) => {
                let mut response = json!({ "message": reply.message });
                if let Some(action) = reply.action {
                    response["action"] = json!(action);
                }
                ToolOutcome {
                    action: reply.action,
                    response,
                }
            }
            Err(err) => {
                log::warn!("Tool {} failed: {}", name, err);
                ToolOutcome::failed(&err)
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
