use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// 工具要求通话执行的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAction {
    EndCall,
}

/// 工具成功输出：可选动作 + 给模型的消息
#[derive(Debug, Clone, PartialEq)]
pub struct ToolReply {
    pub action: Option<ToolAction>,
    pub message: String,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
}

/// 在 setup 消息中向 AI 声明的工具
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait CallTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;
    async fn call(&self, args: Value) -> Result<ToolReply, ToolError>;

    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}
