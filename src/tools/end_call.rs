use async_trait::async_trait;
use serde_json::{Value, json};

use super::tool::{CallTool, ToolAction, ToolError, ToolReply};

pub const END_CALL: &str = "end_call";

/// 对话自然结束时让模型挂断电话
pub struct EndCallTool;

#[async_trait]
impl CallTool for EndCallTool {
    fn name(&self) -> &str {
        END_CALL
    }

    fn description(&self) -> &str {
        "End the phone call. Use this after saying goodbye, or when the caller asks to hang up."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Short reason for ending the call"
                }
            },
            "required": ["reason"]
        })
    }

    async fn call(&self, args: Value) -> Result<ToolReply, ToolError> {
        let reason = match args.get("reason") {
            None | Some(Value::Null) => "conversation finished",
            Some(Value::String(s)) if s.trim().is_empty() => "conversation finished",
            Some(Value::String(s)) => s.trim(),
            Some(other) => {
                return Err(ToolError::InvalidArguments {
                    tool: END_CALL.to_string(),
                    reason: format!("reason must be a string, got {}", other),
                });
            }
        };

        Ok(ToolReply {
            action: Some(ToolAction::EndCall),
            message: format!("Ending the call: {}", reason),
        })
    }
}
