// 与 AI 实时对话端的双向连接
// 通话控制器只依赖 ConversationLink，GeminiLink 是基于 WebSocket 的实现

pub mod gemini;
pub mod protocol;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::tools::ToolDeclaration;

pub use gemini::GeminiLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Ready,
    Closed,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("AI connection failed: {0}")]
    Connection(String),
    #[error("AI link is not connected")]
    NotConnected,
    #[error("Failed to encode AI message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub ws_url: String,
    pub api_key: String,
    pub model: String,
    pub handshake_timeout: Duration,
}

/// setup 消息里声明的全部内容
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub system_instruction: String,
    pub voice: String,
    pub tools: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    /// Raw little-endian PCM bytes with their mime type (e.g. `audio/pcm;rate=24000`)
    Audio { mime_type: String, data: Vec<u8> },
    Text(String),
}

/// 拆解后的一条入站消息
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AiResponse {
    pub turn_complete: bool,
    pub interrupted: bool,
    pub tool_calls: Vec<ToolInvocation>,
    pub parts: Vec<ContentPart>,
}

impl AiResponse {
    pub fn is_empty(&self) -> bool {
        !self.turn_complete && !self.interrupted && self.tool_calls.is_empty() && self.parts.is_empty()
    }
}

#[async_trait]
pub trait ConversationLink: Send + Sync {
    /// 建立连接并完成 setup 握手
    async fn connect(&self, setup: &SessionSetup) -> Result<(), LinkError>;

    fn send_audio(&self, pcm: &[i16]) -> Result<(), LinkError>;

    fn send_text(&self, text: &str) -> Result<(), LinkError>;

    fn send_tool_result(&self, id: &str, name: &str, result: Value) -> Result<(), LinkError>;

    /// 按到达顺序取下一条响应，连接关闭后返回 `None`
    async fn receive(&self) -> Option<AiResponse>;

    fn is_ready(&self) -> bool;

    /// 可重复调用，唤醒所有等待中的 `receive()` 并返回 `None`
    fn close(&self);
}
