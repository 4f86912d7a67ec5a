// 电话媒体流消息（Twilio Media Streams JSON 格式）

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 电话平台发来的入站事件
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected,
    Start { start: StartMeta },
    Media { media: MediaPayload },
    Stop,
    Mark,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: String,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

impl StartMeta {
    pub fn to_number(&self) -> Option<&str> {
        self.custom_parameters.get("to_number").map(String::as_str)
    }

    pub fn voice(&self) -> Option<&str> {
        self.custom_parameters
            .get("voice")
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MediaPayload {
    #[serde(default = "default_track")]
    pub track: String,
    /// base64 编码的 μ-law 字节
    pub payload: String,
}

impl MediaPayload {
    pub fn is_inbound(&self) -> bool {
        self.track == "inbound"
    }
}

fn default_track() -> String {
    "inbound".to_string()
}

/// 发给电话平台的出站事件
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundEvent {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OutboundMedia {
    pub payload: String,
}
