// Gemini Live 实时接口的 JSON 消息结构

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AiResponse, ContentPart, SessionSetup, ToolInvocation};
use crate::tools::ToolDeclaration;

pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=24000";

// ---- outbound ----

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage<'a> {
    Setup(Setup<'a>),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent<'a>),
    ToolResponse(ToolResponse<'a>),
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Setup<'a> {
    pub model: &'a str,
    pub generation_config: GenerationConfig<'a>,
    pub system_instruction: Content<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSet<'a>>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig<'a> {
    pub response_modalities: Vec<&'static str>,
    pub speech_config: SpeechConfig<'a>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig<'a> {
    pub voice_config: VoiceConfig<'a>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig<'a> {
    pub prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoice<'a> {
    pub voice_name: &'a str,
}

#[derive(Serialize, Debug)]
pub struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    pub parts: Vec<TextPart<'a>>,
}

#[derive(Serialize, Debug)]
pub struct TextPart<'a> {
    pub text: &'a str,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet<'a> {
    pub function_declarations: &'a [ToolDeclaration],
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: &'static str,
    pub data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent<'a> {
    pub turns: Vec<Content<'a>>,
    pub turn_complete: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse<'a> {
    pub function_responses: Vec<FunctionResponse<'a>>,
}

#[derive(Serialize, Debug)]
pub struct FunctionResponse<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub response: Value,
}

impl<'a> ClientMessage<'a> {
    pub fn setup(model: &'a str, setup: &'a SessionSetup) -> Self {
        let tools = if setup.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolSet {
                function_declarations: &setup.tools,
            }]
        };
        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: &setup.voice,
                        },
                    },
                },
            },
            system_instruction: Content {
                role: None,
                parts: vec![TextPart {
                    text: &setup.system_instruction,
                }],
            },
            tools,
        })
    }

    pub fn audio(pcm_le: &[u8]) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: INPUT_AUDIO_MIME,
                data: BASE64.encode(pcm_le),
            }],
        })
    }

    pub fn user_text(text: &'a str) -> Self {
        ClientMessage::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user"),
                parts: vec![TextPart { text }],
            }],
            turn_complete: true,
        })
    }

    pub fn tool_result(id: &'a str, name: &'a str, response: Value) -> Self {
        ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse { id, name, response }],
        })
    }
}

// ---- inbound ----

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub server_content: Option<ServerContent>,
    pub tool_call: Option<ToolCall>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    pub model_turn: Option<ModelTurn>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Deserialize, Debug)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into an `AiResponse`. Audio parts with bad base64 are dropped.
    pub fn into_response(self) -> AiResponse {
        let mut response = AiResponse::default();

        if let Some(content) = self.server_content {
            response.turn_complete = content.turn_complete;
            response.interrupted = content.interrupted;
            for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
                if let Some(inline) = part.inline_data {
                    match BASE64.decode(inline.data.as_bytes()) {
                        Ok(data) => response.parts.push(ContentPart::Audio {
                            mime_type: inline.mime_type,
                            data,
                        }),
                        Err(e) => log::warn!("Dropping audio part with invalid base64: {}", e),
                    }
                }
                if let Some(text) = part.text {
                    response.parts.push(ContentPart::Text(text));
                }
            }
        }

        if let Some(call) = self.tool_call {
            response.tool_calls = call
                .function_calls
                .into_iter()
                .map(|f| ToolInvocation {
                    id: f.id,
                    name: f.name,
                    args: f.args,
                })
                .collect();
        }

        response
    }
}
