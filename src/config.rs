use std::time::Duration;

use crate::ai_link::LinkConfig;

/// 通话策略：计时器和阈值
#[derive(Debug, Clone)]
pub struct CallPolicy {
    /// 超过这个时间没有上行音频就挂断
    pub silence_timeout: Duration,
    /// 从通话开始计算的最长时长
    pub max_duration: Duration,
    /// AI 完成这么多轮后结束通话
    pub max_ai_turns: u32,
    /// 上行帧 RMS 超过该值视为用户插话
    pub barge_in_rms: f64,
    /// 达到轮次上限或说再见后的挂断延迟
    pub farewell_grace: Duration,
    /// AI 调用 end_call 工具后的挂断延迟
    pub end_tool_grace: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(15),
            max_duration: Duration::from_secs(300),
            max_ai_turns: 5,
            barge_in_rms: 1000.0,
            farewell_grace: Duration::from_secs(2),
            end_tool_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // 服务配置（动态部分，可被环境变量覆盖）
    pub listen_addr: String,

    // AI 连接配置
    pub ai_ws_url: &'static str,
    pub ai_api_key: String,
    pub ai_model: &'static str,
    pub default_voice: &'static str,
    pub handshake_timeout_ms: u64,

    // 对话内容
    pub system_instruction: &'static str,
    pub greeting: &'static str,

    pub policy: CallPolicy,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            listen_addr: env!("LISTEN_ADDR").to_string(),

            ai_ws_url: env!("AI_WS_URL"),
            ai_api_key: env!("AI_API_KEY").to_string(),
            ai_model: env!("AI_MODEL"),
            default_voice: env!("AI_DEFAULT_VOICE"),
            handshake_timeout_ms: env!("AI_HANDSHAKE_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse AI_HANDSHAKE_TIMEOUT_MS")?,

            system_instruction: env!("AI_SYSTEM_INSTRUCTION"),
            greeting: env!("AI_GREETING"),

            policy: CallPolicy {
                silence_timeout: Duration::from_secs(env!("CALL_SILENCE_TIMEOUT_SECS").parse()
                    .map_err(|_| "Failed to parse CALL_SILENCE_TIMEOUT_SECS")?),
                max_duration: Duration::from_secs(env!("CALL_MAX_DURATION_SECS").parse()
                    .map_err(|_| "Failed to parse CALL_MAX_DURATION_SECS")?),
                max_ai_turns: env!("CALL_MAX_AI_TURNS").parse()
                    .map_err(|_| "Failed to parse CALL_MAX_AI_TURNS")?,
                barge_in_rms: env!("CALL_BARGE_IN_RMS").parse()
                    .map_err(|_| "Failed to parse CALL_BARGE_IN_RMS")?,
                farewell_grace: Duration::from_millis(env!("CALL_FAREWELL_GRACE_MS").parse()
                    .map_err(|_| "Failed to parse CALL_FAREWELL_GRACE_MS")?),
                end_tool_grace: Duration::from_millis(env!("CALL_END_TOOL_GRACE_MS").parse()
                    .map_err(|_| "Failed to parse CALL_END_TOOL_GRACE_MS")?),
            },
        })
    }

    /// 用运行时环境变量覆盖编译时的默认值
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                self.ai_api_key = key.trim().to_string();
            }
        }
        if let Ok(addr) = std::env::var("BRIDGE_LISTEN_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr.trim().to_string();
            }
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            ws_url: self.ai_ws_url.to_string(),
            api_key: self.ai_api_key.clone(),
            model: self.ai_model.to_string(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}
