use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    server: Server,
    ai: Ai,
    call: Call,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Server {
    listen_addr: String,
}

#[derive(Deserialize)]
struct Ai {
    ws_url: String,
    api_key: String,
    model: String,
    default_voice: String,
    handshake_timeout_ms: u64,
    system_instruction: String,
    greeting: String,
}

#[derive(Deserialize)]
struct Call {
    silence_timeout_secs: u64,
    max_duration_secs: u64,
    max_ai_turns: u32,
    barge_in_rms: f64,
    farewell_grace_ms: u64,
    end_tool_grace_ms: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // rustc-env 的值不能包含换行
    for (key, value) in [
        ("AI_SYSTEM_INSTRUCTION", &config.ai.system_instruction),
        ("AI_GREETING", &config.ai.greeting),
    ] {
        if value.contains('\n') {
            panic!("{} in config.toml must be a single line", key);
        }
    }

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 服务端口
    println!("cargo:rustc-env=LISTEN_ADDR={}", config.server.listen_addr);

    // AI 连接配置
    println!("cargo:rustc-env=AI_WS_URL={}", config.ai.ws_url);
    println!("cargo:rustc-env=AI_API_KEY={}", config.ai.api_key);
    println!("cargo:rustc-env=AI_MODEL={}", config.ai.model);
    println!("cargo:rustc-env=AI_DEFAULT_VOICE={}", config.ai.default_voice);
    println!("cargo:rustc-env=AI_HANDSHAKE_TIMEOUT_MS={}", config.ai.handshake_timeout_ms);
    println!("cargo:rustc-env=AI_SYSTEM_INSTRUCTION={}", config.ai.system_instruction);
    println!("cargo:rustc-env=AI_GREETING={}", config.ai.greeting);

    // 通话策略
    println!("cargo:rustc-env=CALL_SILENCE_TIMEOUT_SECS={}", config.call.silence_timeout_secs);
    println!("cargo:rustc-env=CALL_MAX_DURATION_SECS={}", config.call.max_duration_secs);
    println!("cargo:rustc-env=CALL_MAX_AI_TURNS={}", config.call.max_ai_turns);
    println!("cargo:rustc-env=CALL_BARGE_IN_RMS={}", config.call.barge_in_rms);
    println!("cargo:rustc-env=CALL_FAREWELL_GRACE_MS={}", config.call.farewell_grace_ms);
    println!("cargo:rustc-env=CALL_END_TOOL_GRACE_MS={}", config.call.end_tool_grace_ms);
}
