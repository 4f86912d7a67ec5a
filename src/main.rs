mod ai_link;
mod audio;
mod config;
mod controller;
mod protocol;
mod session;
mod telephony;
mod timers;
mod tools;

use ai_link::GeminiLink;
use config::Config;
use controller::{CallContext, serve_call};
use session::SessionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，默认 info 级别，可用 RUST_LOG 覆盖
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 加载配置
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    config.apply_env_overrides();
    if config.ai_api_key.is_empty() {
        log::warn!("No AI api key configured; set GEMINI_API_KEY or ai.api_key in config.toml");
    }

    let ctx = Arc::new(CallContext {
        tools: Arc::new(tools::init_call_tools()),
        sessions: Arc::new(SessionManager::new()),
        policy: config.policy.clone(),
        system_instruction: config.system_instruction.to_string(),
        greeting: config.greeting.to_string(),
        default_voice: config.default_voice.to_string(),
    });
    let link_config = config.link_config();

    let listener = TcpListener::bind(&config.listen_addr).await?;
    log::info!(
        "{} {} listening for media streams on {}",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        config.listen_addr
    );

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down ({} calls active)", ctx.sessions.len());
                break;
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let link_config = link_config.clone();
                // 每个通话一个任务
                tokio::spawn(async move {
                    let ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            log::warn!("Websocket upgrade from {} failed: {}", peer, e);
                            return;
                        }
                    };
                    log::info!("Media stream connected from {}", peer);
                    let (events, commands) = telephony::spawn(ws);
                    let link = Arc::new(GeminiLink::new(link_config));
                    if serve_call(events, commands, link, ctx).await.is_none() {
                        log::info!("Media stream from {} closed without a call", peer);
                    }
                });
            }
        }
    }

    Ok(())
}
