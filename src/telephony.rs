use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use crate::protocol::{OutboundEvent, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000，正常结束
    Normal,
    /// 1011，通话建立失败
    Error,
}

impl CloseCode {
    fn frame(self) -> CloseFrame {
        match self {
            CloseCode::Normal => CloseFrame {
                code: WsCloseCode::Normal,
                reason: "call ended".into(),
            },
            CloseCode::Error => CloseFrame {
                code: WsCloseCode::Error,
                reason: "call setup failed".into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyCommand {
    Send(OutboundEvent),
    Close(CloseCode),
}

/// 拆分已接受的媒体流 socket：入站事件通道 + 出站命令通道
/// `Close` 之后的命令会被丢弃
pub fn spawn<S>(ws: WebSocketStream<S>) -> (mpsc::Receiver<StreamEvent>, mpsc::Sender<TelephonyCommand>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws.split();
    let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(100);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<TelephonyCommand>(100);

    // 读取任务：解析 JSON 事件并转发
    tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<StreamEvent>(&text) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Skipping malformed telephony message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    log::debug!("Telephony peer closed the stream");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Telephony read error: {}", e);
                    break;
                }
            }
        }
    });

    // 写入任务：发送媒体/清空事件，收到 Close 后退出
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                TelephonyCommand::Send(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            log::warn!("Failed to encode telephony event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        log::warn!("Telephony write failed: {}", e);
                        break;
                    }
                }
                TelephonyCommand::Close(code) => {
                    if let Err(e) = write.send(Message::Close(Some(code.frame()))).await {
                        log::debug!("Telephony close frame not sent: {}", e);
                    }
                    break;
                }
            }
        }
    });

    (event_rx, cmd_tx)
}
