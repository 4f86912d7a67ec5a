use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message};
use url::Url;

use super::protocol::{ClientMessage, ServerMessage};
use super::{AiResponse, ConversationLink, LinkConfig, LinkError, LinkState, SessionSetup};
use crate::audio::resample::samples_to_le_bytes;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// 与读任务共享的状态
struct Shared {
    state: Mutex<LinkState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    closed: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    // 停止接受发送；释放发送端后写任务会先发完队列再关闭 socket
    fn mark_closed(&self) -> LinkState {
        let previous = std::mem::replace(&mut *lock(&self.state), LinkState::Closed);
        lock(&self.outbound).take();
        previous
    }
}

// Gemini Live 双向 websocket 连接
pub struct GeminiLink {
    config: LinkConfig,
    shared: Arc<Shared>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<AiResponse>>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<AiResponse>>>,
}

enum Frame {
    Message(ServerMessage),
    Malformed(serde_json::Error),
    Closed(String),
    Control,
}

fn parse_frame(msg: Message) -> Frame {
    let parsed = match &msg {
        Message::Text(text) => serde_json::from_str::<ServerMessage>(text),
        // 服务端可能用二进制帧发送JSON
        Message::Binary(data) => serde_json::from_slice::<ServerMessage>(data),
        Message::Close(frame) => {
            return Frame::Closed(frame.as_ref().map(|f| f.reason.to_string()).unwrap_or_default());
        }
        _ => return Frame::Control,
    };
    match parsed {
        Ok(m) => Frame::Message(m),
        Err(e) => Frame::Malformed(e),
    }
}

impl GeminiLink {
    pub fn new(config: LinkConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(LinkState::Idle),
                outbound: Mutex::new(None),
                closed,
                reader: Mutex::new(None),
            }),
            inbox: AsyncMutex::new(inbox_rx),
            inbox_tx: Mutex::new(Some(inbox_tx)),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    fn endpoint(&self) -> Result<Url, LinkError> {
        let mut url = Url::parse(&self.config.ws_url)
            .map_err(|e| LinkError::Connection(format!("invalid AI url {}: {}", self.config.ws_url, e)))?;
        if !self.config.api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", &self.config.api_key);
        }
        Ok(url)
    }

    async fn handshake(
        &self,
        setup: &SessionSetup,
    ) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>), LinkError> {
        let url = self.endpoint()?;
        log::info!("Connecting to AI endpoint {}...", url.host_str().unwrap_or("unknown"));

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| LinkError::Connection(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let setup_json = serde_json::to_string(&ClientMessage::setup(&self.config.model, setup))?;
        log::debug!("Sending setup: {}", setup_json);
        write
            .send(Message::Text(setup_json.into()))
            .await
            .map_err(|e| LinkError::Connection(e.to_string()))?;

        match tokio::time::timeout(self.config.handshake_timeout, wait_for_setup_complete(&mut read)).await {
            Ok(Ok(())) => Ok((write, read)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LinkError::Connection(format!(
                "no setup acknowledgement within {} ms",
                self.config.handshake_timeout.as_millis()
            ))),
        }
    }

    fn send(&self, msg: &ClientMessage<'_>) -> Result<(), LinkError> {
        if self.shared.state() != LinkState::Ready {
            return Err(LinkError::NotConnected);
        }
        let text = serde_json::to_string(msg)?;
        let outbound = lock(&self.shared.outbound);
        let tx = outbound.as_ref().ok_or(LinkError::NotConnected)?;
        tx.send(Message::Text(text.into())).map_err(|_| LinkError::NotConnected)
    }
}

async fn wait_for_setup_complete(read: &mut SplitStream<WsStream>) -> Result<(), LinkError> {
    while let Some(msg) = read.next().await {
        let msg = msg.map_err(|e| LinkError::Connection(e.to_string()))?;
        match parse_frame(msg) {
            Frame::Message(m) if m.is_setup_complete() => return Ok(()),
            Frame::Message(_) => log::debug!("Ignoring AI message received before setup completed"),
            Frame::Malformed(e) => log::warn!("Skipping malformed AI message during setup: {}", e),
            Frame::Closed(reason) => {
                return Err(LinkError::Connection(format!("setup rejected: {}", reason)));
            }
            Frame::Control => {}
        }
    }
    Err(LinkError::Connection("connection closed during setup".to_string()))
}

async fn write_loop(mut write: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write.send(msg).await {
            log::warn!("AI link write failed: {}", e);
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    inbox: mpsc::UnboundedSender<AiResponse>,
    shared: Arc<Shared>,
) {
    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("AI link read error: {}", e);
                break;
            }
        };
        match parse_frame(msg) {
            Frame::Message(m) => {
                if m.is_setup_complete() {
                    continue;
                }
                let response = m.into_response();
                if response.is_empty() {
                    continue;
                }
                if inbox.send(response).is_err() {
                    break;
                }
            }
            Frame::Malformed(e) => log::warn!("Skipping malformed AI message: {}", e),
            Frame::Closed(reason) => {
                log::info!("AI endpoint closed the connection: {}", reason);
                break;
            }
            Frame::Control => {}
        }
    }
    // inbox 在此处被释放，receive() 会先取完剩余消息再返回 None
    shared.mark_closed();
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl ConversationLink for GeminiLink {
    async fn connect(&self, setup: &SessionSetup) -> Result<(), LinkError> {
        {
            let mut state = lock(&self.shared.state);
            if *state != LinkState::Idle {
                return Err(LinkError::Connection(format!("cannot start setup in state {:?}", *state)));
            }
            *state = LinkState::Connecting;
        }

        let (write, read) = match self.handshake(setup).await {
            Ok(halves) => halves,
            Err(e) => {
                self.shared.mark_closed();
                return Err(e);
            }
        };

        let inbox_tx = lock(&self.inbox_tx)
            .take()
            .ok_or_else(|| LinkError::Connection("inbox already taken".to_string()))?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let mut state = lock(&self.shared.state);
        if *state != LinkState::Connecting {
            // close() 在握手期间被调用
            return Err(LinkError::Connection("link closed during setup".to_string()));
        }
        *lock(&self.shared.outbound) = Some(out_tx);
        tokio::spawn(write_loop(write, out_rx));
        let reader = tokio::spawn(read_loop(read, inbox_tx, self.shared.clone()));
        *lock(&self.shared.reader) = Some(reader);
        *state = LinkState::Ready;

        log::info!("AI setup complete, link ready");
        Ok(())
    }

    fn send_audio(&self, pcm: &[i16]) -> Result<(), LinkError> {
        self.send(&ClientMessage::audio(&samples_to_le_bytes(pcm)))
    }

    fn send_text(&self, text: &str) -> Result<(), LinkError> {
        self.send(&ClientMessage::user_text(text))
    }

    fn send_tool_result(&self, id: &str, name: &str, result: Value) -> Result<(), LinkError> {
        self.send(&ClientMessage::tool_result(id, name, result))
    }

    async fn receive(&self) -> Option<AiResponse> {
        let closed = self.shared.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        // tokio 的 Mutex 按顺序唤醒，多个等待者依次各取一条
        tokio::select! {
            biased;
            _ = wait_closed(closed) => None,
            response = async { self.inbox.lock().await.recv().await } => response,
        }
    }

    fn is_ready(&self) -> bool {
        self.shared.state() == LinkState::Ready
    }

    fn close(&self) {
        let previous = self.shared.mark_closed();
        self.shared.closed.send_replace(true);
        if let Some(reader) = lock(&self.shared.reader).take() {
            reader.abort();
        }
        if previous != LinkState::Closed {
            log::info!("AI link closed (was {:?})", previous);
        }
    }
}

impl Drop for GeminiLink {
    fn drop(&mut self) {
        self.close();
    }
}
