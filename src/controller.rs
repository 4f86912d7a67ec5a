use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::ai_link::{AiResponse, ContentPart, ConversationLink, LinkError, SessionSetup};
use crate::audio::resample::samples_from_le_bytes;
use crate::audio::{AI_RATE, TELEPHONY_RATE, mulaw, resample, rms};
use crate::config::CallPolicy;
use crate::protocol::{MediaPayload, OutboundEvent, OutboundMedia, StartMeta, StreamEvent};
use crate::session::{CallSession, CallState, EndReason, Role, SessionManager};
use crate::telephony::{CloseCode, TelephonyCommand};
use crate::timers::CallTimers;
use crate::tools::ToolRegistry;

const FAREWELL_PHRASES: [&str; 4] = ["goodbye", "bye", "take care", "have a great day"];

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// 告别语判断：忽略大小写的子串匹配
pub fn contains_farewell(text: &str) -> bool {
    let lower = text.to_lowercase();
    FAREWELL_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

// 从 `audio/pcm;rate=16000` 这样的 mime 类型中取采样率
fn mime_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .find_map(|param| param.trim().strip_prefix("rate="))
        .and_then(|rate| rate.trim().parse().ok())
        .filter(|rate| *rate > 0)
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("AI link setup failed: {0}")]
    Link(#[from] LinkError),
    #[error("Call {0} is already active")]
    DuplicateCall(String),
}

// 所有通话共享的进程级组件
pub struct CallContext {
    pub tools: Arc<ToolRegistry>,
    pub sessions: Arc<SessionManager>,
    pub policy: CallPolicy,
    pub system_instruction: String,
    pub greeting: String,
    pub default_voice: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSummary {
    pub call_sid: String,
    pub reason: EndReason,
    pub duration: Duration,
    pub ai_turns: u32,
    pub transcript_turns: usize,
}

pub struct CallController {
    session: Arc<CallSession>,
    link: Arc<dyn ConversationLink>,
    telephony: mpsc::Sender<TelephonyCommand>,
    ctx: Arc<CallContext>,
    end_tx: mpsc::UnboundedSender<EndReason>,
    timers: Mutex<CallTimers>,
    end_reason: Mutex<Option<EndReason>>,
}

// 已建立的通话，调用 run() 开始运行
pub struct Call {
    controller: Arc<CallController>,
    end_rx: mpsc::UnboundedReceiver<EndReason>,
}

impl CallController {
    // 先连接 AI，成功后再创建并登记会话、启动计时器、发送开场白
    pub async fn establish(
        start: StartMeta,
        link: Arc<dyn ConversationLink>,
        telephony: mpsc::Sender<TelephonyCommand>,
        ctx: Arc<CallContext>,
    ) -> Result<Call, CallError> {
        let call_sid = if start.call_sid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            start.call_sid.clone()
        };
        let voice = start.voice().unwrap_or(ctx.default_voice.as_str()).to_string();
        log::info!(
            "[call {}] Stream {} started (to: {}, voice: {})",
            call_sid,
            start.stream_sid,
            start.to_number().unwrap_or("unknown"),
            voice
        );

        let setup = SessionSetup {
            system_instruction: ctx.system_instruction.clone(),
            voice: voice.clone(),
            tools: ctx.tools.declarations(),
        };
        if let Err(e) = link.connect(&setup).await {
            log::error!("[call {}] AI handshake failed: {}", call_sid, e);
            link.close();
            return Err(e.into());
        }

        let session = Arc::new(CallSession::new(
            call_sid,
            start.stream_sid.clone(),
            start.to_number().map(str::to_string),
            voice,
        ));
        if let Err(existing) = ctx.sessions.insert(session.clone()) {
            link.close();
            return Err(CallError::DuplicateCall(existing));
        }
        session.activate();

        let (end_tx, end_rx) = mpsc::unbounded_channel();
        let mut timers = CallTimers::new(session.last_activity());
        timers.start_silence_timer(end_tx.clone(), ctx.policy.silence_timeout);
        timers.start_max_duration_timer(end_tx.clone(), session.started_at, ctx.policy.max_duration);

        let controller = Arc::new(Self {
            session,
            link,
            telephony,
            ctx,
            end_tx,
            timers: Mutex::new(timers),
            end_reason: Mutex::new(None),
        });
        controller.send_greeting();
        log::info!("[call {}] Call active", controller.session.call_sid);

        Ok(Call { controller, end_rx })
    }

    #[cfg(test)]
    pub fn session(&self) -> &Arc<CallSession> {
        &self.session
    }

    fn send_greeting(&self) {
        let greeting = self.ctx.greeting.trim();
        if greeting.is_empty() {
            return;
        }
        self.session.append_turn(Role::User, greeting);
        if let Err(e) = self.link.send_text(greeting) {
            log::warn!("[call {}] Failed to send greeting: {}", self.session.call_sid, e);
        }
    }

    async fn send_telephony(&self, event: OutboundEvent) {
        if self.telephony.send(TelephonyCommand::Send(event)).await.is_err() {
            log::debug!("[call {}] Telephony closed, event dropped", self.session.call_sid);
        }
    }

    async fn clear_playback(&self) {
        self.send_telephony(OutboundEvent::Clear {
            stream_sid: self.session.stream_sid.clone(),
        })
        .await;
    }

    fn schedule_end(&self, reason: EndReason, delay: Duration) {
        if lock(&self.timers).schedule_end(self.end_tx.clone(), reason, delay) {
            log::info!(
                "[call {}] Ending in {} ms ({})",
                self.session.call_sid,
                delay.as_millis(),
                reason
            );
        }
    }

    // 处理一帧电话上行音频
    pub async fn handle_media(&self, media: &MediaPayload) {
        if !media.is_inbound() || !self.session.is_active() {
            return;
        }
        let now = self.session.touch();
        lock(&self.timers).touch(now);

        let bytes = match BASE64.decode(media.payload.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("[call {}] Dropping media frame with invalid base64: {}", self.session.call_sid, e);
                return;
            }
        };
        let pcm = mulaw::decode(&bytes);

        if rms(&pcm) > self.ctx.policy.barge_in_rms {
            log::debug!("[call {}] Barge-in, clearing playback", self.session.call_sid);
            self.clear_playback().await;
        }

        if !self.link.is_ready() {
            return;
        }
        let upsampled = resample(&pcm, TELEPHONY_RATE, AI_RATE);
        if let Err(e) = self.link.send_audio(&upsampled) {
            log::debug!("[call {}] Inbound audio dropped: {}", self.session.call_sid, e);
        }
    }

    // 处理一条 AI 响应：轮次、工具调用、打断、音频和文本
    pub async fn handle_response(&self, response: AiResponse) {
        let sid = &self.session.call_sid;

        if response.turn_complete {
            let turns = self.session.record_ai_turn();
            log::info!("[call {}] AI turn {} complete", sid, turns);
            if turns >= self.ctx.policy.max_ai_turns {
                self.schedule_end(EndReason::TurnLimit, self.ctx.policy.farewell_grace);
            }
        }

        for invocation in &response.tool_calls {
            log::info!("[call {}] Tool call {} ({})", sid, invocation.name, invocation.id);
            let outcome = self.ctx.tools.invoke(&invocation.name, invocation.args.clone()).await;
            if let Err(e) = self
                .link
                .send_tool_result(&invocation.id, &invocation.name, outcome.response.clone())
            {
                log::warn!("[call {}] Failed to send tool result: {}", sid, e);
            }
            if outcome.ends_call() {
                self.schedule_end(EndReason::EndCallTool, self.ctx.policy.end_tool_grace);
            }
        }

        if response.interrupted {
            log::debug!("[call {}] AI reported interruption", sid);
            self.clear_playback().await;
        }

        for part in response.parts {
            match part {
                ContentPart::Audio { mime_type, data } => self.forward_audio(&mime_type, &data).await,
                ContentPart::Text(text) => {
                    log::info!("[call {}] AI: {}", sid, text);
                    let farewell = contains_farewell(&text);
                    self.session.append_turn(Role::Model, text);
                    if farewell {
                        self.schedule_end(EndReason::GoodbyePhrase, self.ctx.policy.farewell_grace);
                    }
                }
            }
        }
    }

    async fn forward_audio(&self, mime_type: &str, data: &[u8]) {
        let rate = mime_rate(mime_type).unwrap_or(AI_RATE);
        let pcm = samples_from_le_bytes(data);
        let narrow = resample(&pcm, rate, TELEPHONY_RATE);
        if narrow.is_empty() {
            return;
        }
        let payload = BASE64.encode(mulaw::encode(&narrow));
        self.send_telephony(OutboundEvent::Media {
            stream_sid: self.session.stream_sid.clone(),
            media: OutboundMedia { payload },
        })
        .await;
    }

    // 结束通话：只有第一次调用会执行清理并返回 true，之后的调用什么都不做
    pub fn end_call(&self, reason: EndReason) -> bool {
        let sid = &self.session.call_sid;
        if !self.session.deactivate() {
            log::debug!(
                "[call {}] End request ({}) ignored, call is {:?}",
                sid,
                reason,
                self.session.state()
            );
            return false;
        }
        *lock(&self.end_reason) = Some(reason);
        self.session.set_state(CallState::Ending);
        log::info!("[call {}] Ending call: {}", sid, reason);

        lock(&self.timers).cancel();
        self.link.close();
        self.close_telephony();
        self.ctx.sessions.remove(sid);
        self.session.set_state(CallState::Ended);
        let _ = self.end_tx.send(reason);

        self.log_summary(&self.summary(reason));
        true
    }

    // 不等待写入任务：队列满时转到后台发送，保证清理不会被卡住
    fn close_telephony(&self) {
        match self.telephony.try_send(TelephonyCommand::Close(CloseCode::Normal)) {
            Ok(()) => {}
            Err(TrySendError::Full(cmd)) => {
                log::debug!("[call {}] Telephony queue full, close deferred", self.session.call_sid);
                let telephony = self.telephony.clone();
                tokio::spawn(async move {
                    let _ = telephony.send(cmd).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("[call {}] Telephony already closed", self.session.call_sid);
            }
        }
    }

    fn summary(&self, fallback: EndReason) -> CallSummary {
        CallSummary {
            call_sid: self.session.call_sid.clone(),
            reason: (*lock(&self.end_reason)).unwrap_or(fallback),
            duration: self.session.started_at.elapsed(),
            ai_turns: self.session.ai_turns(),
            transcript_turns: self.session.transcript().len(),
        }
    }

    fn log_summary(&self, summary: &CallSummary) {
        log::info!(
            "[call {}] Call ended: reason={}, to={}, voice={}, duration={:.1}s, ai_turns={}, transcript_turns={}",
            summary.call_sid,
            summary.reason,
            self.session.to_number.as_deref().unwrap_or("unknown"),
            self.session.voice,
            summary.duration.as_secs_f64(),
            summary.ai_turns,
            summary.transcript_turns
        );
        for turn in self.session.transcript() {
            log::debug!(
                "[call {}] {} {:?}: {}",
                summary.call_sid,
                turn.at.format("%H:%M:%S"),
                turn.role,
                turn.text
            );
        }
    }
}

async fn pump_responses(controller: Arc<CallController>) {
    while let Some(response) = controller.link.receive().await {
        if !controller.session.is_active() {
            break;
        }
        controller.handle_response(response).await;
    }
    if controller.session.is_active() {
        log::error!("[call {}] AI link dropped", controller.session.call_sid);
        let _ = controller.end_tx.send(EndReason::Error);
    }
}

impl Call {
    #[cfg(test)]
    pub fn controller(&self) -> &Arc<CallController> {
        &self.controller
    }

    // 主循环：直到有结束原因为止
    pub async fn run(self, mut events: mpsc::Receiver<StreamEvent>) -> CallSummary {
        let Call { controller, mut end_rx } = self;
        let sid = controller.session.call_sid.clone();
        let pump = tokio::spawn(pump_responses(controller.clone()));

        let reason = loop {
            tokio::select! {
                Some(reason) = end_rx.recv() => break reason,
                event = events.recv() => match event {
                    Some(StreamEvent::Media { media }) => controller.handle_media(&media).await,
                    Some(StreamEvent::Stop) => {
                        log::info!("[call {}] Telephony stop received", sid);
                        break EndReason::Stop;
                    }
                    Some(StreamEvent::Start { .. }) => log::warn!("[call {}] Ignoring repeated start event", sid),
                    Some(_) => {}
                    None => {
                        log::info!("[call {}] Telephony stream closed", sid);
                        break EndReason::Stop;
                    }
                },
            }
        };

        controller.end_call(reason);
        if let Err(e) = pump.await {
            log::warn!("[call {}] Response loop failed: {}", sid, e);
        }
        controller.summary(reason)
    }
}

// 等待 start 事件，建立通话并运行到结束
pub async fn serve_call(
    mut events: mpsc::Receiver<StreamEvent>,
    commands: mpsc::Sender<TelephonyCommand>,
    link: Arc<dyn ConversationLink>,
    ctx: Arc<CallContext>,
) -> Option<CallSummary> {
    let start = loop {
        match events.recv().await {
            Some(StreamEvent::Start { start }) => break start,
            Some(StreamEvent::Connected) => log::debug!("Telephony stream connected"),
            Some(_) => log::debug!("Ignoring telephony event before start"),
            None => {
                log::info!("Telephony stream closed before start");
                return None;
            }
        }
    };

    match CallController::establish(start, link, commands.clone(), ctx).await {
        Ok(call) => Some(call.run(events).await),
        Err(e) => {
            log::error!("Failed to establish call: {}", e);
            let _ = commands.send(TelephonyCommand::Close(CloseCode::Error)).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_link::ToolInvocation;
    use crate::tools::init_call_tools;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{Mutex as AsyncMutex, watch};
    use tokio::time::Instant;

    struct ScriptedLink {
        fail_connect: bool,
        ready_after_connect: bool,
        ready: AtomicBool,
        responses: AsyncMutex<mpsc::UnboundedReceiver<AiResponse>>,
        closed: watch::Sender<bool>,
        setup: Mutex<Option<SessionSetup>>,
        audio_frames: Mutex<Vec<usize>>,
        texts: Mutex<Vec<String>>,
        tool_results: Mutex<Vec<(String, String, Value)>>,
    }

    impl ScriptedLink {
        fn new(fail_connect: bool, ready_after_connect: bool) -> (Arc<Self>, mpsc::UnboundedSender<AiResponse>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let (closed, _) = watch::channel(false);
            let link = Arc::new(Self {
                fail_connect,
                ready_after_connect,
                ready: AtomicBool::new(false),
                responses: AsyncMutex::new(rx),
                closed,
                setup: Mutex::new(None),
                audio_frames: Mutex::new(Vec::new()),
                texts: Mutex::new(Vec::new()),
                tool_results: Mutex::new(Vec::new()),
            });
            (link, tx)
        }

        fn is_closed(&self) -> bool {
            *self.closed.borrow()
        }
    }

    #[async_trait]
    impl ConversationLink for ScriptedLink {
        async fn connect(&self, setup: &SessionSetup) -> Result<(), LinkError> {
            *lock(&self.setup) = Some(setup.clone());
            if self.fail_connect {
                return Err(LinkError::Connection("rejected".into()));
            }
            self.ready.store(self.ready_after_connect, Ordering::SeqCst);
            Ok(())
        }

        fn send_audio(&self, pcm: &[i16]) -> Result<(), LinkError> {
            if !self.is_ready() {
                return Err(LinkError::NotConnected);
            }
            lock(&self.audio_frames).push(pcm.len());
            Ok(())
        }

        fn send_text(&self, text: &str) -> Result<(), LinkError> {
            lock(&self.texts).push(text.to_string());
            Ok(())
        }

        fn send_tool_result(&self, id: &str, name: &str, result: Value) -> Result<(), LinkError> {
            lock(&self.tool_results).push((id.to_string(), name.to_string(), result));
            Ok(())
        }

        async fn receive(&self) -> Option<AiResponse> {
            let mut closed = self.closed.subscribe();
            if *closed.borrow_and_update() {
                return None;
            }
            tokio::select! {
                _ = closed.changed() => None,
                response = async { self.responses.lock().await.recv().await } => response,
            }
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.ready.store(false, Ordering::SeqCst);
            self.closed.send_replace(true);
        }
    }

    fn context() -> Arc<CallContext> {
        Arc::new(CallContext {
            tools: Arc::new(init_call_tools()),
            sessions: Arc::new(SessionManager::new()),
            policy: CallPolicy::default(),
            system_instruction: "You are a helpful phone agent.".into(),
            greeting: "Say hello to the caller.".into(),
            default_voice: "Puck".into(),
        })
    }

    fn start_meta(call_sid: &str) -> StartMeta {
        StartMeta {
            stream_sid: "MZ1".into(),
            call_sid: call_sid.into(),
            custom_parameters: HashMap::from([("to_number".to_string(), "+15550100".to_string())]),
        }
    }

    fn media(bytes: &[u8]) -> StreamEvent {
        StreamEvent::Media {
            media: MediaPayload {
                track: "inbound".into(),
                payload: BASE64.encode(bytes),
            },
        }
    }

    fn turn_complete() -> AiResponse {
        AiResponse {
            turn_complete: true,
            ..Default::default()
        }
    }

    fn drain(commands: &mut mpsc::Receiver<TelephonyCommand>) -> Vec<TelephonyCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = commands.try_recv() {
            out.push(cmd);
        }
        out
    }

    struct Running {
        link: Arc<ScriptedLink>,
        ai: mpsc::UnboundedSender<AiResponse>,
        events: mpsc::Sender<StreamEvent>,
        commands: mpsc::Receiver<TelephonyCommand>,
        ctx: Arc<CallContext>,
        handle: tokio::task::JoinHandle<CallSummary>,
    }

    async fn run_call(ready: bool) -> Running {
        let (link, ai) = ScriptedLink::new(false, ready);
        let ctx = context();
        let (cmd_tx, commands) = mpsc::channel(100);
        let (events, event_rx) = mpsc::channel(100);
        let call = CallController::establish(start_meta("CA1"), link.clone(), cmd_tx, ctx.clone())
            .await
            .unwrap();
        let handle = tokio::spawn(call.run(event_rx));
        Running {
            link,
            ai,
            events,
            commands,
            ctx,
            handle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn establish_connects_registers_and_greets() {
        let (link, _ai) = ScriptedLink::new(false, true);
        let ctx = context();
        let (cmd_tx, _commands) = mpsc::channel(100);
        let call = CallController::establish(start_meta("CA1"), link.clone(), cmd_tx, ctx.clone())
            .await
            .unwrap();

        let setup = lock(&link.setup).clone().unwrap();
        assert_eq!(setup.voice, "Puck");
        assert_eq!(setup.tools[0].name, "end_call");
        assert_eq!(*lock(&link.texts), vec!["Say hello to the caller.".to_string()]);

        let session = call.controller().session();
        assert_eq!(session.state(), CallState::Active);
        assert_eq!(session.to_number.as_deref(), Some("+15550100"));
        assert_eq!(session.transcript()[0].role, Role::User);
        assert!(ctx.sessions.contains("CA1"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_handshake_registers_nothing() {
        let (link, _ai) = ScriptedLink::new(true, false);
        let ctx = context();
        let (cmd_tx, _commands) = mpsc::channel(100);
        let result = CallController::establish(start_meta("CA1"), link.clone(), cmd_tx, ctx.clone()).await;
        assert!(matches!(result, Err(CallError::Link(LinkError::Connection(_)))));
        assert!(ctx.sessions.is_empty());
        assert!(link.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn serve_call_closes_with_error_when_setup_fails() {
        let (link, _ai) = ScriptedLink::new(true, false);
        let (cmd_tx, mut commands) = mpsc::channel(100);
        let (events, event_rx) = mpsc::channel(100);
        events.send(StreamEvent::Connected).await.unwrap();
        events
            .send(StreamEvent::Start {
                start: start_meta("CA9"),
            })
            .await
            .unwrap();

        assert!(serve_call(event_rx, cmd_tx, link, context()).await.is_none());
        assert_eq!(drain(&mut commands), vec![TelephonyCommand::Close(CloseCode::Error)]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_call_sid_gets_generated_id() {
        let (link, _ai) = ScriptedLink::new(false, true);
        let ctx = context();
        let (cmd_tx, _commands) = mpsc::channel(100);
        let call = CallController::establish(start_meta(""), link, cmd_tx, ctx.clone()).await.unwrap();
        let sid = &call.controller().session().call_sid;
        assert!(Uuid::parse_str(sid).is_ok());
        assert!(ctx.sessions.contains(sid));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_ends_call_after_fifteen_seconds() {
        let mut running = run_call(true).await;
        tokio::time::sleep(Duration::from_secs(16)).await;

        let summary = running.handle.await.unwrap();
        assert_eq!(summary.reason, EndReason::SilenceTimeout);
        assert!(running.link.is_closed());
        assert_eq!(drain(&mut running.commands), vec![TelephonyCommand::Close(CloseCode::Normal)]);
        assert!(running.ctx.sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_audio_keeps_call_alive_until_max_duration() {
        let running = run_call(true).await;
        let quiet = [0xFFu8; 160];
        for _ in 0..30 {
            running.events.send(media(&quiet)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        let summary = running.handle.await.unwrap();
        assert_eq!(summary.reason, EndReason::MaxDuration);
        assert!(summary.duration >= Duration::from_secs(300));
        assert!(summary.duration < Duration::from_secs(301));
        assert_eq!(lock(&running.link.audio_frames).len(), 30);
        assert!(lock(&running.link.audio_frames).iter().all(|n| *n == 480));
    }

    #[tokio::test(start_paused = true)]
    async fn turn_limit_ends_call_two_seconds_after_fifth_turn() {
        let running = run_call(true).await;
        let t0 = Instant::now();
        for _ in 0..5 {
            running.ai.send(turn_complete()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        running.ai.send(turn_complete()).unwrap();

        let summary = running.handle.await.unwrap();
        assert_eq!(summary.reason, EndReason::TurnLimit);
        assert_eq!(Instant::now() - t0, Duration::from_secs(2));
        assert!(summary.ai_turns >= 5);
        assert!(running.ctx.sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_clears_once_even_when_link_not_ready() {
        let mut running = run_call(false).await;
        running.events.send(media(&[0x80; 160])).await.unwrap();
        running.events.send(media(&[0xFF; 160])).await.unwrap();
        running.events.send(StreamEvent::Stop).await.unwrap();

        let summary = running.handle.await.unwrap();
        assert_eq!(summary.reason, EndReason::Stop);
        assert_eq!(
            drain(&mut running.commands),
            vec![
                TelephonyCommand::Send(OutboundEvent::Clear {
                    stream_sid: "MZ1".into()
                }),
                TelephonyCommand::Close(CloseCode::Normal),
            ]
        );
        assert!(lock(&running.link.audio_frames).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_clears_and_forwards_when_link_ready() {
        let mut running = run_call(true).await;
        running.events.send(media(&[0x80; 160])).await.unwrap();
        running.events.send(StreamEvent::Stop).await.unwrap();

        let summary = running.handle.await.unwrap();
        assert_eq!(summary.reason, EndReason::Stop);
        assert_eq!(
            drain(&mut running.commands),
            vec![
                TelephonyCommand::Send(OutboundEvent::Clear {
                    stream_sid: "MZ1".into()
                }),
                TelephonyCommand::Close(CloseCode::Normal),
            ]
        );
        assert_eq!(*lock(&running.link.audio_frames), vec![480]);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_track_frames_are_ignored() {
        let mut running = run_call(true).await;
        running
            .events
            .send(StreamEvent::Media {
                media: MediaPayload {
                    track: "outbound".into(),
                    payload: BASE64.encode([0x80u8; 160]),
                },
            })
            .await
            .unwrap();
        drop(running.events);

        let summary = running.handle.await.unwrap();
        assert_eq!(summary.reason, EndReason::Stop);
        assert_eq!(drain(&mut running.commands), vec![TelephonyCommand::Close(CloseCode::Normal)]);
        assert!(lock(&running.link.audio_frames).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_end_request_is_a_no_op() {
        let (link, _ai) = ScriptedLink::new(false, true);
        let ctx = context();
        let (cmd_tx, mut commands) = mpsc::channel(100);
        let (_events, event_rx) = mpsc::channel(100);
        let call = CallController::establish(start_meta("CA1"), link, cmd_tx, ctx.clone()).await.unwrap();
        let controller = call.controller().clone();

        assert!(controller.end_call(EndReason::Stop));
        assert!(!controller.end_call(EndReason::SilenceTimeout));
        assert_eq!(controller.session().state(), CallState::Ended);

        let summary = call.run(event_rx).await;
        assert_eq!(summary.reason, EndReason::Stop);
        assert_eq!(drain(&mut commands), vec![TelephonyCommand::Close(CloseCode::Normal)]);
        assert!(ctx.sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn end_call_does_not_wait_on_full_telephony_queue() {
        let (link, _ai) = ScriptedLink::new(false, true);
        let ctx = context();
        let (cmd_tx, mut commands) = mpsc::channel(1);
        let filler = cmd_tx.clone();
        let call = CallController::establish(start_meta("CA1"), link.clone(), cmd_tx, ctx.clone())
            .await
            .unwrap();
        let clear = TelephonyCommand::Send(OutboundEvent::Clear {
            stream_sid: "MZ1".into(),
        });
        filler.try_send(clear.clone()).unwrap();

        assert!(call.controller().end_call(EndReason::Stop));
        assert!(ctx.sessions.is_empty());
        assert!(link.is_closed());

        assert_eq!(commands.recv().await, Some(clear));
        assert_eq!(commands.recv().await, Some(TelephonyCommand::Close(CloseCode::Normal)));
    }

    #[tokio::test(start_paused = true)]
    async fn end_call_tool_hangs_up_after_grace() {
        let running = run_call(true).await;
        let t0 = Instant::now();
        running
            .ai
            .send(AiResponse {
                tool_calls: vec![ToolInvocation {
                    id: "fc-1".into(),
                    name: "end_call".into(),
                    args: json!({"reason": "caller is done"}),
                }],
                ..Default::default()
            })
            .unwrap();

        let summary = running.handle.await.unwrap();
        assert_eq!(summary.reason, EndReason::EndCallTool);
        assert_eq!(Instant::now() - t0, Duration::from_secs(3));

        let results = lock(&running.link.tool_results).clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "fc-1");
        assert_eq!(results[0].2["action"], "end_call");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tool_result_is_relayed_and_call_continues() {
        let running = run_call(true).await;
        running
            .ai
            .send(AiResponse {
                tool_calls: vec![ToolInvocation {
                    id: "fc-2".into(),
                    name: "transfer_call".into(),
                    args: json!({}),
                }],
                ..Default::default()
            })
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            lock(&running.link.tool_results)[0].2,
            json!({"error": "Unknown tool: transfer_call"})
        );
        assert!(running.ctx.sessions.contains("CA1"));

        running.events.send(StreamEvent::Stop).await.unwrap();
        assert_eq!(running.handle.await.unwrap().reason, EndReason::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn goodbye_phrase_ends_call_and_lands_in_transcript() {
        let running = run_call(true).await;
        let t0 = Instant::now();
        running
            .ai
            .send(AiResponse {
                parts: vec![ContentPart::Text("Thanks for calling, Goodbye!".into())],
                ..Default::default()
            })
            .unwrap();

        let summary = running.handle.await.unwrap();
        assert_eq!(summary.reason, EndReason::GoodbyePhrase);
        assert_eq!(Instant::now() - t0, Duration::from_secs(2));
        assert_eq!(summary.transcript_turns, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn farewell_after_end_call_tool_ends_at_earlier_grace() {
        let running = run_call(true).await;
        let t0 = Instant::now();
        running
            .ai
            .send(AiResponse {
                tool_calls: vec![ToolInvocation {
                    id: "fc-3".into(),
                    name: "end_call".into(),
                    args: json!({}),
                }],
                parts: vec![ContentPart::Text("Goodbye!".into())],
                ..Default::default()
            })
            .unwrap();

        let summary = running.handle.await.unwrap();
        assert_eq!(summary.reason, EndReason::GoodbyePhrase);
        assert_eq!(Instant::now() - t0, Duration::from_secs(2));
        assert_eq!(lock(&running.link.tool_results).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ai_audio_is_narrowed_encoded_and_interruption_clears() {
        let mut running = run_call(true).await;
        let pcm: Vec<i16> = vec![300, 300, 300, -300, -300, -300, 7];
        let data = crate::audio::resample::samples_to_le_bytes(&pcm);
        running
            .ai
            .send(AiResponse {
                parts: vec![ContentPart::Audio {
                    mime_type: "audio/pcm;rate=24000".into(),
                    data,
                }],
                ..Default::default()
            })
            .unwrap();
        running
            .ai
            .send(AiResponse {
                interrupted: true,
                ..Default::default()
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        running.events.send(StreamEvent::Stop).await.unwrap();
        running.handle.await.unwrap();

        assert_eq!(
            drain(&mut running.commands),
            vec![
                TelephonyCommand::Send(OutboundEvent::Media {
                    stream_sid: "MZ1".into(),
                    media: OutboundMedia {
                        payload: BASE64.encode(mulaw::encode(&[300, -300])),
                    },
                }),
                TelephonyCommand::Send(OutboundEvent::Clear {
                    stream_sid: "MZ1".into()
                }),
                TelephonyCommand::Close(CloseCode::Normal),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ai_link_drop_ends_call_with_error() {
        let running = run_call(true).await;
        drop(running.ai);
        let summary = running.handle.await.unwrap();
        assert_eq!(summary.reason, EndReason::Error);
        assert!(running.ctx.sessions.is_empty());
    }

    #[test]
    fn farewell_matching_is_case_insensitive_substring() {
        assert!(contains_farewell("Okay, BYE now"));
        assert!(contains_farewell("Take care of yourself"));
        assert!(contains_farewell("Have a great day!"));
        assert!(!contains_farewell("Let me check that for you."));
    }

    #[test]
    fn mime_rate_parsing() {
        assert_eq!(mime_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(mime_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(mime_rate("audio/pcm"), None);
        assert_eq!(mime_rate("audio/pcm;rate=0"), None);
    }
}
