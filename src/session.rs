use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Starting,
    Active,
    Ending,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    SilenceTimeout,
    MaxDuration,
    Stop,
    TurnLimit,
    EndCallTool,
    GoodbyePhrase,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::SilenceTimeout => "silence_timeout",
            EndReason::MaxDuration => "max_duration",
            EndReason::Stop => "stop",
            EndReason::TurnLimit => "turn_limit",
            EndReason::EndCallTool => "end_call_tool",
            EndReason::GoodbyePhrase => "goodbye_phrase",
            EndReason::Error => "error",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

// 单个通话的会话记录，计数和标志只由本通话自己的任务修改
#[derive(Debug)]
pub struct CallSession {
    pub call_sid: String,
    pub stream_sid: String,
    pub to_number: Option<String>,
    pub voice: String,
    pub started_at: Instant,
    last_activity: Mutex<Instant>,
    transcript: Mutex<Vec<ConversationTurn>>,
    active: AtomicBool,
    ai_turns: AtomicU32,
    state: Mutex<CallState>,
}

impl CallSession {
    pub fn new(call_sid: String, stream_sid: String, to_number: Option<String>, voice: String) -> Self {
        let now = Instant::now();
        Self {
            call_sid,
            stream_sid,
            to_number,
            voice,
            started_at: now,
            last_activity: Mutex::new(now),
            transcript: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            ai_turns: AtomicU32::new(0),
            state: Mutex::new(CallState::Starting),
        }
    }

    pub fn state(&self) -> CallState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: CallState) {
        *lock(&self.state) = state;
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
        self.set_state(CallState::Active);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    // 清除活跃标志，只有第一次调用返回 true
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    pub fn touch(&self) -> Instant {
        let now = Instant::now();
        *lock(&self.last_activity) = now;
        now
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    // 返回递增后的轮次
    pub fn record_ai_turn(&self) -> u32 {
        self.ai_turns.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn ai_turns(&self) -> u32 {
        self.ai_turns.load(Ordering::SeqCst)
    }

    pub fn append_turn(&self, role: Role, text: impl Into<String>) {
        lock(&self.transcript).push(ConversationTurn {
            role,
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn transcript(&self) -> Vec<ConversationTurn> {
        lock(&self.transcript).clone()
    }
}

// 活跃通话表，以 call id 为键
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<CallSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    // 已存在同一 call id 时返回 Err(call id)
    pub fn insert(&self, session: Arc<CallSession>) -> Result<(), String> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&session.call_sid) {
            return Err(session.call_sid.clone());
        }
        sessions.insert(session.call_sid.clone(), session);
        Ok(())
    }

    pub fn remove(&self, call_sid: &str) -> Option<Arc<CallSession>> {
        lock(&self.sessions).remove(call_sid)
    }

    #[cfg(test)]
    pub fn contains(&self, call_sid: &str) -> bool {
        lock(&self.sessions).contains_key(call_sid)
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
