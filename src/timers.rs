use std::time::Duration;

use tokio::sync::{mpsc::UnboundedSender, oneshot, watch};
use tokio::time::Instant;

use crate::session::EndReason;

// 每个通话的计时任务，到期后把 EndReason 发到通话的结束通道
// cancel() 会停止全部任务
pub struct CallTimers {
    activity: watch::Sender<Instant>,
    silence_stop: Option<oneshot::Sender<()>>,
    max_duration_stop: Option<oneshot::Sender<()>>,
    pending_stop: Option<oneshot::Sender<()>>,
    pending: Option<(EndReason, Instant)>,
}

impl CallTimers {
    pub fn new(last_activity: Instant) -> Self {
        let (activity, _) = watch::channel(last_activity);
        Self {
            activity,
            silence_stop: None,
            max_duration_stop: None,
            pending_stop: None,
            pending: None,
        }
    }

    // 静默计时：超过 timeout 没有活动就触发
    pub fn start_silence_timer(&mut self, tx: UnboundedSender<EndReason>, timeout: Duration) {
        if self.silence_stop.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.silence_stop = Some(stop_tx);
        let mut activity = self.activity.subscribe();
        tokio::spawn(async move {
            loop {
                let deadline = *activity.borrow_and_update() + timeout;
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let _ = tx.send(EndReason::SilenceTimeout);
                        break;
                    }
                    changed = activity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });
    }

    pub fn start_max_duration_timer(&mut self, tx: UnboundedSender<EndReason>, started_at: Instant, max: Duration) {
        if self.max_duration_stop.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.max_duration_stop = Some(stop_tx);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(started_at + max) => {
                    let _ = tx.send(EndReason::MaxDuration);
                }
                _ = &mut stop_rx => {}
            }
        });
    }

    // 重置静默计时
    pub fn touch(&self, at: Instant) {
        self.activity.send_replace(at);
    }

    // 延迟结束通话，多个请求时保留最早到期的那个
    // 没有替换已有请求时返回 false
    pub fn schedule_end(&mut self, tx: UnboundedSender<EndReason>, reason: EndReason, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        if let Some((_, pending)) = self.pending {
            if pending <= deadline {
                return false;
            }
        }
        if let Some(stop) = self.pending_stop.take() {
            let _ = stop.send(());
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.pending_stop = Some(stop_tx);
        self.pending = Some((reason, deadline));
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = tx.send(reason);
                }
                _ = &mut stop_rx => {}
            }
        });
        true
    }

    #[cfg(test)]
    pub fn pending_end(&self) -> Option<EndReason> {
        self.pending.map(|(reason, _)| reason)
    }

    pub fn cancel(&mut self) {
        for stop in [
            self.silence_stop.take(),
            self.max_duration_stop.take(),
            self.pending_stop.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = stop.send(());
        }
    }
}
