//! 会话事件总线
//!
//! 单生产者（策略任务）、多消费者（订阅者）。事件先写入追加日志，再向各订阅者的
//! 有界队列扇出；订阅在日志快照与队列注册同一把锁内完成，保证订阅时刻之前的事件
//! 全量回放且不重复。慢订阅者队列溢出时被丢弃，不阻塞会话本身。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{AgentEvent, Envelope};

struct SubscriberHandle {
    tx: mpsc::Sender<Arc<Envelope>>,
    lagged: Arc<AtomicBool>,
}

struct BusInner {
    log: Vec<Arc<Envelope>>,
    subscribers: Vec<SubscriberHandle>,
    closed: bool,
}

/// 每会话一个总线；emit 为同步操作（try_send），不会在持锁时挂起
pub struct EventBus {
    session_id: String,
    capacity: usize,
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            session_id: session_id.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(BusInner {
                log: Vec::new(),
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 发出事件：写日志、扇出；终止事件随后关闭所有订阅队列。
    /// 流已关闭后的事件被忽略（终态后不再有变更）。
    pub fn emit(&self, event: AgentEvent) {
        let envelope = Arc::new(Envelope::new(&self.session_id, &event));
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if inner.closed {
            tracing::warn!(
                session_id = %self.session_id,
                event_type = %envelope.event_type,
                "event after terminal, dropped"
            );
            return;
        }
        let terminal = envelope.is_terminal();
        inner.log.push(envelope.clone());

        // 扇出；队列满的订阅者被移除并打 lagged 标记
        inner.subscribers.retain(|sub| match sub.tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.lagged.store(true, Ordering::Release);
                tracing::warn!(session_id = %self.session_id, "slow subscriber dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if terminal {
            inner.closed = true;
            // 丢弃发送端，订阅者消费完队列后流自然结束
            inner.subscribers.clear();
        }
    }

    /// 订阅：先回放到订阅时刻为止的全部事件，再接续实时事件。
    /// 流已关闭时只回放（回放末尾即终止事件）。
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let replay: Vec<Arc<Envelope>> = inner.log.clone();
        let lagged = Arc::new(AtomicBool::new(false));
        let live = if inner.closed {
            None
        } else {
            let (tx, rx) = mpsc::channel(self.capacity);
            inner.subscribers.push(SubscriberHandle {
                tx,
                lagged: lagged.clone(),
            });
            Some(rx)
        };
        Subscription {
            session_id: self.session_id.clone(),
            replay: replay.into_iter(),
            live,
            lagged,
            lagged_emitted: false,
        }
    }

    /// 会话日志快照（同步 start 接口收集全量事件用）
    pub fn log_snapshot(&self) -> Vec<Arc<Envelope>> {
        self.inner.lock().expect("event bus lock poisoned").log.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("event bus lock poisoned").closed
    }
}

/// 单个订阅者持有的读端：回放段 + 实时队列
pub struct Subscription {
    session_id: String,
    replay: std::vec::IntoIter<Arc<Envelope>>,
    live: Option<mpsc::Receiver<Arc<Envelope>>>,
    lagged: Arc<AtomicBool>,
    lagged_emitted: bool,
}

impl Subscription {
    /// 下一个事件；流结束返回 None。被判定为慢订阅者时，
    /// 末尾会收到一条 subscriber_lagged 信号。
    pub async fn next(&mut self) -> Option<Arc<Envelope>> {
        if let Some(e) = self.replay.next() {
            return Some(e);
        }
        if let Some(rx) = &mut self.live {
            if let Some(e) = rx.recv().await {
                return Some(e);
            }
            self.live = None;
        }
        if self.lagged.load(Ordering::Acquire) && !self.lagged_emitted {
            self.lagged_emitted = true;
            return Some(Arc::new(Envelope::lagged(&self.session_id)));
        }
        None
    }

    /// 读尽整个流（测试与同步接口用）
    pub async fn drain(mut self) -> Vec<Arc<Envelope>> {
        let mut out = Vec::new();
        while let Some(e) = self.next().await {
            out.push(e);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase_event() -> AgentEvent {
        AgentEvent::PhaseChange {
            phase: "running".to_string(),
        }
    }

    fn stop_event() -> AgentEvent {
        AgentEvent::AgentStopped {
            reason: "user requested".into(),
        }
    }

    #[tokio::test]
    async fn test_pre_subscriber_buffering_replayed_in_order() {
        let bus = EventBus::new("s", 16);
        bus.emit(AgentEvent::Connected);
        bus.emit(phase_event());
        bus.emit(stop_event());

        let events = bus.subscribe().drain().await;
        let types: Vec<_> = events.iter().map(|e| e.event_type.clone()).collect();
        assert_eq!(types, vec!["connected", "phase_change", "agent_stopped"]);
    }

    #[tokio::test]
    async fn test_multi_subscriber_identical_order() {
        let bus = EventBus::new("s", 16);
        bus.emit(AgentEvent::Connected);
        let sub_a = bus.subscribe();
        let sub_b = bus.subscribe();
        bus.emit(phase_event());
        bus.emit(stop_event());

        let a: Vec<_> = sub_a.drain().await.iter().map(|e| e.event_type.clone()).collect();
        let b: Vec<_> = sub_b.drain().await.iter().map(|e| e.event_type.clone()).collect();
        assert_eq!(a, b);
        assert_eq!(a, vec!["connected", "phase_change", "agent_stopped"]);
    }

    #[tokio::test]
    async fn test_timestamps_monotonic() {
        let bus = EventBus::new("s", 16);
        for _ in 0..5 {
            bus.emit(phase_event());
        }
        bus.emit(stop_event());
        let events = bus.subscribe().drain().await;
        for pair in events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_with_lagged_signal() {
        let bus = EventBus::new("s", 2);
        let mut sub = bus.subscribe();
        // 订阅者不消费，塞满深度为 2 的队列后第三条触发丢弃
        bus.emit(phase_event());
        bus.emit(phase_event());
        bus.emit(phase_event());

        let mut types = Vec::new();
        while let Some(e) = sub.next().await {
            types.push(e.event_type.clone());
        }
        assert_eq!(types, vec!["phase_change", "phase_change", "subscriber_lagged"]);

        // 会话本身未被阻塞，日志完整
        assert_eq!(bus.log_snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_late_subscriber_after_terminal_sees_full_log() {
        let bus = EventBus::new("s", 16);
        bus.emit(AgentEvent::Connected);
        bus.emit(phase_event());
        bus.emit(stop_event());
        assert!(bus.is_closed());

        // 终态之后订阅：完整回放并以终止事件收尾
        let events = bus.subscribe().drain().await;
        assert_eq!(events.len(), 3);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_emit_after_close_ignored() {
        let bus = EventBus::new("s", 16);
        bus.emit(stop_event());
        bus.emit(phase_event());
        assert_eq!(bus.log_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_live_subscriber_gets_events_after_attach() {
        let bus = EventBus::new("s", 16);
        bus.emit(AgentEvent::Connected);
        let mut sub = bus.subscribe();
        bus.emit(stop_event());

        assert_eq!(sub.next().await.unwrap().event_type, "connected");
        assert_eq!(sub.next().await.unwrap().event_type, "agent_stopped");
        assert!(sub.next().await.is_none());
    }
}
