use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::StreamEventKind;

/// WebSocket close code for "service restart".
pub const CLOSE_SERVICE_RESTART: u16 = 1012;

const OUTBOUND_CAPACITY: usize = 100;

/// Notifications pushed to listeners, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: u64,
    },
    Tuned {
        session_id: Option<String>,
    },
    StreamEvent {
        session_id: String,
        kind: StreamEventKind,
        turn: u32,
        payload: Value,
    },
    SessionBusy {
        session_id: String,
    },
    SessionIdle {
        session_id: String,
    },
    QueryComplete {
        session_id: String,
        status: String,
        summary: Option<String>,
    },
    QueryError {
        session_id: String,
        error: String,
    },
    MessageQueued {
        session_id: String,
        entry_id: i64,
    },
    SessionRenamed {
        session_id: String,
        name: String,
    },
    WatchRegistered {
        subscriber: String,
        target: String,
    },
    Error {
        message: String,
    },
}

/// Frames queued for a listener's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    Close { code: u16, reason: String },
}

struct Listener {
    tx: mpsc::Sender<Outbound>,
    session: Option<String>,
    awaiting_pong: bool,
}

/// Fans out session-scoped and global notifications to connected listeners.
pub struct BroadcastRouter {
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl Default for BroadcastRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Listener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a listener. The receiver yields everything routed to it,
    /// starting with a `connected` greeting.
    pub fn register(&self) -> (u64, mpsc::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let _ = tx.try_send(Outbound::Message(ServerMessage::Connected { connection_id: id }));
        self.listeners().insert(
            id,
            Listener {
                tx,
                session: None,
                awaiting_pong: false,
            },
        );
        debug!("Listener {} connected", id);
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        if self.listeners().remove(&id).is_some() {
            debug!("Listener {} disconnected", id);
        }
    }

    /// Move a listener to another session's fan-out set (or none).
    pub fn tune(&self, id: u64, session_id: Option<String>) -> bool {
        let mut listeners = self.listeners();
        let Some(listener) = listeners.get_mut(&id) else {
            return false;
        };
        listener.session = session_id.clone();
        let _ = listener
            .tx
            .try_send(Outbound::Message(ServerMessage::Tuned { session_id }));
        true
    }

    pub fn ack_pong(&self, id: u64) {
        if let Some(listener) = self.listeners().get_mut(&id) {
            listener.awaiting_pong = false;
        }
    }

    pub fn send_to(&self, id: u64, message: ServerMessage) -> bool {
        let mut listeners = self.listeners();
        deliver(&mut listeners, |lid, _| lid == id, &Outbound::Message(message)) > 0
    }

    /// Reach listeners tuned to `session_id`.
    pub fn broadcast_session(&self, session_id: &str, message: ServerMessage) -> usize {
        let mut listeners = self.listeners();
        deliver(
            &mut listeners,
            |_, l| l.session.as_deref() == Some(session_id),
            &Outbound::Message(message),
        )
    }

    /// Reach every listener.
    pub fn broadcast_global(&self, message: ServerMessage) -> usize {
        let mut listeners = self.listeners();
        deliver(&mut listeners, |_, _| true, &Outbound::Message(message))
    }

    /// One liveness round: drop listeners that never answered the previous
    /// ping, then ping the rest. Returns how many were dropped.
    pub fn heartbeat(&self) -> usize {
        let mut listeners = self.listeners();
        let stale: Vec<u64> = listeners
            .iter()
            .filter(|(_, l)| l.awaiting_pong)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(listener) = listeners.remove(id) {
                let _ = listener.tx.try_send(Outbound::Close {
                    code: 1001,
                    reason: "ping timeout".to_string(),
                });
            }
        }
        for listener in listeners.values_mut() {
            listener.awaiting_pong = true;
        }
        deliver(&mut listeners, |_, _| true, &Outbound::Ping);
        if !stale.is_empty() {
            info!("Dropped {} unresponsive listener(s)", stale.len());
        }
        stale.len()
    }

    /// Close every listener with `code` and forget them.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let mut listeners = self.listeners();
        let count = listeners.len();
        for (_, listener) in listeners.drain() {
            let _ = listener.tx.try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
        count
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }
}

/// Drives the ping loop and closes every listener on shutdown.
pub struct BroadcastService {
    router: Arc<BroadcastRouter>,
    ping_interval: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl BroadcastService {
    pub fn new(router: Arc<BroadcastRouter>, ping_interval: Duration, tracker: TaskTracker) -> Self {
        Self {
            router,
            ping_interval,
            cancel: CancellationToken::new(),
            tracker,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for BroadcastService {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn on_start(&self) -> Result<()> {
        let router = self.router.clone();
        let cancel = self.cancel.clone();
        let period = self.ping_interval;
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        router.heartbeat();
                    }
                }
            }
        });
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let closed = self
            .router
            .close_all(CLOSE_SERVICE_RESTART, "server restarting");
        info!("Closed {} listener connection(s)", closed);
        Ok(())
    }
}

/// Send `frame` to matching listeners, dropping any whose channel is closed
/// or full. Returns the number reached.
fn deliver(
    listeners: &mut HashMap<u64, Listener>,
    matches: impl Fn(u64, &Listener) -> bool,
    frame: &Outbound,
) -> usize {
    let mut reached = 0;
    let mut dead = Vec::new();
    for (id, listener) in listeners.iter() {
        if !matches(*id, listener) {
            continue;
        }
        match listener.tx.try_send(frame.clone()) {
            Ok(()) => reached += 1,
            Err(_) => dead.push(*id),
        }
    }
    for id in dead {
        debug!("Dropping listener {} (channel closed or full)", id);
        listeners.remove(&id);
    }
    reached
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    fn idle(session: &str) -> ServerMessage {
        ServerMessage::SessionIdle {
            session_id: session.to_string(),
        }
    }

    #[test]
    fn session_broadcast_follows_tuning() {
        let router = BroadcastRouter::new();
        let (a, mut rx_a) = router.register();
        let (b, mut rx_b) = router.register();
        drain(&mut rx_a);
        drain(&mut rx_b);

        router.tune(a, Some("s1".into()));
        router.tune(b, Some("s2".into()));
        assert_eq!(router.broadcast_session("s1", idle("s1")), 1);

        let frames = drain(&mut rx_a);
        assert_eq!(frames.last(), Some(&Outbound::Message(idle("s1"))));
        assert!(
            !drain(&mut rx_b)
                .iter()
                .any(|f| *f == Outbound::Message(idle("s1")))
        );

        // Re-tuning moves the listener between fan-out sets.
        router.tune(a, Some("s2".into()));
        drain(&mut rx_a);
        assert_eq!(router.broadcast_session("s1", idle("s1")), 0);
        assert_eq!(router.broadcast_session("s2", idle("s2")), 2);
    }

    #[test]
    fn global_broadcast_reaches_everyone() {
        let router = BroadcastRouter::new();
        let (_, mut rx_a) = router.register();
        let (b, mut rx_b) = router.register();
        router.tune(b, Some("s1".into()));

        assert_eq!(router.broadcast_global(idle("s9")), 2);
        assert!(drain(&mut rx_a).contains(&Outbound::Message(idle("s9"))));
        assert!(drain(&mut rx_b).contains(&Outbound::Message(idle("s9"))));
    }

    #[test]
    fn heartbeat_drops_listeners_that_missed_a_pong() {
        let router = BroadcastRouter::new();
        let (a, mut rx_a) = router.register();
        let (b, _rx_b) = router.register();

        assert_eq!(router.heartbeat(), 0);
        assert!(drain(&mut rx_a).contains(&Outbound::Ping));

        router.ack_pong(a);
        assert_eq!(router.heartbeat(), 1);
        assert_eq!(router.listener_count(), 1);
        assert!(!router.tune(b, None));
        assert!(router.tune(a, None));
    }

    #[test]
    fn closed_receivers_are_pruned() {
        let router = BroadcastRouter::new();
        let (_, rx) = router.register();
        drop(rx);
        assert_eq!(router.broadcast_global(idle("s1")), 0);
        assert_eq!(router.listener_count(), 0);
    }

    #[test]
    fn close_all_sends_service_restart() {
        let router = BroadcastRouter::new();
        let (_, mut rx) = router.register();
        assert_eq!(router.close_all(CLOSE_SERVICE_RESTART, "restarting"), 1);
        let frames = drain(&mut rx);
        assert_eq!(
            frames.last(),
            Some(&Outbound::Close {
                code: CLOSE_SERVICE_RESTART,
                reason: "restarting".into()
            })
        );
        assert_eq!(router.listener_count(), 0);
    }

    #[test]
    fn server_messages_are_tagged_by_type() {
        let json = serde_json::to_value(ServerMessage::MessageQueued {
            session_id: "s1".into(),
            entry_id: 7,
        })
        .unwrap();
        assert_eq!(json["type"], "message_queued");
        assert_eq!(json["entry_id"], 7);
    }
}
