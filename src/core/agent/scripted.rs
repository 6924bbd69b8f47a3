//! In-process backend used by tests in place of a real agent CLI.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{AgentBackend, AgentEvent, Invocation, InvocationControl, InvokeRequest};
use crate::core::error::{HubError, HubResult};

#[derive(Clone)]
pub enum Step {
    Event(Value),
    Fail(String),
    /// Park until the notify is released (or the invocation is closed).
    WaitFor(Arc<Notify>),
    Sleep(Duration),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub continuation_token: Option<String>,
    pub max_turns: Option<u32>,
    pub at: tokio::time::Instant,
}

struct ScriptedControl {
    interrupted: AtomicBool,
    closed: CancellationToken,
}

impl InvocationControl for ScriptedControl {
    fn interrupt(&self) -> bool {
        self.interrupted.store(true, Ordering::SeqCst);
        self.closed.cancel();
        true
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Plays back one queued script per invocation. With no script queued an
/// invocation yields a single assistant reply and a result.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    calls: Mutex<Vec<RecordedCall>>,
    fail_invoke: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    pub fn fail_next_invoke(&self) {
        self.fail_invoke.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.prompt).collect()
    }

    pub fn reply(text: &str) -> Vec<Step> {
        vec![
            Step::Event(json!({
                "type": "assistant",
                "message": { "content": [{ "type": "text", "text": text }] }
            })),
            Step::Event(json!({ "type": "result", "result": text })),
        ]
    }

    /// Announce a session id, then park on `gate`, then reply.
    pub fn gated(session_id: &str, gate: Arc<Notify>, text: &str) -> Vec<Step> {
        let mut steps = vec![
            Step::Event(json!({ "type": "system", "subtype": "init", "session_id": session_id })),
            Step::WaitFor(gate),
        ];
        steps.extend(Self::reply(text));
        steps
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn invoke(&self, request: InvokeRequest) -> HubResult<Invocation> {
        self.calls.lock().unwrap().push(RecordedCall {
            prompt: request.prompt.clone(),
            continuation_token: request.continuation_token.clone(),
            max_turns: request.options.max_turns,
            at: tokio::time::Instant::now(),
        });
        if self.fail_invoke.swap(false, Ordering::SeqCst) {
            return Err(HubError::Upstream("scripted invoke failure".into()));
        }

        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Self::reply("ok"));
        let control = Arc::new(ScriptedControl {
            interrupted: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });
        let closed = control.closed.clone();

        let events = stream::unfold(
            (VecDeque::from(steps), closed),
            |(mut steps, closed)| async move {
                loop {
                    if closed.is_cancelled() {
                        return None;
                    }
                    match steps.pop_front()? {
                        Step::Event(value) => {
                            return Some((Ok(AgentEvent::from_json(value)), (steps, closed)));
                        }
                        Step::Fail(msg) => {
                            steps.clear();
                            return Some((Err(HubError::Upstream(msg)), (steps, closed)));
                        }
                        Step::WaitFor(gate) => {
                            tokio::select! {
                                _ = gate.notified() => {}
                                _ = closed.cancelled() => return None,
                            }
                        }
                        Step::Sleep(duration) => {
                            tokio::select! {
                                _ = tokio::time::sleep(duration) => {}
                                _ = closed.cancelled() => return None,
                            }
                        }
                    }
                }
            },
        )
        .boxed();

        Ok(Invocation { events, control })
    }
}
