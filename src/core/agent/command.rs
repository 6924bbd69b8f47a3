use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AgentBackend, AgentEvent, Invocation, InvocationControl, InvokeRequest};
use crate::core::config::BackendConfig;
use crate::core::error::{HubError, HubResult};
use crate::platform::{NativePlatform, Platform};

const STDERR_TAIL: usize = 2000;

/// Runs the configured agent CLI once per invocation. The prompt goes to
/// stdin; stdout is read as newline-delimited JSON events.
pub struct CommandBackend {
    config: BackendConfig,
}

impl CommandBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, request: &InvokeRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args);
        if let (Some(flag), Some(token)) = (&self.config.resume_flag, &request.continuation_token) {
            cmd.arg(flag).arg(token);
        }
        if let (Some(flag), Some(max_turns)) =
            (&self.config.max_turns_flag, request.options.max_turns)
        {
            cmd.arg(flag).arg(max_turns.to_string());
        }
        cmd.envs(&self.config.env);
        cmd.current_dir(&request.working_dir);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

struct ProcessControl {
    pid: Option<u32>,
    stopped: AtomicBool,
}

impl ProcessControl {
    fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl InvocationControl for ProcessControl {
    fn interrupt(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        self.stopped.store(true, Ordering::SeqCst);
        match NativePlatform::interrupt_process(pid) {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!("Failed to interrupt agent process {}: {}", pid, e);
                false
            }
        }
    }

    fn close(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(e) = NativePlatform::kill_process(pid) {
            warn!("Failed to terminate agent process {}: {}", pid, e);
        }
    }
}

struct OutputState {
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    control: Arc<ProcessControl>,
}

impl OutputState {
    async fn stderr_tail(&mut self) -> String {
        let Some(handle) = self.stderr.take() else {
            return String::new();
        };
        let text = handle.await.unwrap_or_default();
        let text = text.trim();
        let start = text
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map(|(i, _)| i)
            .unwrap_or(0);
        text[start..].to_string()
    }

    /// Next event, or the process outcome once stdout closes.
    async fn next_event(&mut self) -> Option<HubResult<AgentEvent>> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str(line) {
                        Ok(value) => return Some(Ok(AgentEvent::from_json(value))),
                        Err(_) => debug!("Skipping non-JSON agent output: {}", line),
                    }
                }
                Ok(None) => {
                    return match self.child.wait().await {
                        Ok(status) if status.success() || self.control.was_stopped() => None,
                        Ok(status) => {
                            let tail = self.stderr_tail().await;
                            Some(Err(HubError::Upstream(if tail.is_empty() {
                                format!("agent exited with {}", status)
                            } else {
                                format!("agent exited with {}: {}", status, tail)
                            })))
                        }
                        Err(e) => Some(Err(HubError::Upstream(format!(
                            "waiting for agent process: {}",
                            e
                        )))),
                    };
                }
                Err(e) => {
                    return Some(Err(HubError::Upstream(format!(
                        "reading agent output: {}",
                        e
                    ))));
                }
            }
        }
    }
}

#[async_trait]
impl AgentBackend for CommandBackend {
    async fn invoke(&self, request: InvokeRequest) -> HubResult<Invocation> {
        let mut child = self.build_command(&request).spawn().map_err(|e| {
            HubError::Upstream(format!("failed to spawn '{}': {}", self.config.program, e))
        })?;
        let pid = child.id();
        info!(
            "Agent process started (pid {:?}, resume: {})",
            pid,
            request.continuation_token.is_some()
        );

        if let Some(mut stdin) = child.stdin.take() {
            // A process that exits without reading its prompt reports through
            // its exit status below.
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                warn!("Failed to write prompt to agent process: {}", e);
            }
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HubError::Upstream("agent stdout was not captured".into()))?;
        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let control = Arc::new(ProcessControl {
            pid,
            stopped: AtomicBool::new(false),
        });
        let state = OutputState {
            lines: BufReader::new(stdout).lines(),
            child,
            stderr,
            control: control.clone(),
        };

        let events = stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            match state.next_event().await {
                Some(Ok(event)) => Some((Ok(event), Some(state))),
                Some(Err(e)) => Some((Err(e), None)),
                None => None,
            }
        })
        .boxed();

        Ok(Invocation { events, control })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::agent::InvokeOptions;
    use crate::core::store::StreamEventKind;
    use futures_util::StreamExt;

    fn shell_backend(script: &str) -> CommandBackend {
        CommandBackend::new(BackendConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            resume_flag: None,
            max_turns_flag: None,
            env: Default::default(),
        })
    }

    fn request(prompt: &str) -> InvokeRequest {
        InvokeRequest {
            prompt: prompt.to_string(),
            continuation_token: None,
            working_dir: std::env::temp_dir(),
            options: InvokeOptions::default(),
        }
    }

    #[tokio::test]
    async fn streams_json_lines_and_skips_noise() {
        let backend = shell_backend(
            r#"read prompt
echo '{"type":"system","session_id":"sess-1"}'
echo 'not json'
echo "{\"type\":\"assistant\",\"text\":\"$prompt\"}""#,
        );
        let invocation = backend.invoke(request("echo me")).await.unwrap();
        let events: Vec<_> = invocation.events.collect().await;

        assert_eq!(events.len(), 2);
        let first = events[0].as_ref().unwrap();
        assert_eq!(first.kind, StreamEventKind::System);
        assert_eq!(first.session_id.as_deref(), Some("sess-1"));
        let second = events[1].as_ref().unwrap();
        assert_eq!(second.assistant_text().as_deref(), Some("echo me"));
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_upstream_error() {
        let backend = shell_backend("echo boom >&2; exit 3");
        let invocation = backend.invoke(request("x")).await.unwrap();
        let events: Vec<_> = invocation.events.collect().await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            Err(HubError::Upstream(msg)) => assert!(msg.contains("boom")),
            other => panic!("unexpected {:?}", other.as_ref().map(|e| e.kind)),
        }
    }

    #[tokio::test]
    async fn missing_program_fails_to_invoke() {
        let backend = CommandBackend::new(BackendConfig {
            program: "/nonexistent/agent-binary".to_string(),
            ..BackendConfig::default()
        });
        assert!(matches!(
            backend.invoke(request("x")).await,
            Err(HubError::Upstream(_))
        ));
    }
}
