#![allow(dead_code)]

use serde_json::{Value, json};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Stand-in agent CLI: reads the prompt from stdin, records its argv, and
/// prints stream-json. Prompts mentioning "slow" park for 30 seconds.
const FAKE_AGENT: &str = r#"#!/bin/sh
prompt=$(cat)
echo "$*" >> calls.log
echo '{"type":"system","session_id":"agent-1"}'
case "$prompt" in
  *slow*) sleep 30 ;;
esac
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}'
echo '{"type":"result","result":"done","total_cost_usd":0.01}'
"#;

/// Write `config.toml` and the fake agent into `data_dir`.
pub fn prepare_data_dir(data_dir: &Path, port: u16) -> TestResult<()> {
    let agent = data_dir.join("fake-agent.sh");
    std::fs::write(&agent, FAKE_AGENT)?;
    let workspace = data_dir.join("workspace");
    std::fs::create_dir_all(&workspace)?;

    let config = format!(
        r#"host = "127.0.0.1"
port = {port}

[backend]
program = "sh"
args = ["{agent}"]
resume_flag = "--resume"

[scheduler]
poll_interval_secs = 1
resurrection_stagger_secs = 0
shutdown_timeout_secs = 3
"#,
        port = port,
        agent = agent.display()
    );
    std::fs::write(data_dir.join("config.toml"), config)?;
    Ok(())
}

pub struct DaemonHarness {
    child: Child,
    pub api_port: u16,
    pub api_base: String,
    data_dir: PathBuf,
    trace_log: Arc<Mutex<Vec<String>>>,
}

impl DaemonHarness {
    pub async fn spawn(data_dir: &Path, api_port: u16) -> TestResult<Self> {
        let daemon_log = data_dir.join(format!("daemon-{}.log", api_port));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&daemon_log)?;
        let log_file_err = log_file.try_clone()?;

        let child = Command::new(env!("CARGO_BIN_EXE_agentbox"))
            .arg("daemon-run")
            .arg("--config")
            .arg(data_dir.join("config.toml"))
            .env("AGENTBOX_DATA_DIR", data_dir)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .spawn()?;

        let mut harness = Self {
            child,
            api_port,
            api_base: format!("http://127.0.0.1:{}", api_port),
            data_dir: data_dir.to_path_buf(),
            trace_log: Arc::new(Mutex::new(Vec::new())),
        };

        harness.wait_until_ready().await?;
        Ok(harness)
    }

    async fn wait_until_ready(&mut self) -> TestResult<()> {
        for _ in 0..80 {
            if let Some(status) = self.child.try_wait()? {
                return Err(format!("agentbox daemon exited early with status: {}", status).into());
            }

            let res = reqwest::Client::new()
                .get(format!("{}/api/health", self.api_base))
                .timeout(Duration::from_millis(700))
                .send()
                .await;

            if let Ok(resp) = res
                && resp.status().is_success()
            {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err("Timed out waiting for agentbox API readiness".into())
    }

    /// SIGTERM the daemon and wait for it to exit on its own.
    pub async fn terminate(mut self) -> TestResult<()> {
        Command::new("kill")
            .arg("-15")
            .arg(self.child.id().to_string())
            .status()?;
        for _ in 0..60 {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err("agentbox daemon did not exit after SIGTERM".into())
    }

    /// Argument lines the fake agent recorded, one per invocation.
    pub fn agent_calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.data_dir.join("workspace").join("calls.log"))
            .map(|raw| raw.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub async fn create_session(&self, name: &str) -> TestResult<String> {
        let out = self
            .request_json(
                reqwest::Method::POST,
                "/api/sessions",
                Some(json!({ "name": name })),
            )
            .await?;
        ensure_success(&out, "create_session")?;
        out["session"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "session id missing".into())
    }

    pub async fn send_message(&self, session_id: &str, content: &str) -> TestResult<Value> {
        let out = self
            .request_json(
                reqwest::Method::POST,
                &format!("/api/sessions/{}/messages", session_id),
                Some(json!({ "content": content })),
            )
            .await?;
        ensure_success(&out, "send_message")?;
        Ok(out)
    }

    pub async fn event_kinds(&self, session_id: &str) -> TestResult<Vec<String>> {
        let out = self
            .request_json(
                reqwest::Method::GET,
                &format!("/api/sessions/{}/events", session_id),
                None,
            )
            .await?;
        Ok(out["events"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|e| e["kind"].as_str().map(str::to_string))
            .collect())
    }

    /// Poll until the session has `count` result events.
    pub async fn wait_for_results(&self, session_id: &str, count: usize) -> TestResult<()> {
        for _ in 0..80 {
            let kinds = self.event_kinds(session_id).await?;
            if kinds.iter().filter(|k| *k == "result").count() >= count {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err(format!("session {} never reached {} result(s)", session_id, count).into())
    }

    pub fn persist_trace_file(&self, name: &str) -> TestResult<PathBuf> {
        let path = self.data_dir.join(format!("{}.trace.log", name));
        let lines = self.trace_log.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::write(&path, lines.join("\n\n---\n\n"))?;
        Ok(path)
    }

    pub async fn request_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> TestResult<Value> {
        let url = format!("{}{}", self.api_base, path);
        let client = reqwest::Client::new();
        let mut req = client
            .request(method.clone(), &url)
            .timeout(Duration::from_secs(30));
        if let Some(payload) = body.clone() {
            req = req.json(&payload);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        let parsed = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| {
            json!({
                "success": false,
                "raw": text,
                "error": format!("non-json response status={}", status)
            })
        });

        let mut traces = self.trace_log.lock().unwrap_or_else(|e| e.into_inner());
        traces.push(format!(
            "REQUEST {} {}\nBODY {}\nSTATUS {}\nRESPONSE {}",
            method,
            path,
            body.unwrap_or(Value::Null),
            status,
            parsed
        ));
        drop(traces);

        Ok(parsed)
    }
}

impl Drop for DaemonHarness {
    fn drop(&mut self) {
        let _ = self.persist_trace_file("daemon");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn find_free_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn ensure_success(value: &Value, action: &str) -> TestResult<()> {
    if value.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }
    Err(format!("{} failed: {}", action, value).into())
}
