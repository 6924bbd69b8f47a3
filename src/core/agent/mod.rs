mod command;
#[cfg(test)]
pub mod scripted;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::error::HubResult;
use crate::core::store::StreamEventKind;

pub use command::CommandBackend;

/// One item yielded by an agent invocation.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub kind: StreamEventKind,
    /// Session id announced by the agent; becomes the continuation token.
    pub session_id: Option<String>,
    pub payload: Value,
}

impl AgentEvent {
    /// Classify a raw JSON line by its `type` field.
    pub fn from_json(payload: Value) -> Self {
        let kind = match payload.get("type").and_then(Value::as_str) {
            Some("system") => StreamEventKind::System,
            Some("assistant") => StreamEventKind::Assistant,
            Some("user") => StreamEventKind::User,
            Some("result") => StreamEventKind::Result,
            Some("error") => StreamEventKind::Error,
            _ => StreamEventKind::Other,
        };
        let session_id = payload
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Self {
            kind,
            session_id,
            payload,
        }
    }

    /// Concatenated text blocks of an assistant message.
    pub fn assistant_text(&self) -> Option<String> {
        if self.kind != StreamEventKind::Assistant {
            return None;
        }
        if let Some(blocks) = self
            .payload
            .pointer("/message/content")
            .and_then(Value::as_array)
        {
            let text: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if !text.is_empty() {
                return Some(text.join("\n"));
            }
        }
        self.payload
            .get("text")
            .or_else(|| self.payload.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Final text of a result event.
    pub fn result_text(&self) -> Option<String> {
        if self.kind != StreamEventKind::Result {
            return None;
        }
        self.payload
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Whether a result or error event reports failure.
    pub fn is_failure(&self) -> bool {
        match self.kind {
            StreamEventKind::Error => true,
            StreamEventKind::Result => {
                self.payload.get("is_error").and_then(Value::as_bool) == Some(true)
            }
            _ => false,
        }
    }

    /// Cumulative spend reported by the agent, if any.
    pub fn reported_cost(&self) -> Option<f64> {
        self.payload
            .get("total_cost_usd")
            .or_else(|| self.payload.get("cost_usd"))
            .and_then(Value::as_f64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub max_turns: Option<u32>,
    pub max_spend_usd: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    pub continuation_token: Option<String>,
    pub working_dir: PathBuf,
    pub options: InvokeOptions,
}

pub type EventStream = BoxStream<'static, HubResult<AgentEvent>>;

/// Handle used to stop a running invocation.
pub trait InvocationControl: Send + Sync {
    /// Cooperative stop request. Returns false if it could not be delivered.
    fn interrupt(&self) -> bool;
    /// Forcibly end the invocation.
    fn close(&self);
}

pub struct Invocation {
    pub events: EventStream,
    pub control: Arc<dyn InvocationControl>,
}

/// The external agent-execution primitive.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn invoke(&self, request: InvokeRequest) -> HubResult<Invocation>;
}
