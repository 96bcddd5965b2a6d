mod response;

use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

use crate::events::AgentEvent;
use crate::protocol::InboundType;

pub use response::{parse_product, parse_response};

const GENERIC_SERVER_ERROR: &str = "An unknown error occurred";

/// What one inbound frame turned into
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Handshake finished; the session manager adopts the id.
    SessionCreated(String),
    Event(AgentEvent),
}

/// Decodes inbound frames and tracks which tool each invocation id belongs to.
#[derive(Debug, Default)]
pub struct MessageRouter {
    tools: HashMap<String, String>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one text frame. Non-JSON frames, frames without a known `type`,
    /// and messages missing their required fields produce nothing.
    pub fn route(&mut self, frame: &str) -> Option<Routed> {
        let message: Value = match serde_json::from_str(frame) {
            Ok(value) => value,
            Err(e) => {
                log::debug!("Dropping non-JSON frame: {}", e);
                return None;
            }
        };

        let kind = message.get("type").and_then(Value::as_str)?;
        let kind = match InboundType::from_str(kind) {
            Ok(kind) => kind,
            Err(_) => {
                log::debug!("Ignoring message type '{}'", kind);
                return None;
            }
        };

        match kind {
            InboundType::SessionCreated => {
                let id = str_field(&message, "session_id")?;
                Some(Routed::SessionCreated(id))
            }
            InboundType::ToolStatus => {
                let tool_id = str_field(&message, "tool_id");
                let tool_name = str_field(&message, "tool_name");
                if let (Some(id), Some(name)) = (&tool_id, &tool_name) {
                    self.tools.insert(id.clone(), name.clone());
                }
                let status = str_field(&message, "status")?;
                Some(Routed::Event(AgentEvent::ToolStatus {
                    tool_name: tool_name?,
                    status,
                }))
            }
            InboundType::ToolResponse => {
                let tool_id = str_field(&message, "tool_id")?;
                let tool_name = self.tool_name(&tool_id)?.to_string();
                Some(Routed::Event(AgentEvent::ToolStatus {
                    tool_name,
                    status: "done".to_string(),
                }))
            }
            InboundType::Response => {
                parse_response(message.get("data")?).map(Routed::Event)
            }
            InboundType::Error => {
                let message = str_field(&message, "error")
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| GENERIC_SERVER_ERROR.to_string());
                Some(Routed::Event(AgentEvent::Error { message }))
            }
            InboundType::InterimTranscript | InboundType::FinalTranscript => {
                let text = str_field(&message, "transcript")?;
                Some(Routed::Event(AgentEvent::Stt {
                    text,
                    is_final: kind == InboundType::FinalTranscript,
                }))
            }
        }
    }

    pub fn tool_name(&self, tool_id: &str) -> Option<&str> {
        self.tools.get(tool_id).map(String::as_str)
    }

    #[cfg(test)]
    fn tracked_tools(&self) -> usize {
        self.tools.len()
    }

    /// Forget all tool correlations (connection teardown).
    pub fn clear(&mut self) {
        self.tools.clear();
    }
}

fn str_field(message: &Value, key: &str) -> Option<String> {
    message.get(key).and_then(Value::as_str).map(str::to_string)
}
