//! JSON wire messages exchanged with the agent server

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use strum::{Display, EnumString};

use crate::error::Result;

/// Client → server messages
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage<'a> {
    Question {
        session_id: &'a str,
        question: &'a str,
    },
    AudioIn {
        session_id: &'a str,
        data: AudioPayload,
    },
}

#[derive(Debug, Serialize)]
pub struct AudioPayload {
    /// Base64 PCM16 little-endian bytes
    pub chunk: String,
}

impl OutboundMessage<'_> {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn question_frame(session_id: &str, question: &str) -> Result<String> {
    OutboundMessage::Question {
        session_id,
        question,
    }
    .encode()
}

pub fn audio_frame(session_id: &str, pcm: &[u8]) -> Result<String> {
    OutboundMessage::AudioIn {
        session_id,
        data: AudioPayload {
            chunk: STANDARD.encode(pcm),
        },
    }
    .encode()
}

/// Server → client message types the client understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum InboundType {
    SessionCreated,
    ToolStatus,
    ToolResponse,
    Response,
    Error,
    InterimTranscript,
    FinalTranscript,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::str::FromStr;

    #[test]
    fn test_question_frame() {
        let frame = question_frame("s-1", "do you sell tents?").unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "question", "session_id": "s-1", "question": "do you sell tents?"})
        );
    }

    #[test]
    fn test_audio_frame_base64() {
        let frame = audio_frame("s-1", &[0, 1, 2, 3]).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "audio_in");
        assert_eq!(value["session_id"], "s-1");
        assert_eq!(value["data"]["chunk"], "AAECAw==");
    }

    #[test]
    fn test_inbound_type_names() {
        assert_eq!(
            InboundType::from_str("session_created").unwrap(),
            InboundType::SessionCreated
        );
        assert_eq!(
            InboundType::from_str("interim_transcript").unwrap(),
            InboundType::InterimTranscript
        );
        assert!(InboundType::from_str("heartbeat").is_err());
        assert_eq!(InboundType::ToolResponse.to_string(), "tool_response");
    }
}
