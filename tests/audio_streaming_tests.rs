//! Microphone streaming through the mock microphone and transport.

mod common;

use agent_session_client::{AgentEvent, ClientConfig};
use base64::Engine as _;
use common::{harness, harness_with};
use std::time::Duration;

const CHUNK_BYTES: usize = 640;

fn decode_chunk(frame: &serde_json::Value) -> Vec<u8> {
    let chunk = frame["data"]["chunk"].as_str().unwrap();
    base64::engine::general_purpose::STANDARD
        .decode(chunk)
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_silence_is_chunked_and_sent() {
    let mut h = harness();
    let mut server = h.connect_with_session("abc").await;

    h.client.start_mic().await;
    assert!(h.client.is_capturing());
    assert_eq!(h.mic.start_count(), 1);

    // 1.5 chunks, then the rest of the second chunk
    assert!(h.mic.feed(vec![0u8; 960]).await);
    assert!(h.mic.feed(vec![0u8; 320]).await);

    for _ in 0..2 {
        let frame = server.recv_json().await.unwrap();
        assert_eq!(frame["type"], "audio_in");
        assert_eq!(frame["session_id"], "abc");
        assert_eq!(decode_chunk(&frame), vec![0u8; CHUNK_BYTES]);
    }

    h.client.stop_mic().await;
    assert!(!h.client.is_capturing());
    assert_eq!(h.mic.stop_count(), 1);
    let stats = h.client.audio_stats().await;
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.dropped, 0);
}

#[tokio::test]
async fn test_chunks_keep_capture_order() {
    let mut h = harness();
    let mut server = h.connect_with_session("abc").await;
    h.client.start_mic().await;

    let mut captured = Vec::new();
    for i in 0..5u16 {
        let sample = (i + 1).to_le_bytes();
        let buffer: Vec<u8> = sample.iter().copied().cycle().take(CHUNK_BYTES).collect();
        captured.push(buffer.clone());
        assert!(h.mic.feed(buffer).await);
    }

    for expected in captured {
        let frame = server.recv_json().await.unwrap();
        assert_eq!(decode_chunk(&frame), expected);
    }
    h.client.stop_mic().await;
}

#[tokio::test]
async fn test_invalid_buffers_are_skipped() {
    let mut h = harness();
    let mut server = h.connect_with_session("abc").await;
    h.client.start_mic().await;

    assert!(h.mic.feed(Vec::new()).await);
    assert!(h.mic.feed(vec![1u8; 641]).await);
    assert!(h.mic.feed(vec![0u8; CHUNK_BYTES]).await);

    let frame = server.recv_json().await.unwrap();
    assert_eq!(decode_chunk(&frame), vec![0u8; CHUNK_BYTES]);
    assert!(h.client.is_capturing());
    h.client.stop_mic().await;
}

#[tokio::test]
async fn test_stop_mic_emits_resting_level() {
    let mut h = harness();
    let _server = h.connect_with_session("abc").await;
    h.client.start_mic().await;

    let loud: Vec<u8> = [0x00u8, 0x40].iter().copied().cycle().take(CHUNK_BYTES).collect();
    assert!(h.mic.feed(loud).await);
    let level = h
        .next_event(|e| matches!(e, AgentEvent::AudioLevel { level } if *level > 0.0))
        .await;
    assert!(matches!(level, AgentEvent::AudioLevel { level } if level <= 1.0));

    h.client.stop_mic().await;
    assert_eq!(
        h.next_event(|e| matches!(e, AgentEvent::AudioLevel { .. })).await,
        AgentEvent::AudioLevel { level: 0.0 }
    );
}

#[tokio::test]
async fn test_start_mic_twice_is_noop() {
    let mut h = harness();
    let _server = h.connect_with_session("abc").await;
    h.client.start_mic().await;
    h.client.start_mic().await;
    assert_eq!(h.mic.start_count(), 1);
    h.client.stop_mic().await;
}

#[tokio::test]
async fn test_permission_denied_becomes_error_event() {
    let mut h = harness();
    let _server = h.connect_with_session("abc").await;
    h.mic.set_permission(false);

    h.client.start_mic().await;

    assert_eq!(h.next_error().await, "Microphone permission denied");
    assert!(!h.client.is_capturing());
    assert_eq!(h.mic.start_count(), 0);
}

#[tokio::test]
async fn test_device_failure_unwinds_capture() {
    let mut h = harness();
    let _server = h.connect_with_session("abc").await;
    h.mic.fail_next_start(true);

    h.client.start_mic().await;

    let message = h.next_error().await;
    assert!(message.starts_with("Failed to start microphone"), "{}", message);
    assert!(!h.client.is_capturing());

    // a later start works again
    h.client.start_mic().await;
    assert!(h.client.is_capturing());
    h.client.stop_mic().await;
}

#[tokio::test]
async fn test_start_mic_connects_first() {
    let h = harness();
    let client = h.client.clone();
    let start = tokio::spawn(async move { client.start_mic().await });

    let server = h.transport.accept().await.unwrap();
    server.create_session("abc");
    start.await.unwrap();

    assert!(h.client.is_capturing());
    h.client.stop_mic().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_connection_loss_stops_capture_and_reconnects() {
    let mut h = harness();
    let mut server = h.connect_with_session("abc").await;
    h.client.start_mic().await;

    assert!(h.mic.feed(vec![0u8; CHUNK_BYTES]).await);
    assert_eq!(server.recv_json().await.unwrap()["type"], "audio_in");

    server.fail("connection reset");
    assert_eq!(h.next_connection().await, AgentEvent::disconnected());

    assert!(!h.client.is_capturing());
    assert_eq!(h.mic.stop_count(), 1);
    assert!(!h.mic.feed(vec![0u8; CHUNK_BYTES]).await);

    let server = h.transport.accept().await.unwrap();
    server.create_session("def");
    assert_eq!(h.next_connection().await, AgentEvent::connected("def"));
    // capture has to be restarted explicitly
    assert!(!h.client.is_capturing());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_microphone_stops_capture() {
    let mut h = harness();
    let _server = h.connect_with_session("abc").await;
    h.client.start_mic().await;
    assert!(h.client.is_capturing());

    let message = h.next_error().await;
    assert!(message.starts_with("No audio from microphone"), "{}", message);
    assert_eq!(
        h.next_event(|e| matches!(e, AgentEvent::AudioLevel { .. })).await,
        AgentEvent::AudioLevel { level: 0.0 }
    );
    assert!(!h.client.is_capturing());
    assert_eq!(h.mic.stop_count(), 1);
}

#[tokio::test]
async fn test_raw_chunk_is_sent_directly() {
    let mut h = harness();
    let mut server = h.connect_with_session("abc").await;

    h.client.send_raw_chunk(&[0u8; 320]).await.unwrap();

    let frame = server.recv_json().await.unwrap();
    assert_eq!(frame["type"], "audio_in");
    assert_eq!(decode_chunk(&frame), vec![0u8; 320]);
}

#[tokio::test]
async fn test_chunk_size_follows_config() {
    let config = ClientConfig::with_endpoint("ws://agent.test/ws")
        .unwrap()
        .audio_timing(Duration::from_millis(40), Duration::from_millis(100))
        .unwrap();
    let mut h = harness_with(config);
    let mut server = h.connect_with_session("abc").await;
    h.client.start_mic().await;

    assert!(h.mic.feed(vec![0u8; 1280]).await);
    let frame = server.recv_json().await.unwrap();
    assert_eq!(decode_chunk(&frame).len(), 1280);
    h.client.stop_mic().await;
}
