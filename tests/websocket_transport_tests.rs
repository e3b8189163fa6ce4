//! Live API transport against a local WebSocket server

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use live_voice::codec::{AudioFormat, EncodedChunk};
use live_voice::config::{ApiConfig, SessionConfig};
use live_voice::transport::{
    LiveWebSocketTransport, ServerEvent, Speaker, StreamingTransport, TransportError,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerSocket = WebSocketStream<TcpStream>;

/// Accept one WebSocket client and hand it to `handler`
async fn serve_once<F, Fut>(handler: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        handler(ws).await;
    });
    (format!("ws://{}", addr), handle)
}

/// Next JSON message from the client, or None once it closes
async fn next_json(ws: &mut ServerSocket) -> Option<Value> {
    while let Some(message) = ws.next().await {
        match message.ok()? {
            Message::Text(text) => return Some(serde_json::from_str(&text.to_string()).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

/// Read the setup message and acknowledge it
async fn complete_setup(ws: &mut ServerSocket) -> Value {
    let setup = next_json(ws).await.expect("client sent no setup");
    ws.send(Message::Text(json!({"setupComplete": {}}).to_string().into()))
        .await
        .unwrap();
    setup
}

fn transport() -> LiveWebSocketTransport {
    LiveWebSocketTransport::new(ApiConfig::from_key("test-key".to_string()).unwrap())
}

fn config_for(endpoint: &str) -> SessionConfig {
    SessionConfig {
        endpoint: endpoint.to_string(),
        ..SessionConfig::default()
    }
}

fn chunk(value: i16) -> EncodedChunk {
    EncodedChunk {
        data: value.to_le_bytes().to_vec(),
        format: AudioFormat::pcm16(16000, 1),
    }
}

#[test_log::test(tokio::test)]
async fn test_setup_then_audio_in_order() {
    let (received_tx, received_rx) = oneshot::channel();
    let query = Arc::new(Mutex::new(None));
    let seen_query = Arc::clone(&query);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let record_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *seen_query.lock().unwrap() = req.uri().query().map(str::to_string);
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, record_query)
            .await
            .unwrap();

        let setup = complete_setup(&mut ws).await;
        let mut chunks = Vec::new();
        while let Some(message) = next_json(&mut ws).await {
            chunks.push(message);
        }
        let _ = received_tx.send((setup, chunks));
    });

    let link = transport().connect(&config_for(&endpoint)).await.unwrap();
    for value in [100i16, -200, 300] {
        link.outbound().send(chunk(value)).unwrap();
    }
    link.close().await;

    let (setup, chunks) = tokio::time::timeout(Duration::from_secs(2), received_rx)
        .await
        .unwrap()
        .unwrap();
    server.await.unwrap();

    assert_eq!(query.lock().unwrap().as_deref(), Some("key=test-key"));
    assert_eq!(
        setup["setup"]["model"],
        "models/gemini-2.5-flash-native-audio-preview-09-2025"
    );
    assert_eq!(
        setup["setup"]["generationConfig"]["responseModalities"],
        json!(["AUDIO"])
    );

    let values: Vec<i16> = chunks
        .iter()
        .map(|message| {
            let media = &message["realtimeInput"]["mediaChunks"][0];
            assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
            let bytes = BASE64.decode(media["data"].as_str().unwrap()).unwrap();
            i16::from_le_bytes([bytes[0], bytes[1]])
        })
        .collect();
    assert_eq!(values, vec![100, -200, 300]);
}

#[tokio::test]
async fn test_server_messages_become_events() {
    let (endpoint, server) = serve_once(|mut ws| async move {
        complete_setup(&mut ws).await;

        let content = json!({
            "serverContent": {
                "inputTranscription": {"text": "hello"},
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": BASE64.encode([0u8, 0, 0, 64])}}
                ]},
                "interrupted": true
            }
        });
        ws.send(Message::Text(content.to_string().into())).await.unwrap();

        // Binary frames carry JSON too
        let transcript = json!({"serverContent": {"outputTranscription": {"text": "hi!"}}});
        ws.send(Message::Binary(transcript.to_string().into_bytes().into()))
            .await
            .unwrap();

        ws.send(Message::Text(r#"{"goAway":{"timeLeft":"5s"}}"#.to_string().into()))
            .await
            .unwrap();
        ws.close(None).await.unwrap();
    })
    .await;

    let link = transport().connect(&config_for(&endpoint)).await.unwrap();
    let (_outbound, mut events, shutdown) = link.into_parts();

    let mut received = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .unwrap()
    {
        received.push(event);
    }
    shutdown.close().await;
    server.await.unwrap();

    assert_eq!(
        received,
        vec![
            ServerEvent::TranscriptDelta {
                speaker: Speaker::User,
                text: "hello".into()
            },
            ServerEvent::AudioDelta {
                payload: vec![0, 0, 0, 64],
                sample_rate: 24000,
                channels: 1
            },
            ServerEvent::Interrupted,
            ServerEvent::TranscriptDelta {
                speaker: Speaker::Model,
                text: "hi!".into()
            },
            ServerEvent::Closed,
        ]
    );
}

#[tokio::test]
async fn test_rejected_handshake_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = vec![0u8; 4096];
        let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut request).await;
        stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
    });

    let result = transport().connect(&config_for(&endpoint)).await;
    server.await.unwrap();

    match result {
        Err(TransportError::Handshake(message)) => assert!(message.contains("403"), "{}", message),
        Err(other) => panic!("expected handshake error, got {}", other),
        Ok(_) => panic!("expected handshake error, got a link"),
    }
}

#[tokio::test]
async fn test_close_during_setup_is_a_handshake_error() {
    let (endpoint, server) = serve_once(|mut ws| async move {
        let _ = next_json(&mut ws).await;
        ws.close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "API key not valid".into(),
        }))
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    })
    .await;

    let result = transport().connect(&config_for(&endpoint)).await;
    server.await.unwrap();

    match result {
        Err(TransportError::Handshake(message)) => {
            assert!(message.contains("API key not valid"), "{}", message)
        }
        Err(other) => panic!("expected handshake error, got {}", other),
        Ok(_) => panic!("expected handshake error, got a link"),
    }
}

#[tokio::test]
async fn test_full_queue_drops_instead_of_blocking() {
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let (endpoint, server) = serve_once(|mut ws| async move {
        complete_setup(&mut ws).await;
        // Stop reading so the client's writer stalls once buffers fill up
        let _ = release_rx.await;
        while next_json(&mut ws).await.is_some() {}
    })
    .await;

    let config = SessionConfig {
        outbound_queue_capacity: 2,
        ..config_for(&endpoint)
    };
    let link = transport().connect(&config).await.unwrap();

    let big = EncodedChunk {
        data: vec![0u8; 64 * 1024],
        format: AudioFormat::pcm16(16000, 1),
    };
    let mut rejected = 0;
    for _ in 0..200 {
        if let Err(e) = link.outbound().send(big.clone()) {
            assert_eq!(e, TransportError::Backpressure);
            rejected += 1;
        }
    }

    assert!(rejected > 0);
    assert_eq!(link.outbound().dropped(), rejected);

    let _ = release_tx.send(());
    link.close().await;
    server.await.unwrap();
}
