use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    LinkShutdown, OutboundQueue, ServerEvent, StreamingTransport, TransportError, TransportLink,
    EVENT_CHANNEL_CAPACITY,
};
use crate::codec::EncodedChunk;
use crate::config::{ApiConfig, SessionConfig};
use crate::protocol::{ClientMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Live API client over a single WebSocket
pub struct LiveWebSocketTransport {
    api: ApiConfig,
}

impl LiveWebSocketTransport {
    pub fn new(api: ApiConfig) -> Self {
        Self { api }
    }

    fn endpoint_url(&self, config: &SessionConfig) -> Result<Url, TransportError> {
        let mut url = Url::parse(&config.endpoint)
            .map_err(|e| TransportError::Handshake(format!("Invalid endpoint URL: {}", e)))?;
        url.query_pairs_mut().append_pair("key", self.api.api_key());
        Ok(url)
    }
}

#[async_trait]
impl StreamingTransport for LiveWebSocketTransport {
    async fn connect(&self, config: &SessionConfig) -> Result<TransportLink, TransportError> {
        let url = self.endpoint_url(config)?;
        log::info!("🌐 Connecting to Live API: {}", config.endpoint);

        let (ws_stream, response) = connect_async(url.as_str())
            .await
            .map_err(handshake_error)?;
        log::info!("✅ WebSocket connected, status: {}", response.status());

        let (mut write, mut read) = ws_stream.split();

        let setup = ClientMessage::setup(config).to_json()?;
        log::debug!("Sending setup for model {}", config.model);
        write.send(Message::Text(setup.into())).await?;
        wait_for_setup_complete(&mut read).await?;
        log::info!("🤝 Session setup complete");

        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = OutboundQueue::bounded(config.outbound_queue_capacity);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let writer = tokio::spawn(run_writer(
            write,
            outbound_rx,
            event_tx.clone(),
            cancel.clone(),
        ));
        let reader = tokio::spawn(run_reader(read, event_tx, cancel.clone()));

        Ok(TransportLink::new(
            outbound,
            event_rx,
            LinkShutdown::new(cancel, vec![writer, reader]),
        ))
    }
}

fn handshake_error(e: WsError) -> TransportError {
    match e {
        WsError::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            TransportError::Handshake(format!("HTTP {} {}", status, body).trim().to_string())
        }
        other => TransportError::Handshake(other.to_string()),
    }
}

async fn wait_for_setup_complete(read: &mut WsReader) -> Result<(), TransportError> {
    while let Some(message) = read.next().await {
        let text = match message? {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => String::from_utf8_lossy(data.as_slice()).into_owned(),
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!("{} {}", f.code, f.reason))
                    .unwrap_or_else(|| "no reason given".to_string());
                return Err(TransportError::Handshake(format!(
                    "Server closed during setup: {}",
                    reason
                )));
            }
            _ => continue,
        };

        let message = ServerMessage::parse(&text)?;
        if message.is_setup_complete() {
            return Ok(());
        }
        log::debug!("Ignoring message received before setup completed");
    }

    Err(TransportError::Handshake(
        "Connection ended before setup completed".to_string(),
    ))
}

/// Sends queued chunks in order. On cancel, flushes what is already queued
/// and closes the socket. A failed send is reported as a terminal event.
async fn run_writer(
    mut write: WsWriter,
    mut outbound: mpsc::Receiver<EncodedChunk>,
    events: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
) {
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = outbound.recv() => {
                let Some(chunk) = chunk else { break };
                if let Err(e) = send_chunk(&mut write, &chunk).await {
                    log::warn!("❌ Failed to send audio chunk after {} sent: {}", sent, e);
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = events.send(ServerEvent::Error(e.into())) => {}
                    }
                    return;
                }
                sent += 1;
            }
        }
    }

    while let Ok(chunk) = outbound.try_recv() {
        if let Err(e) = send_chunk(&mut write, &chunk).await {
            log::debug!("Flush stopped after {} chunks: {}", sent, e);
            return;
        }
        sent += 1;
    }

    log::info!("📤 Closing WebSocket after sending {} audio chunks", sent);
    if let Err(e) = write.send(Message::Close(None)).await {
        log::debug!("Failed to send close frame: {}", e);
    }
    let _ = write.close().await;
}

async fn send_chunk(write: &mut WsWriter, chunk: &EncodedChunk) -> Result<(), WsError> {
    let json = match ClientMessage::audio(chunk).to_json() {
        Ok(json) => json,
        Err(e) => {
            log::error!("Failed to serialize audio chunk: {}", e);
            return Ok(());
        }
    };
    write.send(Message::Text(json.into())).await?;
    log::trace!("📤 Sent {} bytes of audio", chunk.data.len());
    Ok(())
}

/// Turns server frames into events until the stream ends or we are cancelled
async fn run_reader(mut read: WsReader, events: mpsc::Sender<ServerEvent>, cancel: CancellationToken) {
    let terminal = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = read.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(data.as_slice()) {
                Ok(text) => text.to_string(),
                Err(_) => {
                    log::warn!("Ignoring non-UTF-8 binary frame ({} bytes)", data.len());
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                log::info!("🔚 Server closed connection: {:?}", frame);
                break ServerEvent::Closed;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                log::error!("❌ WebSocket error: {}", e);
                break ServerEvent::Error(e.into());
            }
            None => {
                log::info!("🔚 WebSocket stream ended");
                break ServerEvent::Closed;
            }
        };

        let message = match ServerMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Failed to parse server message: {}", e);
                continue;
            }
        };

        for event in message.into_events() {
            let delivered = tokio::select! {
                _ = cancel.cancelled() => return,
                result = events.send(event) => result.is_ok(),
            };
            if !delivered {
                return;
            }
        }
    };

    let _ = events.send(terminal).await;
}
