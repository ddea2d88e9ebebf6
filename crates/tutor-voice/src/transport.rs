//! Message transport to the realtime service.
//!
//! A [`Transport`] is a pair of channels: text frames out, [`TransportEvent`]s
//! in. [`WsConnector`] backs it with a WebSocket whose read and write halves run
//! as two pump tasks. [`Transport::pair`] backs it with an in-memory
//! [`RemoteEnd`] that plays the server in tests and demos.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::ClientEvent;

/// Inbound side of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    /// Closed by the remote end, with its reason if one was given.
    Closed(Option<String>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outbound {
    Text(String),
    Close,
}

pub struct Transport {
    outgoing: mpsc::UnboundedSender<Outbound>,
    incoming: mpsc::UnboundedReceiver<TransportEvent>,
    closed: bool,
    /// WebSocket read pump. The write pump ends by itself after `Close`.
    reader: Option<JoinHandle<()>>,
}

impl Transport {
    /// Queue one text frame.
    pub fn send(&self, text: String) -> VoiceResult<()> {
        if self.closed {
            return Err(VoiceError::SessionClosed);
        }
        self.outgoing
            .send(Outbound::Text(text))
            .map_err(|_| VoiceError::Connection("transport is closed".to_string()))
    }

    /// Next inbound event. `None` once the remote side is gone.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.incoming.recv().await
    }

    /// Ask the remote end to close. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.outgoing.send(Outbound::Close);
    }

    /// In-memory transport and the server end that drives it.
    pub fn pair() -> (Transport, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Transport {
                outgoing: out_tx,
                incoming: in_rx,
                closed: false,
                reader: None,
            },
            RemoteEnd {
                to_client: in_tx,
                from_client: out_rx,
                client_closed: false,
            },
        )
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens transports for a session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &RealtimeConfig) -> VoiceResult<Transport>;
}

/// WebSocket connector for the realtime endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, config: &RealtimeConfig) -> VoiceResult<Transport> {
        let endpoint = config.endpoint();
        let mut request = endpoint.as_str().into_client_request()?;
        let headers = request.headers_mut();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| VoiceError::Connection(format!("invalid API key header: {}", e)))?;
            headers.insert("Authorization", value);
        }
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        info!(endpoint = %endpoint, "opening realtime WebSocket");
        let (ws, response) = tokio_tungstenite::connect_async(request).await?;
        debug!(status = %response.status(), "WebSocket upgraded");

        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let result = match frame {
                    Outbound::Text(text) => write.send(Message::Text(text)).await,
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("WebSocket writer finished");
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => TransportEvent::Message(text),
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        let _ = in_tx.send(TransportEvent::Closed(reason));
                        return;
                    }
                    Ok(Message::Binary(bytes)) => {
                        debug!(len = bytes.len(), "ignoring binary frame");
                        continue;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                };
                if in_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(TransportEvent::Closed(None));
        });

        Ok(Transport {
            outgoing: out_tx,
            incoming: in_rx,
            closed: false,
            reader: Some(reader),
        })
    }
}

/// Hands out one prepared transport, or refuses to connect.
pub struct MemoryConnector {
    transport: Mutex<Option<Transport>>,
    refusal: Option<String>,
}

impl MemoryConnector {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            refusal: None,
        }
    }

    /// Every `open` fails with `Connection(reason)`.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            transport: Mutex::new(None),
            refusal: Some(reason.into()),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, _config: &RealtimeConfig) -> VoiceResult<Transport> {
        if let Some(reason) = &self.refusal {
            return Err(VoiceError::Connection(reason.clone()));
        }
        self.transport
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| VoiceError::Connection("transport already used".to_string()))
    }
}

/// The server side of an in-memory transport.
pub struct RemoteEnd {
    to_client: mpsc::UnboundedSender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<Outbound>,
    client_closed: bool,
}

impl RemoteEnd {
    /// Send one server message. False once the client is gone.
    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send_raw(value.to_string())
    }

    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(TransportEvent::Message(text.into()))
            .is_ok()
    }

    /// Close from the server side.
    pub fn close(&self, reason: Option<&str>) {
        let _ = self
            .to_client
            .send(TransportEvent::Closed(reason.map(str::to_string)));
    }

    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.to_client.send(TransportEvent::Error(message.into()));
    }

    /// Next client message. `None` once the client closed or dropped the transport.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        if self.client_closed {
            return None;
        }
        loop {
            match self.from_client.recv().await {
                Some(Outbound::Text(text)) => match serde_json::from_str(&text) {
                    Ok(event) => return Some(event),
                    Err(e) => warn!("unparseable client message: {}", e),
                },
                Some(Outbound::Close) | None => {
                    self.client_closed = true;
                    return None;
                }
            }
        }
    }

    /// Every client message already queued, without waiting.
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while !self.client_closed {
            match self.from_client.try_recv() {
                Ok(Outbound::Text(text)) => {
                    if let Ok(event) = serde_json::from_str(&text) {
                        events.push(event);
                    }
                }
                Ok(Outbound::Close) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.client_closed = true;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }
        events
    }

    /// Whether the client has sent its close frame or dropped the transport.
    /// Only observed through `recv` or `drain`.
    pub fn client_closed(&self) -> bool {
        self.client_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pair_carries_both_directions() {
        let (mut transport, mut remote) = Transport::pair();
        transport
            .send(ClientEvent::InputAudioBufferCommit.to_json().unwrap())
            .unwrap();
        assert_eq!(remote.recv().await, Some(ClientEvent::InputAudioBufferCommit));

        assert!(remote.send_json(json!({"type": "session.created"})));
        match transport.recv().await {
            Some(TransportEvent::Message(text)) => assert!(text.contains("session.created")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_sends() {
        let (mut transport, mut remote) = Transport::pair();
        transport.close();
        transport.close();
        assert!(transport.send("{}".to_string()).is_err());

        assert_eq!(remote.recv().await, None);
        assert!(remote.client_closed());
    }

    #[tokio::test]
    async fn memory_connector_hands_out_once() {
        let (transport, _remote) = Transport::pair();
        let connector = MemoryConnector::new(transport);
        let config = RealtimeConfig::default();
        assert!(connector.open(&config).await.is_ok());
        assert!(matches!(
            connector.open(&config).await,
            Err(VoiceError::Connection(_))
        ));

        let refusing = MemoryConnector::refusing("offline");
        assert!(matches!(
            refusing.open(&config).await,
            Err(VoiceError::Connection(m)) if m == "offline"
        ));
    }
}
