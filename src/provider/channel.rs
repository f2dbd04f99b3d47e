use super::{ConnectionConfig, LiveProvider, ServerEvent};
use crate::error::LiveError;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tungstenite::Message,
>;

/// Outbound audio queue depth: a few seconds of 20–40ms capture chunks.
pub const OUTBOUND_QUEUE: usize = 64;
const CONTROL_QUEUE: usize = 32;

/// Delivered to the session's dispatcher queue.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Ordered events parsed from one inbound message.
    Batch(Vec<ServerEvent>),
    /// Socket-level failure; the session is terminal.
    Error(String),
    /// The stream ended; the session is terminal.
    Closed { code: u16, reason: String },
}

#[derive(Debug)]
pub(crate) enum Control {
    ToolResponse {
        id: String,
        name: String,
        result: Value,
    },
    Close,
}

/// Handle to an open channel. Sends never block the caller: they enqueue for
/// the dedicated send task.
#[derive(Clone)]
pub struct ChannelHandle {
    ctrl_tx: mpsc::Sender<Control>,
}

impl ChannelHandle {
    pub fn send_tool_response(&self, id: String, name: String, result: Value) {
        let sent = self
            .ctrl_tx
            .try_send(Control::ToolResponse { id, name, result });
        if let Err(e) = sent {
            log::error!("[channel] failed to queue tool response: {}", e);
        }
    }

    /// Request an orderly close. Idempotent; safe after the socket is gone.
    pub fn close(&self) {
        let _ = self.ctrl_tx.try_send(Control::Close);
    }

    #[cfg(test)]
    pub(crate) fn test_handle() -> (ChannelHandle, mpsc::Receiver<Control>) {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE);
        (ChannelHandle { ctrl_tx }, ctrl_rx)
    }
}

pub struct RemoteChannel;

impl RemoteChannel {
    /// Open the channel. Exactly one attempt per session: failure here, or
    /// any later error/close on the socket, is terminal; no reconnection.
    ///
    /// `audio_rx` carries PCM16 chunks from the capture thread; each chunk is
    /// consumed and freed once written to the socket.
    pub async fn open(
        provider: Arc<dyn LiveProvider>,
        config: ConnectionConfig,
        mut audio_rx: mpsc::Receiver<Vec<u8>>,
        event_tx: mpsc::Sender<ChannelEvent>,
    ) -> Result<ChannelHandle, LiveError> {
        let request = build_ws_request(&config)?;
        log::info!("[channel] connecting: {}", redact_url(&config.url));

        let ws_stream = match connect_async(request).await {
            Ok((stream, _)) => stream,
            Err(e) => return Err(LiveError::Connect(e.to_string())),
        };
        log::info!("[channel] websocket connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        ws_tx
            .send(tungstenite::Message::Text(
                config.setup_message.to_string().into(),
            ))
            .await
            .map_err(|e| LiveError::Connect(format!("failed to send setup: {}", e)))?;

        let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<Control>(CONTROL_QUEUE);

        // Task: drain outbound queues into the socket.
        let provider_send = provider.clone();
        let event_tx_send = event_tx.clone();
        tokio::spawn(async move {
            let mut audio_done = false;
            loop {
                tokio::select! {
                    audio = audio_rx.recv(), if !audio_done => {
                        match audio {
                            Some(pcm) => {
                                let msg = provider_send.encode_audio_chunk(&pcm);
                                if send_json(&mut ws_tx, &msg).await.is_err() {
                                    let _ = event_tx_send
                                        .send(ChannelEvent::Error("send failed".into()))
                                        .await;
                                    break;
                                }
                            }
                            None => audio_done = true,
                        }
                    }
                    ctrl = ctrl_rx.recv() => {
                        match ctrl {
                            Some(Control::ToolResponse { id, name, result }) => {
                                let msg = provider_send.encode_tool_response(&id, &name, &result);
                                if send_json(&mut ws_tx, &msg).await.is_err() {
                                    let _ = event_tx_send
                                        .send(ChannelEvent::Error("send failed".into()))
                                        .await;
                                    break;
                                }
                            }
                            Some(Control::Close) | None => {
                                log::info!("[channel] closing websocket");
                                let _ = ws_tx.close().await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        // Task: parse inbound frames and forward ordered event batches.
        let provider_recv = provider.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        log::error!("[channel] websocket error: {}", e);
                        let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                        return;
                    }
                };

                let text = match msg {
                    tungstenite::Message::Text(t) => t.to_string(),
                    // The live endpoint delivers JSON in binary frames too.
                    tungstenite::Message::Binary(b) => match String::from_utf8(b.to_vec()) {
                        Ok(t) => t,
                        Err(_) => {
                            log::warn!("[channel] skipping non-utf8 binary frame");
                            continue;
                        }
                    },
                    tungstenite::Message::Close(frame) => {
                        let (code, reason) = match frame {
                            Some(f) => (u16::from(f.code), f.reason.to_string()),
                            None => (1005, String::new()),
                        };
                        log::info!("[channel] websocket closed: {} {}", code, reason);
                        let _ = event_tx.send(ChannelEvent::Closed { code, reason }).await;
                        return;
                    }
                    _ => continue,
                };

                let events = provider_recv.parse_events(&text);
                if event_tx.send(ChannelEvent::Batch(events)).await.is_err() {
                    return;
                }
            }
            // Stream ended without a close frame.
            let _ = event_tx
                .send(ChannelEvent::Closed {
                    code: 1006,
                    reason: "connection dropped".into(),
                })
                .await;
        });

        Ok(ChannelHandle { ctrl_tx })
    }
}

async fn send_json(ws_tx: &mut WsSink, msg: &Value) -> Result<(), ()> {
    ws_tx
        .send(tungstenite::Message::Text(msg.to_string().into()))
        .await
        .map_err(|e| {
            log::error!("[channel] send error: {}", e);
        })
}

fn build_ws_request(
    config: &ConnectionConfig,
) -> Result<tungstenite::http::Request<()>, LiveError> {
    let mut request = tungstenite::http::Request::builder()
        .uri(&config.url)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        );

    for (name, value) in &config.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    request
        .body(())
        .map_err(|e| LiveError::Connect(format!("failed to build request: {}", e)))
}

/// Strip the API key query parameter from log lines.
fn redact_url(url: &str) -> String {
    match url.find("key=") {
        Some(idx) => format!("{}key=***", &url[..idx]),
        None => url.to_string(),
    }
}
