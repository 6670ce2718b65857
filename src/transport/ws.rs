use super::{TransportEvent, TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE};
use crate::{Error, Result};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rsip::SipMessage;
use std::{fmt, sync::Arc};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct WsInner {
    ws_uri: String,
    ws_sink: Mutex<WsSink>,
    ws_read: Mutex<Option<WsRead>>,
}

/// A client WebSocket connection carrying SIP per RFC 7118: the
/// `sip` subprotocol is offered on the handshake and every SIP
/// message travels in its own text frame.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<WsInner>,
}

impl WsConnection {
    pub async fn connect(ws_uri: &str) -> Result<Self> {
        let mut request = ws_uri
            .into_client_request()
            .map_err(|e| Error::Transport(format!("bad ws uri {}: {}", ws_uri, e)))?;
        request
            .headers_mut()
            .insert("sec-websocket-protocol", "sip".parse().unwrap());

        let (ws_stream, _) = connect_async(request).await?;
        let (ws_sink, ws_read) = ws_stream.split();

        info!("WebSocket connected: {}", ws_uri);
        Ok(WsConnection {
            inner: Arc::new(WsInner {
                ws_uri: ws_uri.to_string(),
                ws_sink: Mutex::new(ws_sink),
                ws_read: Mutex::new(Some(ws_read)),
            }),
        })
    }

    pub fn ws_uri(&self) -> &str {
        &self.inner.ws_uri
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        let data = msg.to_string();
        debug!("WebSocket send ({} bytes):\n{}", data.len(), data);
        let mut sink = self.inner.ws_sink.lock().await;
        sink.send(Message::Text(data.into())).await?;
        Ok(())
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut sink = self.inner.ws_sink.lock().await;
        sink.send(Message::Binary(data.to_vec().into())).await?;
        Ok(())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Option<String> {
        let mut ws_read = match self.inner.ws_read.lock().await.take() {
            Some(ws_read) => ws_read,
            None => return Some("serve_loop called twice".to_string()),
        };

        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if text.as_bytes() == KEEPALIVE_REQUEST {
                        self.send_raw(KEEPALIVE_RESPONSE).await.ok();
                        continue;
                    }
                    if text.as_bytes().iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    debug!("WebSocket recv:\n{}", text);
                    match SipMessage::try_from(text.as_str()) {
                        Ok(msg) => {
                            if sender.send(TransportEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("dropping unparseable SIP frame: {}", e),
                    }
                }
                Ok(Message::Binary(bin)) => {
                    if bin == *KEEPALIVE_REQUEST {
                        self.send_raw(KEEPALIVE_RESPONSE).await.ok();
                        continue;
                    }
                    match SipMessage::try_from(bin.to_vec()) {
                        Ok(msg) => {
                            if sender.send(TransportEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("dropping unparseable SIP frame: {}", e),
                    }
                }
                Ok(Message::Ping(data)) => {
                    let mut sink = self.inner.ws_sink.lock().await;
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return Some(
                        frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by peer".to_string()),
                    );
                }
                Err(e) => {
                    return Some(e.to_string());
                }
                _ => {}
            }
        }
        None
    }

    pub async fn close(&self) {
        let mut sink = self.inner.ws_sink.lock().await;
        sink.send(Message::Close(None)).await.ok();
    }
}

impl fmt::Display for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WS {}", self.inner.ws_uri)
    }
}
