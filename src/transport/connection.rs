use super::{channel::ChannelConnection, ws::WsConnection, TransportSender};
use crate::Result;
use rsip::SipMessage;
use std::fmt;

/// One outbound byte stream towards the SIP server.
///
/// Both variants are reliable transports: the transaction layer never
/// retransmits over them, timers only bound response waiting.
#[derive(Clone)]
pub enum Connection {
    WebSocket(WsConnection),
    /// In-memory pair used by tests in place of a socket.
    Channel(ChannelConnection),
}

impl Connection {
    pub fn is_reliable(&self) -> bool {
        true
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        match self {
            Connection::WebSocket(c) => c.send(msg).await,
            Connection::Channel(c) => c.send(msg).await,
        }
    }

    /// Read frames until the peer closes or errors; parsed messages
    /// are forwarded as [`TransportEvent::Message`]. Returns the
    /// close/error description, `None` for a clean local close.
    pub async fn serve_loop(&self, sender: TransportSender) -> Option<String> {
        match self {
            Connection::WebSocket(c) => c.serve_loop(sender).await,
            Connection::Channel(c) => c.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Connection::WebSocket(c) => c.close().await,
            Connection::Channel(c) => c.close().await,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::WebSocket(c) => write!(f, "{}", c),
            Connection::Channel(c) => write!(f, "{}", c),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<WsConnection> for Connection {
    fn from(c: WsConnection) -> Self {
        Connection::WebSocket(c)
    }
}

impl From<ChannelConnection> for Connection {
    fn from(c: ChannelConnection) -> Self {
        Connection::Channel(c)
    }
}
