use rsip::SipMessage;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod channel;
pub mod connection;
pub mod server_set;
pub mod transport;
pub mod ws;

pub use connection::Connection;
pub use server_set::{ServerSet, ServerStatus};
pub use transport::{TransportStatus, WsTransport};

#[cfg(test)]
mod tests;

// RFC 5626 double-CRLF keep-alive
pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Events the transport reports upward to the user agent.
#[derive(Debug)]
pub enum TransportEvent {
    /// A socket is open towards the current server.
    Connected,
    /// The socket closed; the payload is the close/error description
    /// when the closure was not locally requested.
    Closed(Option<String>),
    /// A connect attempt failed; recovery continues.
    Error(String),
    /// One parsed SIP message, one WebSocket text frame.
    Message(SipMessage),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;
