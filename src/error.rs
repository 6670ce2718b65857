use crate::{dialog::DialogId, transaction::key::TransactionKey};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("user agent not ready: {0}")]
    NotReady(String),

    #[error("SIP message error: {0}")]
    SipMessage(#[from] rsip::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transaction error: {0}: {1}")]
    Transaction(String, TransactionKey),

    #[error("dialog error: {0}: {1}")]
    Dialog(String, DialogId),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("error: {0}")]
    Error(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSend(e.to_string())
    }
}
