use super::{TransportEvent, TransportSender};
use crate::Result;
use rsip::SipMessage;
use std::{fmt, sync::Arc};
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender},
    Mutex,
};

struct ChannelInner {
    incoming: Mutex<Option<UnboundedReceiver<SipMessage>>>,
    outgoing: UnboundedSender<SipMessage>,
}

/// In-memory stand-in for the WebSocket: messages written by the UA
/// pop out of `outgoing`, messages pushed into `incoming` are
/// delivered upward as if read off the wire. Test-only plumbing.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub fn new(
        incoming: UnboundedReceiver<SipMessage>,
        outgoing: UnboundedSender<SipMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                incoming: Mutex::new(Some(incoming)),
                outgoing,
            }),
        }
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        self.inner.outgoing.send(msg).map_err(Into::into)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Option<String> {
        let mut incoming = match self.inner.incoming.lock().await.take() {
            Some(incoming) => incoming,
            None => return Some("serve_loop called twice".to_string()),
        };
        while let Some(msg) = incoming.recv().await {
            if sender.send(TransportEvent::Message(msg)).is_err() {
                break;
            }
        }
        None
    }

    pub async fn close(&self) {
        self.inner.incoming.lock().await.take();
    }
}

impl fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CHANNEL *:*")
    }
}
