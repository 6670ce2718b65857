use crate::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

/// Events the media engine pushes into the signalling core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    /// The media path died after being established.
    ConnectionLost,
    IceFailed,
}

/// Seam to the media engine (WebRTC or otherwise). The signalling
/// core only moves SDP blobs through it; it never inspects media
/// beyond the hold direction-mangling hook.
///
/// Implementations must be cheap to call concurrently; the session
/// serializes offer/answer interactions itself.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    async fn create_answer(&self) -> Result<String>;
    async fn set_local(&self, sdp: String) -> Result<()>;
    async fn set_remote(&self, sdp: String) -> Result<()>;
    async fn close(&self);
    /// One-shot event stream; `None` for engines without media-level
    /// failure reporting.
    fn take_events(&self) -> Option<UnboundedReceiver<MediaEvent>> {
        None
    }
}

/// Canned-SDP media session: returns fixed local SDP and remembers
/// what the peer sent. Enough for signalling tests and data-only
/// embedders; real clients plug a WebRTC engine in instead.
pub struct StaticMedia {
    local_sdp: String,
    remote_sdp: Mutex<Option<String>>,
    closed: Mutex<bool>,
}

impl StaticMedia {
    pub fn new(local_sdp: &str) -> Self {
        Self {
            local_sdp: local_sdp.to_string(),
            remote_sdp: Mutex::new(None),
            closed: Mutex::new(false),
        }
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.remote_sdp.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl MediaSession for StaticMedia {
    async fn create_offer(&self) -> Result<String> {
        Ok(self.local_sdp.clone())
    }

    async fn create_answer(&self) -> Result<String> {
        Ok(self.local_sdp.clone())
    }

    async fn set_local(&self, _sdp: String) -> Result<()> {
        Ok(())
    }

    async fn set_remote(&self, sdp: String) -> Result<()> {
        self.remote_sdp.lock().unwrap().replace(sdp);
        Ok(())
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}
