use crate::{
    dialog::Dialog,
    media::MediaSession,
    transaction::transaction::Transaction,
    ua::{
        events::{Cause, Originator, SessionEvent, SessionEventReceiver, SessionEventSender},
        UserAgentInner,
    },
    Error, Result,
};
use rsip::Request;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod dtmf;
pub mod hold;
pub mod invite;
pub mod refer;
pub mod timers;

#[cfg(test)]
mod tests;

pub use dtmf::DtmfOptions;
pub use refer::ReferNotification;

/// Invite session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Null,
    /// Outgoing INVITE dispatched, nothing back yet.
    InviteSent,
    /// At least one provisional received.
    Progress1xx,
    /// Inbound INVITE being validated.
    InviteReceived,
    /// Inbound call ringing, waiting for the application.
    WaitingForAnswer,
    /// `answer()` running, 200 not out yet.
    Answered,
    /// 200 sent, waiting for the ACK.
    WaitingForAck,
    Canceled,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Explicit continuation checked when the ACK arrives, replacing
/// mid-flight hook swapping: a user terminate() that lands while the
/// 200 is unacknowledged records its intent here.
pub(crate) enum PendingPostAck {
    SendBye { extra_headers: Vec<rsip::Header> },
}

/// Options for `terminate()`.
#[derive(Default)]
pub struct TerminateOptions {
    /// Status code for rejecting an unanswered inbound call
    /// (default 480).
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
    pub extra_headers: Vec<rsip::Header>,
}

/// Options for `answer()`.
pub struct AnswerOptions {
    pub media: Arc<dyn MediaSession>,
    pub extra_headers: Vec<rsip::Header>,
}

/// Options for `call()` / outgoing INVITE.
#[derive(Default)]
pub struct CallOptions {
    pub extra_headers: Vec<rsip::Header>,
    pub anonymous: bool,
}

pub(crate) struct SessionTimerHandles {
    pub no_answer: Option<JoinHandle<()>>,
    pub expires: Option<JoinHandle<()>>,
    pub invite_2xx_retransmit: Option<JoinHandle<()>>,
    pub ack_wait: Option<JoinHandle<()>>,
    pub session_refresh: Option<JoinHandle<()>>,
}

impl SessionTimerHandles {
    fn new() -> Self {
        Self {
            no_answer: None,
            expires: None,
            invite_2xx_retransmit: None,
            ack_wait: None,
            session_refresh: None,
        }
    }

    pub fn clear_all(&mut self) {
        for handle in [
            self.no_answer.take(),
            self.expires.take(),
            self.invite_2xx_retransmit.take(),
            self.ack_wait.take(),
            self.session_refresh.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

pub(crate) struct SessionInner {
    pub id: String,
    pub direction: Direction,
    pub ua: Arc<UserAgentInner>,
    pub status: Mutex<SessionStatus>,

    pub call_id: String,
    pub from_tag: String,
    pub to_tag: Mutex<Option<String>>,
    pub local_identity: String,
    pub remote_identity: Mutex<String>,
    pub contact: rsip::Uri,

    pub dialog: Mutex<Option<Arc<Dialog>>>,
    /// Early dialogs keyed by the remote tag that minted them.
    pub early_dialogs: Mutex<HashMap<String, Arc<Dialog>>>,
    pub media: Mutex<Option<Arc<dyn MediaSession>>>,

    // flags
    pub audio_muted: AtomicBool,
    pub video_muted: AtomicBool,
    pub local_hold: AtomicBool,
    pub remote_hold: AtomicBool,
    pub is_canceled: AtomicBool,
    pub received_100: AtomicBool,
    pub is_confirmed: AtomicBool,
    pub late_sdp: AtomicBool,
    /// False while an offer/answer exchange is incomplete; a new
    /// re-offer is forbidden until it settles.
    pub rtc_ready: AtomicBool,
    pub end_event_emitted: AtomicBool,

    pub invite_request: Mutex<Option<Request>>,
    pub remote_offer: Mutex<Option<String>>,
    pub cancel_reason: Mutex<Option<String>>,
    pub cancel_sent: AtomicBool,
    /// The INVITE server transaction while an inbound call is
    /// unanswered; replaced by session-owned retransmission after the
    /// 2xx.
    pub server_invite: Mutex<Option<Transaction>>,
    pub pending_post_ack: Mutex<Option<PendingPostAck>>,
    /// Session id this one replaces once confirmed.
    pub replaces: Mutex<Option<String>>,

    pub timers: Mutex<SessionTimerHandles>,
    pub session_timer: Mutex<timers::SessionTimerState>,
    pub dtmf: Mutex<dtmf::DtmfQueue>,
    pub refer: Mutex<refer::ReferState>,

    pub event_sender: SessionEventSender,
    pub event_receiver: Mutex<Option<SessionEventReceiver>>,
    pub cancel_token: CancellationToken,
}

/// Handle to one INVITE session (a call leg). Cheap to clone; the
/// UA keeps one in its session map until the session terminates.
#[derive(Clone)]
pub struct InviteSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl InviteSession {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.lock().unwrap()
    }

    pub fn is_established(&self) -> bool {
        self.inner.is_confirmed.load(Ordering::Relaxed)
    }

    pub fn is_ended(&self) -> bool {
        self.status() == SessionStatus::Terminated
    }

    pub fn local_identity(&self) -> &str {
        &self.inner.local_identity
    }

    pub fn remote_identity(&self) -> String {
        self.inner.remote_identity.lock().unwrap().clone()
    }

    pub fn is_on_local_hold(&self) -> bool {
        self.inner.local_hold.load(Ordering::Relaxed)
    }

    pub fn is_on_remote_hold(&self) -> bool {
        self.inner.remote_hold.load(Ordering::Relaxed)
    }

    /// Answer an inbound call. Valid only in `WaitingForAnswer`.
    pub async fn answer(&self, options: AnswerOptions) -> Result<()> {
        self.inner.answer(options).await
    }

    /// Terminate the session; the exact behavior depends on the
    /// state (CANCEL, reject, or BYE). Idempotent once terminated.
    pub async fn terminate(&self, options: TerminateOptions) -> Result<()> {
        self.inner.terminate(options).await
    }

    /// Put the call on hold (re-offer with mangled directions).
    pub async fn hold(&self) -> Result<()> {
        self.inner.hold(true).await
    }

    pub async fn unhold(&self) -> Result<()> {
        self.inner.hold(false).await
    }

    /// Re-offer the current local description (re-INVITE).
    pub async fn renegotiate(&self, use_update: bool) -> Result<()> {
        self.inner.renegotiate(use_update).await
    }

    pub fn mute(&self, audio: bool, video: bool) {
        self.inner.set_muted(audio, video, true)
    }

    pub fn unmute(&self, audio: bool, video: bool) {
        self.inner.set_muted(audio, video, false)
    }

    /// Queue DTMF tones for delivery over INFO.
    pub fn send_dtmf(&self, tones: &str, options: DtmfOptions) -> Result<()> {
        dtmf::send_dtmf(&self.inner, tones, options)
    }

    /// Send an arbitrary INFO body in-dialog.
    pub async fn send_info(&self, content_type: &str, body: Vec<u8>) -> Result<()> {
        self.inner.send_info(content_type, body).await
    }

    /// Blind-transfer the peer to `target`. Progress arrives as
    /// [`ReferNotification`]s.
    pub async fn refer(&self, target: &str) -> Result<tokio::sync::mpsc::UnboundedReceiver<ReferNotification>> {
        refer::send_refer(&self.inner, target).await
    }

    /// Accept an inbound REFER (from the `Refer` event) by placing a
    /// call to the referred target; NOTIFYs track the new call.
    pub async fn accept_refer(
        &self,
        id: u32,
        media: Arc<dyn MediaSession>,
        options: CallOptions,
    ) -> Result<InviteSession> {
        refer::accept_refer(&self.inner, id, media, options).await
    }

    pub async fn reject_refer(&self, id: u32) -> Result<()> {
        refer::reject_refer(&self.inner, id).await
    }

    /// Take the per-session event stream. First caller wins.
    pub fn take_events(&self) -> Option<SessionEventReceiver> {
        self.inner.take_events()
    }
}

impl SessionInner {
    pub(crate) fn emit(&self, event: SessionEvent) {
        self.event_sender.send(event).ok();
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap()
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub(crate) fn set_muted(&self, audio: bool, video: bool, muted: bool) {
        if audio {
            self.audio_muted.store(muted, Ordering::Relaxed);
        }
        if video {
            self.video_muted.store(muted, Ordering::Relaxed);
        }
        if muted {
            self.emit(SessionEvent::Muted { audio, video });
        } else {
            self.emit(SessionEvent::Unmuted { audio, video });
        }
    }

    pub(crate) fn media(&self) -> Option<Arc<dyn MediaSession>> {
        self.media.lock().unwrap().clone()
    }

    pub(crate) fn dialog(&self) -> Option<Arc<Dialog>> {
        self.dialog.lock().unwrap().clone()
    }

    pub(crate) fn require_dialog(&self) -> Result<Arc<Dialog>> {
        self.dialog().ok_or_else(|| {
            Error::InvalidState("session has no confirmed dialog".to_string())
        })
    }

    fn take_events(&self) -> Option<SessionEventReceiver> {
        self.event_receiver.lock().unwrap().take()
    }

    /// Emit the terminal event exactly once.
    pub(crate) fn emit_failed(
        &self,
        originator: Originator,
        cause: Cause,
        response: Option<rsip::Response>,
    ) {
        if self.end_event_emitted.swap(true, Ordering::Relaxed) {
            return;
        }
        self.emit(SessionEvent::Failed {
            originator,
            cause,
            response,
        });
    }

    pub(crate) fn emit_ended(&self, originator: Originator, cause: Cause) {
        if self.end_event_emitted.swap(true, Ordering::Relaxed) {
            return;
        }
        self.emit(SessionEvent::Ended { originator, cause });
    }

    /// Final cleanup: maps, DTMF queue, media, timers. Safe to call
    /// more than once. Everything before the timer abort is
    /// synchronous: a timer task tearing its own session down aborts
    /// itself last, after the bookkeeping is already done.
    pub(crate) async fn close(&self) {
        {
            let mut status = self.status.lock().unwrap();
            if *status == SessionStatus::Terminated {
                return;
            }
            *status = SessionStatus::Terminated;
        }
        self.cancel_token.cancel();
        self.dtmf.lock().unwrap().clear();
        if let Some(dialog) = self.dialog() {
            self.ua.remove_dialog(&dialog.id());
        }
        {
            let mut early = self.early_dialogs.lock().unwrap();
            for dialog in early.values() {
                self.ua.remove_dialog(&dialog.id());
            }
            early.clear();
        }
        self.ua.remove_session(&self.id);
        if let Some(media) = self.media() {
            tokio::spawn(async move {
                media.close().await;
            });
        }
        self.timers.lock().unwrap().clear_all();
    }
}
