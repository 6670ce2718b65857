use super::{SessionInner, SessionStatus};
use crate::{
    rsip_ext::{header_contains_token, header_value},
    transaction::sender::{RequestSender, TransactionUser},
    ua::events::{Cause, Originator},
};
use async_trait::async_trait;
use rsip::{prelude::HasHeaders, Header, Method, StatusCodeKind};
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tracing::{debug, info, warn};

/// RFC 4028 defaults, in seconds.
pub const DEFAULT_SESSION_EXPIRES: u32 = 90;
pub const MIN_SESSION_EXPIRES: u32 = 90;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionTimerState {
    pub running: bool,
    /// Negotiated Session-Expires, seconds.
    pub interval: u32,
    /// True when this side sends the refreshes.
    pub refresher: bool,
}

impl SessionTimerState {
    pub fn new() -> Self {
        Self {
            running: false,
            interval: DEFAULT_SESSION_EXPIRES,
            refresher: false,
        }
    }
}

/// `Session-Expires: 1800;refresher=uac` -> (1800, Some("uac")).
fn parse_session_expires(headers: &rsip::Headers) -> Option<(u32, Option<String>)> {
    let value = header_value(headers, "Session-Expires")?;
    let mut parts = value.split(';');
    let interval: u32 = parts.next()?.trim().parse().ok()?;
    let refresher = parts.find_map(|p| {
        let mut kv = p.splitn(2, '=');
        if kv.next()?.trim().eq_ignore_ascii_case("refresher") {
            Some(kv.next()?.trim().to_lowercase())
        } else {
            None
        }
    });
    Some((interval, refresher))
}

/// Adopt the timer advertised in a 2xx to our INVITE/UPDATE
/// (we are the UAC).
pub(crate) fn on_uac_final_response(session: &Arc<SessionInner>, response: &rsip::Response) {
    if !session.ua.settings.config.session_timers {
        return;
    }
    let mut state = session.session_timer.lock().unwrap();
    match parse_session_expires(response.headers()) {
        Some((interval, refresher)) if interval >= MIN_SESSION_EXPIRES => {
            state.running = true;
            state.interval = interval;
            state.refresher = refresher.as_deref() == Some("uac");
        }
        Some(_) => {
            debug!(id = %session.id, "peer session timer below minimum, ignoring");
            return;
        }
        None => {
            // peer ignored timers: we refresh at the default rate
            state.running = true;
            state.interval = DEFAULT_SESSION_EXPIRES;
            state.refresher = true;
        }
    }
    drop(state);
    if session.is_confirmed.load(Ordering::Relaxed) {
        start(session);
    }
}

/// Decide the Session-Expires header for our 200 (we are the UAS);
/// also arms the state adopted at confirmation.
pub(crate) fn on_uas_answer(session: &Arc<SessionInner>, request: &rsip::Request) -> Option<Header> {
    if !session.ua.settings.config.session_timers {
        return None;
    }
    let mut state = session.session_timer.lock().unwrap();
    match parse_session_expires(request.headers()) {
        Some((interval, refresher)) if interval >= MIN_SESSION_EXPIRES => {
            // peer named a refresher: honor it, else refresh ourselves
            let peer_refreshes = refresher.as_deref() == Some("uac");
            state.running = true;
            state.interval = interval;
            state.refresher = !peer_refreshes;
            let role = if state.refresher { "uas" } else { "uac" };
            Some(Header::Other(
                "Session-Expires".into(),
                format!("{};refresher={}", interval, role),
            ))
        }
        Some(_) => None,
        None => {
            if header_contains_token(request.headers(), "Supported", "timer") {
                state.running = true;
                state.interval = DEFAULT_SESSION_EXPIRES;
                state.refresher = true;
                Some(Header::Other(
                    "Session-Expires".into(),
                    format!("{};refresher=uas", state.interval),
                ))
            } else {
                None
            }
        }
    }
}

/// Inbound re-INVITE/UPDATE acts as a refresh: re-adopt and restart.
pub(crate) fn on_refresh_request(session: &Arc<SessionInner>, request: &rsip::Request) {
    if !session.ua.settings.config.session_timers {
        return;
    }
    {
        let mut state = session.session_timer.lock().unwrap();
        if let Some((interval, refresher)) = parse_session_expires(request.headers()) {
            if interval >= MIN_SESSION_EXPIRES {
                state.running = true;
                state.interval = interval;
                state.refresher = refresher.as_deref() == Some("uas");
            }
        }
        if !state.running {
            return;
        }
    }
    if session.is_confirmed.load(Ordering::Relaxed) {
        start(session);
    }
}

/// Session-Expires for an outgoing refresh or re-offer.
pub(crate) fn refresh_header(session: &Arc<SessionInner>) -> Option<Header> {
    let state = *session.session_timer.lock().unwrap();
    if !state.running {
        return Some(Header::Other(
            "Session-Expires".into(),
            DEFAULT_SESSION_EXPIRES.to_string(),
        ));
    }
    Some(Header::Other(
        "Session-Expires".into(),
        format!("{};refresher=uac", state.interval),
    ))
}

/// Arm the refresher or observer task (§4.6.6): the refresher fires
/// an UPDATE at `expires/2`, the observer tears the session down at
/// `expires * 1.1` if no refresh arrived.
pub(crate) fn start(session: &Arc<SessionInner>) {
    let state = *session.session_timer.lock().unwrap();
    if !state.running {
        return;
    }
    let wait = if state.refresher {
        Duration::from_secs(u64::from(state.interval) / 2)
    } else {
        Duration::from_millis(u64::from(state.interval) * 1100)
    };

    let inner = session.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        if inner.status() != SessionStatus::Confirmed {
            return;
        }
        if state.refresher {
            debug!(id = %inner.id, "session timer refresh");
            send_refresh(&inner).await;
        } else {
            info!(id = %inner.id, "session expired without refresh");
            inner.emit_ended(Originator::System, Cause::RequestTimeout);
            inner.do_bye(vec![]).await;
        }
    });
    let mut timers = session.timers.lock().unwrap();
    if let Some(previous) = timers.session_refresh.replace(handle) {
        previous.abort();
    }
}

struct RefreshApplicant {
    session: Arc<SessionInner>,
}

#[async_trait]
impl TransactionUser for RefreshApplicant {
    async fn receive_response(&self, response: rsip::Response) {
        let session = &self.session;
        match response.status_code.kind() {
            StatusCodeKind::Provisional => {}
            StatusCodeKind::Successful => {
                on_uac_final_response(session, &response);
                start(session);
            }
            _ => {
                let code = response.status_code.code();
                if code == 408 || code == 481 {
                    warn!(id = %session.id, code, "refresh failed, dialog is dead");
                    session.emit_ended(Originator::System, Cause::RequestTimeout);
                    session.close().await;
                } else {
                    // keep the session, try again next period
                    start(session);
                }
            }
        }
    }

    async fn on_request_timeout(&self) {
        let session = &self.session;
        session.emit_ended(Originator::System, Cause::RequestTimeout);
        session.close().await;
    }

    async fn on_transport_error(&self, _error: String) {
        self.session.on_transport_closed().await;
    }

    fn next_cseq_for_retry(&self) -> Option<u32> {
        self.session.dialog().map(|d| d.next_local_seq())
    }
}

/// The refresh itself: an UPDATE without SDP carrying Session-Expires.
async fn send_refresh(session: &Arc<SessionInner>) {
    let dialog = match session.dialog() {
        Some(dialog) => dialog,
        None => return,
    };
    let mut headers = vec![];
    if let Some(se) = refresh_header(session) {
        headers.push(se);
    }
    match dialog.create_request(
        Method::Update,
        headers,
        None,
        &session.contact,
        session.ua.user_agent(),
    ) {
        Ok(request) => {
            RequestSender::new(
                session.ua.core.clone(),
                request,
                Arc::new(RefreshApplicant {
                    session: session.clone(),
                }),
                session.ua.credential(),
                session.ua.is_user_closed(),
            )
            .spawn();
        }
        Err(e) => warn!(id = %session.id, "cannot build refresh UPDATE: {}", e),
    }
}
