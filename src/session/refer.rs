use super::{CallOptions, InviteSession, SessionInner, SessionStatus};
use crate::{
    media::MediaSession,
    rsip_ext::{extract_uri_from_contact, header_value},
    transaction::{
        sender::{RequestSender, TransactionUser},
        transaction::Transaction,
    },
    ua::{events::SessionEvent, make_response},
    Error, Result,
};
use async_trait::async_trait;
use rsip::{
    prelude::{HasHeaders, HeadersExt},
    Header, Method, StatusCode, StatusCodeKind,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Transfer progress reported back to the REFER issuer, decoded from
/// NOTIFY sipfrag bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferNotification {
    Trying,
    Progress(u16),
    Accepted,
    Failed(u16),
}

pub(crate) struct ReferState {
    /// Outbound REFERs awaiting NOTIFYs, keyed by the REFER CSeq.
    subscribers: HashMap<u32, UnboundedSender<ReferNotification>>,
    /// Inbound REFERs pending a user decision, keyed the same way.
    pending: HashMap<u32, rsip::Uri>,
}

impl ReferState {
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

struct ReferApplicant {
    session: Arc<SessionInner>,
    id: u32,
}

#[async_trait]
impl TransactionUser for ReferApplicant {
    async fn receive_response(&self, response: rsip::Response) {
        if response.status_code.kind() == StatusCodeKind::Provisional {
            return;
        }
        if response.status_code.kind() != StatusCodeKind::Successful {
            let code = response.status_code.code();
            info!(id = %self.session.id, code, "REFER rejected");
            let subscriber = self
                .session
                .refer
                .lock()
                .unwrap()
                .subscribers
                .remove(&self.id);
            if let Some(subscriber) = subscriber {
                subscriber.send(ReferNotification::Failed(code)).ok();
            }
        }
    }

    async fn on_request_timeout(&self) {
        let subscriber = self
            .session
            .refer
            .lock()
            .unwrap()
            .subscribers
            .remove(&self.id);
        if let Some(subscriber) = subscriber {
            subscriber.send(ReferNotification::Failed(408)).ok();
        }
    }

    async fn on_transport_error(&self, _error: String) {
        self.on_request_timeout().await;
    }

    fn next_cseq_for_retry(&self) -> Option<u32> {
        self.session.dialog().map(|d| d.next_local_seq())
    }
}

/// Blind transfer (RFC 3515): REFER inside the dialog, transfer
/// progress comes back as NOTIFYs.
pub(crate) async fn send_refer(
    session: &Arc<SessionInner>,
    target: &str,
) -> Result<UnboundedReceiver<ReferNotification>> {
    if session.status() != SessionStatus::Confirmed {
        return Err(Error::InvalidState(
            "transfer requires an established call".to_string(),
        ));
    }
    let dialog = session.require_dialog()?;
    let refer_to = session.ua.normalize_target(target)?;

    let request = dialog.create_request(
        Method::Refer,
        vec![
            Header::Other("Refer-To".into(), format!("<{}>", refer_to)),
            Header::Other(
                "Referred-By".into(),
                format!("<{}>", session.ua.settings.uri),
            ),
        ],
        None,
        &session.contact,
        session.ua.user_agent(),
    )?;
    let id = request.cseq_header()?.seq()?;

    let (sender, receiver) = unbounded_channel();
    session
        .refer
        .lock()
        .unwrap()
        .subscribers
        .insert(id, sender);

    RequestSender::new(
        session.ua.core.clone(),
        request,
        Arc::new(ReferApplicant {
            session: session.clone(),
            id,
        }),
        session.ua.credential(),
        session.ua.is_user_closed(),
    )
    .spawn();
    Ok(receiver)
}

/// Inbound REFER: 202, open a notifier subscription, let the user
/// decide.
pub(crate) async fn receive_refer(session: &Arc<SessionInner>, mut tx: Transaction) {
    let request = tx.original.clone();
    let refer_to = header_value(request.headers(), "Refer-To")
        .and_then(|v| extract_uri_from_contact(&v).ok());
    let refer_to = match refer_to {
        Some(uri) => uri,
        None => {
            let resp = make_response(&request, StatusCode::BadRequest, None, vec![], None);
            tx.respond(resp).await.ok();
            return;
        }
    };
    let id = match request.cseq_header().and_then(|c| c.seq()) {
        Ok(id) => id,
        Err(_) => return,
    };
    let referred_by = header_value(request.headers(), "Referred-By");

    let accepted = make_response(&request, StatusCode::Accepted, None, vec![], None);
    tx.respond(accepted).await.ok();

    session
        .refer
        .lock()
        .unwrap()
        .pending
        .insert(id, refer_to.clone());

    notify_refer(session, id, 100, "Trying", false).await;
    session.emit(SessionEvent::Refer {
        id,
        refer_to,
        referred_by,
    });
}

/// User accepted the transfer: call the referred target and relay
/// the new call's progress as sipfrag NOTIFYs.
pub(crate) async fn accept_refer(
    session: &Arc<SessionInner>,
    id: u32,
    media: Arc<dyn MediaSession>,
    options: CallOptions,
) -> Result<InviteSession> {
    let target = session
        .refer
        .lock()
        .unwrap()
        .pending
        .remove(&id)
        .ok_or_else(|| Error::InvalidState(format!("no pending refer {}", id)))?;

    let child = SessionInner::connect(session.ua.clone(), target, media, options).await?;

    // interpose on the child's event stream: act on call progress,
    // then pass every event through to the application
    if let Some(mut events) = child.take_events() {
        let (forward, receiver) = unbounded_channel();
        child
            .inner
            .event_receiver
            .lock()
            .unwrap()
            .replace(receiver);
        let referee = session.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event {
                    SessionEvent::Progress { .. } => {
                        notify_refer(&referee, id, 180, "Ringing", false).await;
                    }
                    SessionEvent::Accepted { .. } => {
                        notify_refer(&referee, id, 200, "OK", true).await;
                    }
                    SessionEvent::Failed { response, .. } => {
                        let code = response
                            .as_ref()
                            .map(|r| r.status_code.code())
                            .unwrap_or(503);
                        notify_refer(&referee, id, code, "Transfer Failed", true).await;
                    }
                    _ => {}
                }
                if forward.send(event).is_err() {
                    break;
                }
            }
        });
    }
    Ok(child)
}

pub(crate) async fn reject_refer(session: &Arc<SessionInner>, id: u32) -> Result<()> {
    session
        .refer
        .lock()
        .unwrap()
        .pending
        .remove(&id)
        .ok_or_else(|| Error::InvalidState(format!("no pending refer {}", id)))?;
    notify_refer(session, id, 603, "Declined", true).await;
    Ok(())
}

struct NotifyApplicant {
    session: Arc<SessionInner>,
}

#[async_trait]
impl TransactionUser for NotifyApplicant {
    async fn receive_response(&self, response: rsip::Response) {
        debug!("NOTIFY answered with {}", response.status_code);
    }
    async fn on_request_timeout(&self) {}
    async fn on_transport_error(&self, _error: String) {}
    fn next_cseq_for_retry(&self) -> Option<u32> {
        self.session.dialog().map(|d| d.next_local_seq())
    }
}

/// One refer-event NOTIFY carrying a sipfrag status line.
async fn notify_refer(
    session: &Arc<SessionInner>,
    id: u32,
    code: u16,
    reason: &str,
    terminated: bool,
) {
    let dialog = match session.dialog() {
        Some(dialog) => dialog,
        None => return,
    };
    let subscription_state = if terminated {
        "terminated;reason=noresource".to_string()
    } else {
        "active;expires=60".to_string()
    };
    let body = format!("SIP/2.0 {} {}\r\n", code, reason);
    let headers = vec![
        Header::Other("Event".into(), format!("refer;id={}", id)),
        Header::Other("Subscription-State".into(), subscription_state),
        Header::ContentType("message/sipfrag;version=2.0".into()),
    ];
    match dialog.create_request(
        Method::Notify,
        headers,
        Some(body.into_bytes()),
        &session.contact,
        session.ua.user_agent(),
    ) {
        Ok(request) => {
            RequestSender::new(
                session.ua.core.clone(),
                request,
                Arc::new(NotifyApplicant {
                    session: session.clone(),
                }),
                session.ua.credential(),
                false,
            )
            .spawn();
        }
        Err(e) => warn!(id = %session.id, "cannot build NOTIFY: {}", e),
    }
}

/// First status line of a sipfrag body.
fn sipfrag_status(body: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(body).ok()?;
    let line = text.lines().next()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("SIP/2.0") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Inbound NOTIFY on the dialog: refer-package transfer progress.
pub(crate) async fn receive_notify(session: &Arc<SessionInner>, mut tx: Transaction) {
    let request = tx.original.clone();
    let event = header_value(request.headers(), "Event").unwrap_or_default();
    let event = event.trim().to_lowercase();
    if !event.starts_with("refer") {
        let resp = make_response(&request, StatusCode::BadEvent, None, vec![], None);
        tx.respond(resp).await.ok();
        return;
    }

    let id: Option<u32> = event
        .split(';')
        .find_map(|p| p.trim().strip_prefix("id=").and_then(|v| v.parse().ok()));
    let terminated = header_value(request.headers(), "Subscription-State")
        .map(|s| s.trim().to_lowercase().starts_with("terminated"))
        .unwrap_or(false);

    let ok = make_response(&request, StatusCode::OK, None, vec![], None);
    tx.respond(ok).await.ok();

    let notification = match sipfrag_status(&request.body) {
        Some(code) if code < 180 => ReferNotification::Trying,
        Some(code) if code < 200 => ReferNotification::Progress(code),
        Some(code) if code < 300 => ReferNotification::Accepted,
        Some(code) => ReferNotification::Failed(code),
        None => return,
    };

    let mut refer = session.refer.lock().unwrap();
    // NOTIFYs without an id target the only subscription (RFC 3515
    // allows this when a single REFER is outstanding)
    let key = id.or_else(|| refer.subscribers.keys().next().copied());
    if let Some(key) = key {
        let drop_subscriber = terminated
            || matches!(
                notification,
                ReferNotification::Accepted | ReferNotification::Failed(_)
            );
        if let Some(subscriber) = refer.subscribers.get(&key) {
            subscriber.send(notification).ok();
        }
        if drop_subscriber {
            refer.subscribers.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sipfrag_status() {
        assert_eq!(sipfrag_status(b"SIP/2.0 180 Ringing\r\n"), Some(180));
        assert_eq!(sipfrag_status(b"SIP/2.0 200 OK"), Some(200));
        assert_eq!(sipfrag_status(b"garbage"), None);
        assert_eq!(sipfrag_status(b""), None);
    }
}
