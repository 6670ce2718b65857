use crate::{
    config::{Settings, UaConfig},
    dialog::DialogId,
    media::MediaSession,
    message,
    registrar::Registrator,
    session::{CallOptions, InviteSession, SessionInner, TerminateOptions},
    transaction::{
        make_via_branch,
        transaction::{TransactionCore, TransactionCoreRef},
    },
    transport::{ServerSet, TransportEvent, WsTransport},
    Error, Result,
};
use self::events::{UaEvent, UaEventReceiver, UaEventSender};
use rsip::{Header, Request, Response, StatusCode};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod dispatcher;
pub mod events;


pub const ALLOWED_METHODS: &str = "INVITE,ACK,CANCEL,BYE,UPDATE,OPTIONS,MESSAGE,INFO,REFER,NOTIFY";
pub const SUPPORTED_EXTENSIONS: &str = "timer,gruu,replaces";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaStatus {
    Init,
    /// Transport open and not user-closed.
    Ready,
    UserClosed,
    NotReady,
}

pub struct UserAgentInner {
    pub settings: Settings,
    pub core: TransactionCoreRef,
    pub(crate) transport: WsTransport,
    status: Mutex<UaStatus>,

    pub(crate) sessions: RwLock<HashMap<String, InviteSession>>,
    /// Dialog id -> owning session id. Sessions own their dialogs;
    /// this map only routes.
    pub(crate) dialogs: RwLock<HashMap<DialogId, String>>,
    pub(crate) registrator: Mutex<Option<Registrator>>,
    /// GRUU adopted from a REGISTER response; session contact
    /// thereafter.
    gruu: Mutex<Option<rsip::Uri>>,

    event_sender: UaEventSender,
    event_receiver: Mutex<Option<UaEventReceiver>>,
    pub(crate) cancel_token: CancellationToken,
}

/// The user agent: owner of the transport, the four transaction
/// maps, every live session and dialog, and the registrar client.
#[derive(Clone)]
pub struct UserAgent {
    pub(crate) inner: Arc<UserAgentInner>,
}

impl UserAgent {
    pub fn new(config: UaConfig) -> Result<Self> {
        let settings = config.validate()?;
        let cancel_token = CancellationToken::new();
        let (event_sender, event_receiver) = unbounded_channel();
        let (transport_sender, transport_receiver) = unbounded_channel();

        let servers = ServerSet::new(
            &settings.config.ws_servers,
            Duration::from_secs(settings.config.connection_recovery_min_interval),
            Duration::from_secs(settings.config.connection_recovery_max_interval),
        );
        let transport = WsTransport::new(servers, transport_sender, cancel_token.child_token());
        let core = TransactionCore::new(transport.clone(), cancel_token.child_token(), None);

        let inner = Arc::new(UserAgentInner {
            settings,
            core,
            transport,
            status: Mutex::new(UaStatus::Init),
            sessions: RwLock::new(HashMap::new()),
            dialogs: RwLock::new(HashMap::new()),
            registrator: Mutex::new(None),
            gruu: Mutex::new(None),
            event_sender,
            event_receiver: Mutex::new(Some(event_receiver)),
            cancel_token,
        });

        inner
            .registrator
            .lock()
            .unwrap()
            .replace(Registrator::new(inner.clone()));

        // transport events drive the dispatcher for the UA lifetime
        {
            let inner = inner.clone();
            let mut transport_receiver = transport_receiver;
            tokio::spawn(async move {
                while let Some(event) = transport_receiver.recv().await {
                    inner.on_transport_event(event).await;
                }
            });
        }
        {
            let core = inner.core.clone();
            tokio::spawn(async move { core.process_timer().await });
        }

        Ok(UserAgent { inner })
    }

    /// Connect the transport (and register, when configured).
    pub fn start(&self) {
        info!("starting user agent {}", self.inner.settings.uri);
        self.inner.transport.spawn();
    }

    /// Graceful shutdown: unregister, end every session, close the
    /// socket. The UA cannot be restarted afterwards.
    pub async fn stop(&self) {
        {
            let status = *self.inner.status.lock().unwrap();
            if status == UaStatus::UserClosed {
                return;
            }
        }
        info!("stopping user agent");

        let registrator = self.inner.registrator.lock().unwrap().clone();
        if let Some(registrator) = &registrator {
            registrator.close().await;
        }

        let sessions: Vec<InviteSession> = self
            .inner
            .sessions
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for session in sessions {
            session.terminate(TerminateOptions::default()).await.ok();
        }

        *self.inner.status.lock().unwrap() = UaStatus::UserClosed;

        // give in-flight BYEs and the unregister a moment to flush
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.inner.core.live_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.inner.registrator.lock().unwrap().take();
        self.inner.transport.shutdown().await;
        self.inner.cancel_token.cancel();
    }

    pub fn status(&self) -> UaStatus {
        *self.inner.status.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == UaStatus::Ready
    }

    pub fn is_registered(&self) -> bool {
        self.inner
            .registrator
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.is_registered())
            .unwrap_or(false)
    }

    /// Take the UA event stream. First caller wins.
    pub fn take_events(&self) -> Option<UaEventReceiver> {
        self.inner.event_receiver.lock().unwrap().take()
    }

    /// STUN/TURN configuration for the media engine; the signalling
    /// core only carries it.
    pub fn ice_servers(&self) -> (&[String], &[crate::config::TurnServerConfig]) {
        (
            &self.inner.settings.config.stun_servers,
            &self.inner.settings.config.turn_servers,
        )
    }

    /// Place an outgoing call.
    pub async fn call(
        &self,
        target: &str,
        media: Arc<dyn MediaSession>,
        options: CallOptions,
    ) -> Result<InviteSession> {
        if self.status() != UaStatus::Ready {
            return Err(Error::NotReady("transport is not connected".to_string()));
        }
        let target = self.inner.normalize_target(target)?;
        SessionInner::connect(self.inner.clone(), target, media, options).await
    }

    /// Fire-and-forget MESSAGE; resolves on the final response.
    pub async fn send_message(
        &self,
        target: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        if self.status() != UaStatus::Ready {
            return Err(Error::NotReady("transport is not connected".to_string()));
        }
        message::send_message(&self.inner, target, body, content_type).await
    }

    pub async fn register(&self) -> Result<()> {
        let registrator = self
            .inner
            .registrator
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::NotReady("user agent is closed".to_string()))?;
        registrator.register().await
    }

    pub async fn unregister(&self, all: bool) -> Result<()> {
        let registrator = self
            .inner
            .registrator
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::NotReady("user agent is closed".to_string()))?;
        registrator.unregister(all).await
    }
}

impl UserAgentInner {
    pub(crate) fn emit(&self, event: UaEvent) {
        self.event_sender.send(event).ok();
    }

    pub(crate) fn status(&self) -> UaStatus {
        *self.status.lock().unwrap()
    }

    pub(crate) fn is_user_closed(&self) -> bool {
        self.status() == UaStatus::UserClosed
    }

    pub(crate) fn user_agent(&self) -> &str {
        &self.settings.config.user_agent
    }

    pub(crate) fn credential(&self) -> Option<crate::auth::Credential> {
        self.settings.credential()
    }

    /// Session contact: the GRUU once registration handed one out,
    /// else the generated `.invalid` contact.
    pub(crate) fn contact_uri(&self) -> rsip::Uri {
        self.gruu
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.settings.contact_uri.clone())
    }

    pub(crate) fn set_gruu(&self, uri: rsip::Uri) {
        info!("adopting GRUU contact: {}", uri);
        self.gruu.lock().unwrap().replace(uri);
    }

    pub(crate) fn has_gruu(&self) -> bool {
        self.gruu.lock().unwrap().is_some()
    }

    /// Via for a fresh out-of-dialog request.
    pub(crate) fn via(&self) -> rsip::typed::Via {
        let transport = if self.settings.config.hack_via_tcp {
            rsip::transport::Transport::Tcp
        } else {
            rsip::transport::Transport::Wss
        };
        rsip::typed::Via {
            version: rsip::Version::V2,
            transport,
            uri: rsip::Uri {
                host_with_port: rsip::Domain::from(self.settings.via_host.clone()).into(),
                ..Default::default()
            },
            params: vec![make_via_branch()],
        }
    }

    /// Build an out-of-dialog request (REGISTER, MESSAGE, OPTIONS).
    pub(crate) fn create_request(
        &self,
        method: rsip::Method,
        ruri: rsip::Uri,
        to_uri: rsip::Uri,
        from_tag: &str,
        call_id: &str,
        cseq: u32,
        extra_headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Request {
        let mut headers: Vec<Header> = vec![
            Header::Via(self.via().into()),
            Header::MaxForwards(70.into()),
            Header::To(
                rsip::typed::To {
                    display_name: None,
                    uri: to_uri,
                    params: vec![],
                }
                .into(),
            ),
            Header::From(
                rsip::typed::From {
                    display_name: self.settings.config.display_name.clone().map(Into::into),
                    uri: self.settings.uri.clone(),
                    params: vec![],
                }
                .with_tag(from_tag.into())
                .into(),
            ),
            Header::CallId(call_id.to_string().into()),
            Header::CSeq(rsip::typed::CSeq { seq: cseq, method: method.clone() }.into()),
        ];
        for route in &self.settings.routes {
            headers.push(Header::Route(format!("<{}>", route).into()));
        }
        headers.push(Header::UserAgent(self.user_agent().to_string().into()));
        for header in extra_headers {
            headers.push(header);
        }
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        Request {
            method,
            uri: ruri,
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        }
    }

    /// Normalize a user-supplied target into a SIP URI.
    pub(crate) fn normalize_target(&self, target: &str) -> Result<rsip::Uri> {
        let target = target.trim();
        if target.is_empty() {
            return Err(Error::InvalidTarget("empty target".to_string()));
        }
        let lower = target.to_ascii_lowercase();
        let candidate = if lower.starts_with("sip:") || lower.starts_with("sips:") {
            target.to_string()
        } else if target.contains('@') {
            format!("sip:{}", target)
        } else {
            format!("sip:{}@{}", target, self.settings.domain)
        };
        rsip::Uri::try_from(candidate.as_str())
            .map_err(|e| Error::InvalidTarget(format!("{}: {}", target, e)))
    }

    // ------------------------------------------------------------------
    // registries
    // ------------------------------------------------------------------

    pub(crate) fn add_session(&self, id: &str, session: InviteSession) {
        self.sessions
            .write()
            .unwrap()
            .insert(id.to_string(), session);
    }

    pub(crate) fn remove_session(&self, id: &str) {
        self.sessions.write().unwrap().remove(id);
    }

    pub(crate) fn get_session(&self, id: &str) -> Option<InviteSession> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    /// §4.8: `(call_id, from_tag)` first, then `(call_id, to_tag)`.
    pub(crate) fn find_session(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: Option<&str>,
    ) -> Option<InviteSession> {
        let sessions = self.sessions.read().unwrap();
        if let Some(session) = sessions.get(&format!("{}{}", call_id, from_tag)) {
            return Some(session.clone());
        }
        if let Some(to_tag) = to_tag {
            if let Some(session) = sessions.get(&format!("{}{}", call_id, to_tag)) {
                return Some(session.clone());
            }
        }
        None
    }

    pub(crate) fn add_dialog(&self, id: &DialogId, session_id: &str) {
        self.dialogs
            .write()
            .unwrap()
            .insert(id.clone(), session_id.to_string());
    }

    pub(crate) fn remove_dialog(&self, id: &DialogId) {
        self.dialogs.write().unwrap().remove(id);
    }

    pub(crate) fn find_session_by_dialog(&self, id: &DialogId) -> Option<InviteSession> {
        let session_id = self.dialogs.read().unwrap().get(id).cloned()?;
        self.get_session(&session_id)
    }

    /// `Replaces: call-id;to-tag=a;from-tag=b` -> owning session id.
    pub(crate) fn find_session_by_replaces(&self, replaces: &str) -> Option<String> {
        let mut parts = replaces.split(';');
        let call_id = parts.next()?.trim().to_string();
        let mut to_tag = None;
        let mut from_tag = None;
        for part in parts {
            let mut kv = part.trim().splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some(key), Some(value)) if key.eq_ignore_ascii_case("to-tag") => {
                    to_tag = Some(value.to_string());
                }
                (Some(key), Some(value)) if key.eq_ignore_ascii_case("from-tag") => {
                    from_tag = Some(value.to_string());
                }
                _ => {}
            }
        }
        let id = DialogId {
            call_id,
            local_tag: to_tag?,
            remote_tag: from_tag?,
        };
        self.dialogs.read().unwrap().get(&id).cloned()
    }

    // ------------------------------------------------------------------
    // transport events
    // ------------------------------------------------------------------

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                {
                    let mut status = self.status.lock().unwrap();
                    if *status != UaStatus::UserClosed {
                        *status = UaStatus::Ready;
                    }
                }
                self.emit(UaEvent::Connected);
                let registrator = self.registrator.lock().unwrap().clone();
                if let Some(registrator) = registrator {
                    registrator.on_transport_connected();
                }
            }
            TransportEvent::Closed(error) => {
                {
                    let mut status = self.status.lock().unwrap();
                    if *status != UaStatus::UserClosed {
                        *status = UaStatus::NotReady;
                    }
                }
                let description = error
                    .clone()
                    .unwrap_or_else(|| "connection closed".to_string());
                self.core.on_transport_error(&description);
                let registrator = self.registrator.lock().unwrap().clone();
                if let Some(registrator) = registrator {
                    registrator.on_transport_closed();
                }
                // without a globally routable contact, confirmed
                // sessions cannot survive a new flow
                if !self.has_gruu() {
                    let sessions: Vec<InviteSession> =
                        self.sessions.read().unwrap().values().cloned().collect();
                    for session in sessions {
                        session.inner.on_transport_closed().await;
                    }
                }
                self.emit(UaEvent::Disconnected { error });
            }
            TransportEvent::Error(error) => {
                debug!("transport attempt failed: {}", error);
                self.emit(UaEvent::Disconnected { error: Some(error) });
            }
            TransportEvent::Message(msg) => {
                match self.core.handle_message(msg).await {
                    Ok(Some(rsip::SipMessage::Request(request))) => {
                        dispatcher::dispatch_request(self, request).await;
                    }
                    Ok(Some(rsip::SipMessage::Response(response))) => {
                        dispatcher::dispatch_stray_response(self, response);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("unroutable message: {}", e);
                    }
                }
            }
        }
    }
}

/// Build a response mirroring the request per RFC 3261 §8.2.6: Via,
/// From, To (tagged unless 100), Call-ID, CSeq and Record-Route copy
/// over; status line and extra headers are ours.
pub(crate) fn make_response(
    request: &Request,
    status: StatusCode,
    to_tag: Option<&str>,
    extra_headers: Vec<Header>,
    body: Option<Vec<u8>>,
) -> Response {
    use rsip::prelude::ToTypedHeader;

    let mut headers = rsip::Headers::default();
    for header in request.headers.iter() {
        match header {
            Header::Via(h) => headers.push(Header::Via(h.clone())),
            Header::From(h) => headers.push(Header::From(h.clone())),
            Header::CallId(h) => headers.push(Header::CallId(h.clone())),
            Header::CSeq(h) => headers.push(Header::CSeq(h.clone())),
            Header::RecordRoute(h) => headers.push(Header::RecordRoute(h.clone())),
            Header::To(h) => {
                let wants_tag = to_tag.is_some() && status != StatusCode::Trying;
                let tagged = if wants_tag {
                    match h.typed() {
                        Ok(typed)
                            if !typed.params.iter().any(|p| matches!(p, rsip::Param::Tag(_))) =>
                        {
                            Header::To(typed.with_tag(to_tag.unwrap().into()).into())
                        }
                        _ => Header::To(h.clone()),
                    }
                } else {
                    Header::To(h.clone())
                };
                headers.push(tagged);
            }
            _ => {}
        }
    }
    for header in extra_headers {
        headers.push(header);
    }
    headers.push(Header::ContentLength(
        body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
    ));
    Response {
        status_code: status,
        headers,
        body: body.unwrap_or_default(),
        version: request.version.clone(),
    }
}
