use super::{
    AnswerOptions, CallOptions, Direction, InviteSession, PendingPostAck, SessionInner,
    SessionStatus, SessionTimerHandles, TerminateOptions,
};
use crate::{
    dialog::Dialog,
    media::MediaSession,
    rsip_ext::header_value,
    session::{dtmf, refer, timers},
    transaction::{
        make_call_id, make_tag,
        sender::{RequestSender, TransactionUser},
        transaction::Transaction,
        TransactionState, T1, T2, TIMER_H,
    },
    ua::{
        events::{Cause, Originator, SdpType, SessionEvent, UaEvent},
        make_response, UserAgentInner, ALLOWED_METHODS, SUPPORTED_EXTENSIONS,
    },
    Error, Result,
};
use async_trait::async_trait;
use rand::Rng;
use rsip::{
    prelude::{HasHeaders, HeadersExt, UntypedHeader},
    Header, Method, Request, Response, StatusCode, StatusCodeKind,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn new_session_inner(
    ua: Arc<UserAgentInner>,
    direction: Direction,
    call_id: String,
    from_tag: String,
    local_identity: String,
    remote_identity: String,
) -> Arc<SessionInner> {
    let (event_sender, event_receiver) = unbounded_channel();
    Arc::new(SessionInner {
        id: format!("{}{}", call_id, from_tag),
        direction,
        contact: ua.contact_uri(),
        ua,
        status: Mutex::new(SessionStatus::Null),
        call_id,
        from_tag,
        to_tag: Mutex::new(None),
        local_identity,
        remote_identity: Mutex::new(remote_identity),
        dialog: Mutex::new(None),
        early_dialogs: Mutex::new(HashMap::new()),
        media: Mutex::new(None),
        audio_muted: AtomicBool::new(false),
        video_muted: AtomicBool::new(false),
        local_hold: AtomicBool::new(false),
        remote_hold: AtomicBool::new(false),
        is_canceled: AtomicBool::new(false),
        received_100: AtomicBool::new(false),
        is_confirmed: AtomicBool::new(false),
        late_sdp: AtomicBool::new(false),
        rtc_ready: AtomicBool::new(true),
        end_event_emitted: AtomicBool::new(false),
        invite_request: Mutex::new(None),
        remote_offer: Mutex::new(None),
        cancel_reason: Mutex::new(None),
        cancel_sent: AtomicBool::new(false),
        server_invite: Mutex::new(None),
        pending_post_ack: Mutex::new(None),
        replaces: Mutex::new(None),
        timers: Mutex::new(SessionTimerHandles::new()),
        session_timer: Mutex::new(timers::SessionTimerState::new()),
        dtmf: Mutex::new(dtmf::DtmfQueue::new()),
        refer: Mutex::new(refer::ReferState::new()),
        event_sender,
        event_receiver: Mutex::new(Some(event_receiver)),
        cancel_token: CancellationToken::new(),
    })
}

/// Applicant adapter: routes responses to the outgoing-INVITE state
/// machine.
struct InviteApplicant {
    session: Arc<SessionInner>,
}

#[async_trait]
impl TransactionUser for InviteApplicant {
    async fn receive_response(&self, response: Response) {
        self.session.receive_invite_response(response).await;
    }

    async fn on_request_timeout(&self) {
        let session = &self.session;
        session
            .emit_failed(Originator::System, Cause::RequestTimeout, None);
        session.close().await;
    }

    async fn on_transport_error(&self, _error: String) {
        let session = &self.session;
        session
            .emit_failed(Originator::System, Cause::ConnectionError, None);
        session.close().await;
    }
}

/// Fire-and-forget applicant for BYE/CANCEL/INFO where the session
/// has already decided its fate. Still allocates digest-replay CSeq
/// from the dialog so the counter never falls behind the wire.
struct QuietApplicant {
    session: Arc<SessionInner>,
}

#[async_trait]
impl TransactionUser for QuietApplicant {
    async fn receive_response(&self, _response: Response) {}
    async fn on_request_timeout(&self) {}
    async fn on_transport_error(&self, _error: String) {}
    fn next_cseq_for_retry(&self) -> Option<u32> {
        self.session.dialog().map(|d| d.next_local_seq())
    }
}

impl SessionInner {
    // ---------------------------------------------------------------
    // outgoing
    // ---------------------------------------------------------------

    /// Place an outgoing call: build the INVITE, generate the local
    /// offer, dispatch, and drive the responses.
    pub(crate) async fn connect(
        ua: Arc<UserAgentInner>,
        target: rsip::Uri,
        media: Arc<dyn MediaSession>,
        options: CallOptions,
    ) -> Result<InviteSession> {
        let call_id = make_call_id(&ua.settings.via_host).value().to_string();
        let from_tag = make_tag().to_string();
        let local_identity = ua.settings.uri.to_string();
        let inner = new_session_inner(
            ua.clone(),
            Direction::Outgoing,
            call_id.clone(),
            from_tag.clone(),
            local_identity,
            target.to_string(),
        );
        let session = InviteSession {
            inner: inner.clone(),
        };
        ua.add_session(&inner.id, session.clone());

        inner.media.lock().unwrap().replace(media.clone());
        inner.emit(SessionEvent::Peerconnection);

        let offer = match media.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                inner.emit_failed(Originator::Local, Cause::WebrtcError, None);
                inner.close().await;
                return Err(e);
            }
        };
        if let Err(e) = media.set_local(offer.clone()).await {
            inner.emit_failed(Originator::Local, Cause::WebrtcError, None);
            inner.close().await;
            return Err(e);
        }
        inner.emit(SessionEvent::Sdp {
            originator: Originator::Local,
            sdp_type: SdpType::Offer,
            sdp: offer.clone(),
        });

        let request = inner.build_invite(&target, &options, offer.into_bytes())?;
        inner.invite_request.lock().unwrap().replace(request.clone());

        inner.set_status(SessionStatus::InviteSent);
        ua.emit(UaEvent::NewSession {
            session: session.clone(),
            originator: Originator::Local,
        });
        inner.emit(SessionEvent::Connecting);

        let applicant = Arc::new(InviteApplicant {
            session: inner.clone(),
        });
        RequestSender::new(
            ua.core.clone(),
            request,
            applicant,
            ua.credential(),
            ua.is_user_closed(),
        )
        .spawn();

        Ok(session)
    }

    fn build_invite(
        &self,
        target: &rsip::Uri,
        options: &CallOptions,
        body: Vec<u8>,
    ) -> Result<Request> {
        let settings = &self.ua.settings;
        let mut headers: Vec<Header> = vec![
            Header::Via(self.ua.via().into()),
            Header::MaxForwards(70.into()),
            Header::To(
                rsip::typed::To {
                    display_name: None,
                    uri: target.clone(),
                    params: vec![],
                }
                .into(),
            ),
        ];

        let from = if options.anonymous {
            rsip::typed::From {
                display_name: Some("Anonymous".into()),
                uri: rsip::Uri::try_from("sip:anonymous@anonymous.invalid")?,
                params: vec![],
            }
        } else {
            rsip::typed::From {
                display_name: settings.config.display_name.clone().map(Into::into),
                uri: settings.uri.clone(),
                params: vec![],
            }
        }
        .with_tag(self.from_tag.clone().into());
        headers.push(Header::From(from.into()));

        headers.push(Header::CallId(self.call_id.clone().into()));
        headers.push(Header::CSeq(
            rsip::typed::CSeq {
                seq: rand::rng().random_range(1..10000),
                method: Method::Invite,
            }
            .into(),
        ));
        headers.push(rsip::typed::Contact::from(self.contact.clone()).into());
        headers.push(Header::Allow(ALLOWED_METHODS.into()));
        headers.push(Header::Supported(SUPPORTED_EXTENSIONS.into()));
        for route in &settings.routes {
            headers.push(Header::Route(format!("<{}>", route).into()));
        }
        if settings.config.session_timers {
            headers.push(Header::Other(
                "Session-Expires".into(),
                timers::DEFAULT_SESSION_EXPIRES.to_string(),
            ));
        }
        headers.push(Header::UserAgent(self.ua.user_agent().to_string().into()));
        for header in &options.extra_headers {
            headers.push(header.clone());
        }
        headers.push(Header::ContentType("application/sdp".into()));
        headers.push(Header::ContentLength((body.len() as u32).into()));

        Ok(Request {
            method: Method::Invite,
            uri: target.clone(),
            headers: headers.into(),
            body,
            version: rsip::Version::V2,
        })
    }

    /// Responses to the outgoing INVITE.
    pub(crate) async fn receive_invite_response(self: &Arc<Self>, response: Response) {
        let status_code = response.status_code.code();
        debug!(id = %self.id, status_code, "invite response");

        match response.status_code.kind() {
            StatusCodeKind::Provisional => {
                if status_code == 100 {
                    self.received_100.store(true, Ordering::Relaxed);
                }
                if self.status() == SessionStatus::InviteSent {
                    self.set_status(SessionStatus::Progress1xx);
                }

                // a buffered terminate() fires the real CANCEL on the
                // first provisional
                if self.is_canceled.load(Ordering::Relaxed) {
                    self.send_pending_cancel().await;
                    return;
                }
                if status_code == 100 {
                    return;
                }

                if let Ok(Some(tag)) = response.to_header().and_then(|to| to.tag()) {
                    if response.contact_header().is_ok() {
                        self.create_early_dialog(&response, tag.value());
                    }
                }
                if !response.body.is_empty() {
                    // early media: remote answer without confirming
                    if let Ok(sdp) = String::from_utf8(response.body.clone()) {
                        if let Some(media) = self.media() {
                            media.set_remote(sdp.clone()).await.ok();
                            self.emit(SessionEvent::Sdp {
                                originator: Originator::Remote,
                                sdp_type: SdpType::Answer,
                                sdp,
                            });
                        }
                    }
                }
                self.emit(SessionEvent::Progress {
                    originator: Originator::Remote,
                    response: Some(response),
                });
            }
            StatusCodeKind::Successful => {
                self.receive_invite_2xx(response).await;
            }
            _ => {
                let cause = if self.is_canceled.load(Ordering::Relaxed)
                    && status_code == 487
                {
                    Cause::Canceled
                } else {
                    Cause::from_status(status_code)
                };
                let originator = if cause == Cause::Canceled {
                    Originator::Local
                } else {
                    Originator::Remote
                };
                self.emit_failed(originator, cause, Some(response));
                self.close().await;
            }
        }
    }

    async fn receive_invite_2xx(self: &Arc<Self>, response: Response) {
        // user already hung up: accept, ACK, BYE
        if self.is_canceled.load(Ordering::Relaxed) {
            self.accept_and_terminate(&response).await;
            self.emit_failed(Originator::Local, Cause::Canceled, None);
            self.close().await;
            return;
        }

        let to_tag = match response.to_header().and_then(|to| to.tag()) {
            Ok(Some(tag)) => tag.value().to_string(),
            _ => {
                warn!(id = %self.id, "2xx without to tag, dropping");
                return;
            }
        };

        if self.is_confirmed.load(Ordering::Relaxed) {
            let dialog = self.dialog();
            match dialog {
                Some(dialog) if dialog.id().remote_tag == to_tag => {
                    // retransmitted 2xx: re-ACK, no re-emitted events
                    self.send_ack(&dialog).await;
                }
                _ => {
                    // forked leg answering late: shut it down
                    self.accept_and_terminate(&response).await;
                }
            }
            return;
        }

        if response.body.is_empty() && !self.late_sdp.load(Ordering::Relaxed) {
            self.accept_and_terminate(&response).await;
            self.emit_failed(
                Originator::Remote,
                Cause::BadMediaDescription,
                Some(response),
            );
            self.close().await;
            return;
        }

        // promote a matching early dialog, or mint the confirmed one
        let invite = self.invite_request.lock().unwrap().clone();
        let invite = match invite {
            Some(invite) => invite,
            None => return,
        };
        let dialog = {
            let early = self.early_dialogs.lock().unwrap().remove(&to_tag);
            match early {
                Some(dialog) => {
                    dialog.confirm();
                    dialog
                }
                None => match Dialog::new_uac(&invite, &response, &self.ua.settings.via_host) {
                    Ok(dialog) => Arc::new(dialog),
                    Err(e) => {
                        warn!(id = %self.id, "cannot create dialog: {}", e);
                        self.emit_failed(Originator::System, Cause::InternalError, None);
                        self.close().await;
                        return;
                    }
                },
            }
        };
        self.dialog.lock().unwrap().replace(dialog.clone());
        self.to_tag.lock().unwrap().replace(to_tag);
        self.ua.add_dialog(&dialog.id(), &self.id);

        let answer = String::from_utf8(response.body.clone()).unwrap_or_default();
        if let Some(media) = self.media() {
            if let Err(e) = media.set_remote(answer.clone()).await {
                warn!(id = %self.id, "remote description rejected: {}", e);
                self.send_ack(&dialog).await;
                self.send_bye_with_reason(&dialog, 488, "Not Acceptable Here").await;
                self.emit_failed(
                    Originator::Remote,
                    Cause::BadMediaDescription,
                    Some(response),
                );
                self.close().await;
                return;
            }
            self.emit(SessionEvent::Sdp {
                originator: Originator::Remote,
                sdp_type: SdpType::Answer,
                sdp: answer,
            });
        }

        timers::on_uac_final_response(self, &response);

        self.send_ack(&dialog).await;
        self.is_confirmed.store(true, Ordering::Relaxed);
        self.set_status(SessionStatus::Confirmed);
        self.emit(SessionEvent::Accepted {
            originator: Originator::Remote,
            response: Some(response),
        });
        self.emit(SessionEvent::Confirmed);
        self.on_confirmed().await;
    }

    /// ACK for a 2xx: its own transaction, routed by the dialog.
    pub(crate) async fn send_ack(&self, dialog: &Arc<Dialog>) {
        match dialog.create_request(Method::Ack, vec![], None, &self.contact, self.ua.user_agent())
        {
            Ok(ack) => {
                self.ua.core.transport.send(ack.into()).await.ok();
            }
            Err(e) => warn!(id = %self.id, "cannot build ACK: {}", e),
        }
    }

    /// ACK a 2xx that arrived after the user gave up, then BYE the
    /// dialog it created.
    async fn accept_and_terminate(self: &Arc<Self>, response: &Response) {
        let invite = self.invite_request.lock().unwrap().clone();
        let invite = match invite {
            Some(invite) => invite,
            None => return,
        };
        if let Ok(dialog) = Dialog::new_uac(&invite, response, &self.ua.settings.via_host) {
            let dialog = Arc::new(dialog);
            self.send_ack(&dialog).await;
            self.send_bye_with_reason(&dialog, 487, "Request Terminated").await;
        }
    }

    async fn send_bye_with_reason(self: &Arc<Self>, dialog: &Arc<Dialog>, cause: u16, text: &str) {
        let reason = Header::Other(
            "Reason".into(),
            format!("SIP;cause={};text=\"{}\"", cause, text),
        );
        match dialog.create_request(
            Method::Bye,
            vec![reason],
            None,
            &self.contact,
            self.ua.user_agent(),
        ) {
            Ok(bye) => {
                RequestSender::new(
                    self.ua.core.clone(),
                    bye,
                    Arc::new(QuietApplicant {
                        session: self.clone(),
                    }),
                    self.ua.credential(),
                    false,
                )
                .spawn();
            }
            Err(e) => warn!(id = %self.id, "cannot build BYE: {}", e),
        }
    }

    fn create_early_dialog(self: &Arc<Self>, response: &Response, to_tag: &str) {
        let mut early = self.early_dialogs.lock().unwrap();
        if early.contains_key(to_tag) {
            return;
        }
        let invite = self.invite_request.lock().unwrap().clone();
        if let Some(invite) = invite {
            match Dialog::new_uac(&invite, response, &self.ua.settings.via_host) {
                Ok(dialog) => {
                    let dialog = Arc::new(dialog);
                    self.ua.add_dialog(&dialog.id(), &self.id);
                    early.insert(to_tag.to_string(), dialog);
                }
                Err(e) => debug!(id = %self.id, "early dialog skipped: {}", e),
            }
        }
    }

    /// The CANCEL buffered by `terminate()` before any provisional.
    async fn send_pending_cancel(self: &Arc<Self>) {
        if self.cancel_sent.swap(true, Ordering::Relaxed) {
            return;
        }
        let invite = self.invite_request.lock().unwrap().clone();
        let invite = match invite {
            Some(invite) => invite,
            None => return,
        };
        let reason = self.cancel_reason.lock().unwrap().clone();
        let cancel = build_cancel(&invite, reason.as_deref());
        RequestSender::new(
            self.ua.core.clone(),
            cancel,
            Arc::new(QuietApplicant {
                session: self.clone(),
            }),
            self.ua.credential(),
            false,
        )
        .spawn();
    }

    // ---------------------------------------------------------------
    // incoming
    // ---------------------------------------------------------------

    /// Accept an inbound INVITE transaction from the dispatcher and
    /// start ringing.
    pub(crate) async fn new_incoming(
        ua: Arc<UserAgentInner>,
        mut tx: Transaction,
    ) -> Result<InviteSession> {
        let request = tx.original.clone();
        tx.respond(make_response(&request, StatusCode::Trying, None, vec![], None))
            .await
            .ok();

        // an offer, when present, must be SDP
        let has_body = !request.body.is_empty();
        if has_body {
            let content_type = header_value(request.headers(), "Content-Type")
                .unwrap_or_default()
                .to_lowercase();
            if !content_type.contains("application/sdp") {
                tx.respond(make_response(
                    &request,
                    StatusCode::UnsupportedMediaType,
                    None,
                    vec![],
                    None,
                ))
                .await
                .ok();
                return Err(Error::NotSupported("INVITE body is not SDP".to_string()));
            }
        }

        let call_id = request.call_id_header()?.value().to_string();
        let remote_tag = request
            .from_header()?
            .tag()?
            .map(|t| t.value().to_string())
            .unwrap_or_default();
        let local_tag = make_tag().to_string();

        let remote_identity = request.from_header()?.value().to_string();
        let local_identity = request.to_header()?.value().to_string();

        let inner = new_session_inner(
            ua.clone(),
            Direction::Incoming,
            call_id,
            remote_tag,
            local_identity,
            remote_identity,
        );
        inner.to_tag.lock().unwrap().replace(local_tag.clone());
        inner.late_sdp.store(!has_body, Ordering::Relaxed);
        if has_body {
            inner
                .remote_offer
                .lock()
                .unwrap()
                .replace(String::from_utf8(request.body.clone()).unwrap_or_default());
        }
        inner.invite_request.lock().unwrap().replace(request.clone());

        let dialog = match Dialog::new_uas(&request, &local_tag, &ua.settings.via_host) {
            Ok(dialog) => Arc::new(dialog),
            Err(e) => {
                tx.respond(make_response(
                    &request,
                    StatusCode::BadRequest,
                    None,
                    vec![],
                    None,
                ))
                .await
                .ok();
                return Err(e);
            }
        };
        ua.add_dialog(&dialog.id(), &inner.id);
        inner.dialog.lock().unwrap().replace(dialog);

        // Replaces: remember whom we substitute
        if let Some(replaces) = header_value(request.headers(), "Replaces") {
            if let Some(target) = ua.find_session_by_replaces(&replaces) {
                inner.replaces.lock().unwrap().replace(target);
            }
        }

        inner.set_status(SessionStatus::WaitingForAnswer);
        let session = InviteSession {
            inner: inner.clone(),
        };
        ua.add_session(&inner.id, session.clone());

        // ring
        let ringing = make_response(
            &request,
            StatusCode::Ringing,
            Some(&local_tag),
            vec![rsip::typed::Contact::from(inner.contact.clone()).into()],
            None,
        );
        tx.respond(ringing).await.ok();
        inner.server_invite.lock().unwrap().replace(tx);

        inner.start_no_answer_timer();
        inner.start_expires_timer(&request);

        match inner.replaces.lock().unwrap().clone() {
            Some(old_id) => {
                if let Some(old) = ua.get_session(&old_id) {
                    old.inner.emit(SessionEvent::Replaces {
                        session: session.clone(),
                    });
                }
            }
            None => {
                ua.emit(UaEvent::NewSession {
                    session: session.clone(),
                    originator: Originator::Remote,
                });
            }
        }
        Ok(session)
    }

    fn start_no_answer_timer(self: &Arc<Self>) {
        let wait = Duration::from_secs(self.ua.settings.config.no_answer_timeout);
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if inner.status() == SessionStatus::WaitingForAnswer {
                info!(id = %inner.id, "no answer after {:?}", wait);
                inner.reply_to_invite(StatusCode::RequestTimeout, None).await;
                inner.emit_failed(Originator::Local, Cause::NoAnswer, None);
                inner.close().await;
            }
        });
        self.timers.lock().unwrap().no_answer = Some(handle);
    }

    fn start_expires_timer(self: &Arc<Self>, request: &Request) {
        let expires = header_value(request.headers(), "Expires")
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(expires) = expires {
            let inner = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(expires)).await;
                if inner.status() == SessionStatus::WaitingForAnswer {
                    inner
                        .reply_to_invite(StatusCode::RequestTerminated, None)
                        .await;
                    inner.emit_failed(Originator::System, Cause::Expires, None);
                    inner.close().await;
                }
            });
            self.timers.lock().unwrap().expires = Some(handle);
        }
    }

    /// Respond on the held INVITE server transaction.
    async fn reply_to_invite(&self, status: StatusCode, body: Option<(Vec<Header>, Vec<u8>)>) {
        let tx = self.server_invite.lock().unwrap().take();
        if let Some(mut tx) = tx {
            let request = tx.original.clone();
            let to_tag = self.to_tag.lock().unwrap().clone().unwrap_or_default();
            let (headers, body) = match body {
                Some((headers, body)) => (headers, Some(body)),
                None => (vec![], None),
            };
            let is_provisional = status.kind() == StatusCodeKind::Provisional;
            let response = make_response(&request, status, Some(&to_tag), headers, body);
            if is_provisional {
                tx.respond(response).await.ok();
                self.server_invite.lock().unwrap().replace(tx);
            } else {
                tx.respond(response).await.ok();
                if tx.state == TransactionState::Completed {
                    // non-2xx: absorb the ACK in the background
                    tokio::spawn(async move { while tx.receive().await.is_some() {} });
                }
            }
        }
    }

    /// Answer the ringing call.
    pub(crate) async fn answer(self: &Arc<Self>, options: AnswerOptions) -> Result<()> {
        if self.direction != Direction::Incoming {
            return Err(Error::NotSupported(
                "answer() only applies to inbound sessions".to_string(),
            ));
        }
        if self.status() != SessionStatus::WaitingForAnswer {
            return Err(Error::InvalidState(format!(
                "cannot answer in state {:?}",
                self.status()
            )));
        }
        self.set_status(SessionStatus::Answered);
        {
            let mut timers = self.timers.lock().unwrap();
            if let Some(h) = timers.no_answer.take() {
                h.abort();
            }
            if let Some(h) = timers.expires.take() {
                h.abort();
            }
        }

        let media = options.media.clone();
        self.media.lock().unwrap().replace(media.clone());
        self.emit(SessionEvent::Peerconnection);

        let late_sdp = self.late_sdp.load(Ordering::Relaxed);
        let sdp = if late_sdp {
            // late offer: our 200 carries the offer, answer comes in
            // the ACK
            let offer = media.create_offer().await?;
            media.set_local(offer.clone()).await?;
            self.emit(SessionEvent::Sdp {
                originator: Originator::Local,
                sdp_type: SdpType::Offer,
                sdp: offer.clone(),
            });
            offer
        } else {
            let offer = self.remote_offer.lock().unwrap().clone().unwrap_or_default();
            media.set_remote(offer.clone()).await.map_err(|e| {
                Error::Media(format!("remote offer rejected: {}", e))
            })?;
            self.emit(SessionEvent::Sdp {
                originator: Originator::Remote,
                sdp_type: SdpType::Offer,
                sdp: offer,
            });
            let answer = media.create_answer().await?;
            media.set_local(answer.clone()).await?;
            self.emit(SessionEvent::Sdp {
                originator: Originator::Local,
                sdp_type: SdpType::Answer,
                sdp: answer.clone(),
            });
            answer
        };

        let request = self
            .invite_request
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::InvalidState("no INVITE on record".to_string()))?;
        let mut headers: Vec<Header> = vec![
            rsip::typed::Contact::from(self.contact.clone()).into(),
            Header::Allow(ALLOWED_METHODS.into()),
            Header::ContentType("application/sdp".into()),
        ];
        if let Some(se) = timers::on_uas_answer(self, &request) {
            headers.push(se);
        }
        for header in options.extra_headers {
            headers.push(header);
        }

        let to_tag = self.to_tag.lock().unwrap().clone().unwrap_or_default();
        let ok = make_response(
            &request,
            StatusCode::OK,
            Some(&to_tag),
            headers,
            Some(sdp.into_bytes()),
        );

        self.reply_to_invite_with(ok.clone()).await;
        self.set_status(SessionStatus::WaitingForAck);
        self.start_2xx_retransmission(ok);
        Ok(())
    }

    async fn reply_to_invite_with(&self, response: Response) {
        let tx = self.server_invite.lock().unwrap().take();
        if let Some(mut tx) = tx {
            tx.respond(response).await.ok();
        }
    }

    /// §4.6.1: the 2xx retransmit discipline is session-owned. Start
    /// at T1, double to T2, give up at TIMER_H with BYE + NO_ACK.
    fn start_2xx_retransmission(self: &Arc<Self>, response: Response) {
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + TIMER_H;
            let mut interval = T1;
            loop {
                tokio::time::sleep(interval).await;
                if Instant::now() >= deadline {
                    warn!(id = %inner.id, "no ACK for 2xx");
                    if let Some(dialog) = inner.dialog() {
                        inner.send_bye_with_reason(&dialog, 408, "No ACK").await;
                    }
                    inner.emit_ended(Originator::System, Cause::NoAck);
                    inner.close().await;
                    return;
                }
                inner
                    .ua
                    .core
                    .transport
                    .send(response.clone().into())
                    .await
                    .ok();
                interval = (interval * 2).min(T2);
            }
        });
        self.timers.lock().unwrap().invite_2xx_retransmit = Some(handle);
    }

    /// ACK routed by the dispatcher.
    pub(crate) async fn receive_ack(self: &Arc<Self>, request: Request) {
        if self.status() == SessionStatus::Confirmed {
            // ACK for a re-INVITE 2xx: stop its retransmission
            if let Some(h) = self.timers.lock().unwrap().invite_2xx_retransmit.take() {
                h.abort();
            }
            return;
        }
        if self.status() != SessionStatus::WaitingForAck {
            return;
        }
        {
            let mut timers = self.timers.lock().unwrap();
            if let Some(h) = timers.invite_2xx_retransmit.take() {
                h.abort();
            }
            if let Some(h) = timers.ack_wait.take() {
                h.abort();
            }
        }

        if self.late_sdp.load(Ordering::Relaxed) {
            if request.body.is_empty() {
                info!(id = %self.id, "late-offer ACK without SDP answer");
                if let Some(dialog) = self.dialog() {
                    self.send_bye_with_reason(&dialog, 400, "Missing SDP").await;
                }
                self.emit_ended(Originator::Local, Cause::MissingSdp);
                self.close().await;
                return;
            }
            let answer = String::from_utf8(request.body.clone()).unwrap_or_default();
            if let Some(media) = self.media() {
                if media.set_remote(answer.clone()).await.is_err() {
                    if let Some(dialog) = self.dialog() {
                        self.send_bye_with_reason(&dialog, 488, "Not Acceptable Here")
                            .await;
                    }
                    self.emit_ended(Originator::Local, Cause::BadMediaDescription);
                    self.close().await;
                    return;
                }
                self.emit(SessionEvent::Sdp {
                    originator: Originator::Remote,
                    sdp_type: SdpType::Answer,
                    sdp: answer,
                });
            }
        }

        if let Some(dialog) = self.dialog() {
            dialog.confirm();
        }
        self.is_confirmed.store(true, Ordering::Relaxed);
        self.set_status(SessionStatus::Confirmed);
        self.emit(SessionEvent::Confirmed);
        self.on_confirmed().await;

        // a terminate() issued while waiting for this ACK
        let pending = self.pending_post_ack.lock().unwrap().take();
        if let Some(PendingPostAck::SendBye { extra_headers }) = pending {
            self.do_bye(extra_headers).await;
        }
    }

    /// CANCEL routed by the dispatcher.
    pub(crate) async fn receive_cancel(self: &Arc<Self>, mut cancel_tx: Transaction) {
        match self.status() {
            SessionStatus::WaitingForAnswer | SessionStatus::Answered => {}
            _ => {
                let resp = make_response(
                    &cancel_tx.original,
                    StatusCode::CallTransactionDoesNotExist,
                    None,
                    vec![],
                    None,
                );
                cancel_tx.respond(resp).await.ok();
                return;
            }
        }
        let ok = make_response(&cancel_tx.original, StatusCode::OK, None, vec![], None);
        cancel_tx.respond(ok).await.ok();
        self.reply_to_invite(StatusCode::RequestTerminated, None).await;
        self.set_status(SessionStatus::Canceled);
        self.emit_failed(Originator::Remote, Cause::Canceled, None);
        self.close().await;
    }

    async fn on_confirmed(self: &Arc<Self>) {
        timers::start(self);
        self.watch_media_events();

        // this session replaces another: the old one goes away now
        let replaced = self.replaces.lock().unwrap().take();
        if let Some(old_id) = replaced {
            if let Some(old) = self.ua.get_session(&old_id) {
                old.terminate(TerminateOptions::default()).await.ok();
            }
        }
    }

    fn watch_media_events(self: &Arc<Self>) {
        let events = self.media().and_then(|m| m.take_events());
        if let Some(mut events) = events {
            let inner = self.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    warn!(id = %inner.id, "media failure: {:?}", event);
                    if inner.status() == SessionStatus::Terminated {
                        break;
                    }
                    if let Some(dialog) = inner.dialog() {
                        inner.send_bye_with_reason(&dialog, 503, "Media Failure").await;
                    }
                    inner.emit_ended(Originator::System, Cause::WebrtcError);
                    inner.close().await;
                    break;
                }
            });
        }
    }

    // ---------------------------------------------------------------
    // in-dialog requests from the dispatcher
    // ---------------------------------------------------------------

    pub(crate) async fn receive_request(self: &Arc<Self>, mut tx: Transaction) {
        let request = tx.original.clone();
        if let Some(dialog) = self.dialog() {
            if let Ok(cseq) = request.cseq_header().and_then(|c| c.seq()) {
                if !dialog.check_remote_seq(cseq) {
                    let resp = make_response(
                        &request,
                        StatusCode::ServerInternalError,
                        None,
                        vec![],
                        None,
                    );
                    tx.respond(resp).await.ok();
                    return;
                }
            }
        }

        match request.method {
            Method::Bye => {
                let ok = make_response(&request, StatusCode::OK, None, vec![], None);
                tx.respond(ok).await.ok();
                self.emit_ended(Originator::Remote, Cause::Bye);
                self.close().await;
            }
            Method::Info => {
                self.receive_info(tx).await;
            }
            Method::Update => {
                self.receive_update(tx).await;
            }
            Method::Invite => {
                self.receive_reinvite(tx).await;
            }
            Method::Notify => {
                refer::receive_notify(self, tx).await;
            }
            Method::Refer => {
                refer::receive_refer(self, tx).await;
            }
            Method::Options => {
                let ok = make_response(
                    &request,
                    StatusCode::OK,
                    None,
                    vec![
                        Header::Allow(ALLOWED_METHODS.into()),
                        Header::Other("Accept".into(), "application/sdp".into()),
                    ],
                    None,
                );
                tx.respond(ok).await.ok();
            }
            Method::Ack => {
                self.receive_ack(request).await;
            }
            _ => {
                let resp = make_response(
                    &request,
                    StatusCode::MethodNotAllowed,
                    None,
                    vec![Header::Allow(ALLOWED_METHODS.into())],
                    None,
                );
                tx.respond(resp).await.ok();
            }
        }
    }

    async fn receive_info(self: &Arc<Self>, mut tx: Transaction) {
        let request = tx.original.clone();
        let content_type = header_value(request.headers(), "Content-Type");
        let ok = make_response(&request, StatusCode::OK, None, vec![], None);
        tx.respond(ok).await.ok();

        let is_dtmf = content_type
            .as_deref()
            .map(|ct| ct.to_lowercase().contains("application/dtmf-relay"))
            .unwrap_or(false);
        if is_dtmf {
            if let Some((tone, duration)) = dtmf::parse_dtmf_body(&request.body) {
                self.emit(SessionEvent::NewDtmf {
                    originator: Originator::Remote,
                    tone,
                    duration,
                });
                return;
            }
        }
        self.emit(SessionEvent::NewInfo {
            originator: Originator::Remote,
            content_type,
            body: request.body.clone(),
        });
    }

    async fn receive_update(self: &Arc<Self>, mut tx: Transaction) {
        let request = tx.original.clone();
        timers::on_refresh_request(self, &request);

        if request.body.is_empty() {
            let ok = make_response(
                &request,
                StatusCode::OK,
                None,
                vec![rsip::typed::Contact::from(self.contact.clone()).into()],
                None,
            );
            tx.respond(ok).await.ok();
            return;
        }

        let offer = String::from_utf8(request.body.clone()).unwrap_or_default();
        self.track_remote_hold(&offer);
        let answer = match self.process_remote_offer(offer).await {
            Ok(answer) => answer,
            Err(_) => {
                let resp =
                    make_response(&request, StatusCode::NotAcceptableHere, None, vec![], None);
                tx.respond(resp).await.ok();
                return;
            }
        };
        let ok = make_response(
            &request,
            StatusCode::OK,
            None,
            vec![
                rsip::typed::Contact::from(self.contact.clone()).into(),
                Header::ContentType("application/sdp".into()),
            ],
            Some(answer.into_bytes()),
        );
        tx.respond(ok).await.ok();
    }

    async fn receive_reinvite(self: &Arc<Self>, mut tx: Transaction) {
        let request = tx.original.clone();

        let dialog = match self.dialog() {
            Some(dialog) => dialog,
            None => return,
        };
        // glare: an exchange is already in flight on this dialog
        if dialog.uac_pending_reply() || !dialog.try_begin_uas_request() {
            let resp = make_response(&request, StatusCode::RequestPending, None, vec![], None);
            tx.respond(resp).await.ok();
            return;
        }

        timers::on_refresh_request(self, &request);

        let answer = if request.body.is_empty() {
            // late offer: 200 carries our offer
            match self.build_local_offer().await {
                Ok(offer) => offer,
                Err(_) => {
                    let resp = make_response(
                        &request,
                        StatusCode::NotAcceptableHere,
                        None,
                        vec![],
                        None,
                    );
                    tx.respond(resp).await.ok();
                    dialog.end_uas_request();
                    return;
                }
            }
        } else {
            let offer = String::from_utf8(request.body.clone()).unwrap_or_default();
            self.track_remote_hold(&offer);
            match self.process_remote_offer(offer).await {
                Ok(answer) => answer,
                Err(_) => {
                    let resp = make_response(
                        &request,
                        StatusCode::NotAcceptableHere,
                        None,
                        vec![],
                        None,
                    );
                    tx.respond(resp).await.ok();
                    dialog.end_uas_request();
                    return;
                }
            }
        };

        if let Some(contact) = request.contact_header().ok() {
            if let Ok(uri) = crate::rsip_ext::extract_uri_from_contact(contact.value()) {
                dialog.set_remote_target(uri);
            }
        }

        let to_tag = self.to_tag.lock().unwrap().clone().unwrap_or_default();
        let ok = make_response(
            &request,
            StatusCode::OK,
            Some(&to_tag),
            vec![
                rsip::typed::Contact::from(self.contact.clone()).into(),
                Header::ContentType("application/sdp".into()),
            ],
            Some(answer.into_bytes()),
        );
        tx.respond(ok.clone()).await.ok();
        self.start_2xx_retransmission(ok);
        dialog.end_uas_request();
    }

    /// Apply a remote re-offer and produce the local answer,
    /// mangling for hold when needed.
    async fn process_remote_offer(self: &Arc<Self>, offer: String) -> Result<String> {
        let media = self
            .media()
            .ok_or_else(|| Error::InvalidState("no media session".to_string()))?;
        self.rtc_ready.store(false, Ordering::Relaxed);
        let result = async {
            media.set_remote(offer.clone()).await?;
            self.emit(SessionEvent::Sdp {
                originator: Originator::Remote,
                sdp_type: SdpType::Offer,
                sdp: offer,
            });
            let mut answer = media.create_answer().await?;
            if self.local_hold.load(Ordering::Relaxed)
                || self.remote_hold.load(Ordering::Relaxed)
            {
                answer = super::hold::mangle_directions(
                    &answer,
                    self.local_hold.load(Ordering::Relaxed),
                    self.remote_hold.load(Ordering::Relaxed),
                );
            }
            media.set_local(answer.clone()).await?;
            self.emit(SessionEvent::Sdp {
                originator: Originator::Local,
                sdp_type: SdpType::Answer,
                sdp: answer.clone(),
            });
            Ok(answer)
        }
        .await;
        self.rtc_ready.store(true, Ordering::Relaxed);
        result
    }

    pub(crate) async fn build_local_offer(self: &Arc<Self>) -> Result<String> {
        let media = self
            .media()
            .ok_or_else(|| Error::InvalidState("no media session".to_string()))?;
        let mut offer = media.create_offer().await?;
        if self.local_hold.load(Ordering::Relaxed) || self.remote_hold.load(Ordering::Relaxed) {
            offer = super::hold::mangle_directions(
                &offer,
                self.local_hold.load(Ordering::Relaxed),
                self.remote_hold.load(Ordering::Relaxed),
            );
        }
        media.set_local(offer.clone()).await?;
        self.emit(SessionEvent::Sdp {
            originator: Originator::Local,
            sdp_type: SdpType::Offer,
            sdp: offer.clone(),
        });
        Ok(offer)
    }

    fn track_remote_hold(self: &Arc<Self>, offer: &str) {
        let held = super::hold::offer_requests_hold(offer);
        let was_held = self.remote_hold.load(Ordering::Relaxed);
        if held && !was_held {
            self.remote_hold.store(true, Ordering::Relaxed);
            self.emit(SessionEvent::Hold {
                originator: Originator::Remote,
            });
        } else if !held && was_held {
            self.remote_hold.store(false, Ordering::Relaxed);
            self.emit(SessionEvent::Unhold {
                originator: Originator::Remote,
            });
        }
    }

    /// INFO sender.
    pub(crate) async fn send_info(self: &Arc<Self>, content_type: &str, body: Vec<u8>) -> Result<()> {
        let dialog = self.require_dialog()?;
        let request = dialog.create_request(
            Method::Info,
            vec![Header::ContentType(content_type.to_string().into())],
            Some(body),
            &self.contact,
            self.ua.user_agent(),
        )?;
        RequestSender::new(
            self.ua.core.clone(),
            request,
            Arc::new(QuietApplicant {
                session: self.clone(),
            }),
            self.ua.credential(),
            self.ua.is_user_closed(),
        )
        .spawn();
        Ok(())
    }

    // ---------------------------------------------------------------
    // terminate (§4.6.2)
    // ---------------------------------------------------------------

    pub(crate) async fn terminate(self: &Arc<Self>, options: TerminateOptions) -> Result<()> {
        let status = self.status();
        debug!(id = %self.id, "terminate() in {:?}", status);
        match status {
            SessionStatus::Terminated => Ok(()),
            SessionStatus::Null | SessionStatus::InviteSent => {
                // no provisional yet: buffer the cancel, the real
                // CANCEL goes out on the first 1xx
                self.is_canceled.store(true, Ordering::Relaxed);
                *self.cancel_reason.lock().unwrap() = options.reason_phrase.clone();
                Ok(())
            }
            SessionStatus::Progress1xx => {
                self.is_canceled.store(true, Ordering::Relaxed);
                *self.cancel_reason.lock().unwrap() = options.reason_phrase.clone();
                self.send_pending_cancel().await;
                Ok(())
            }
            SessionStatus::InviteReceived
            | SessionStatus::WaitingForAnswer
            | SessionStatus::Answered => {
                let code = options.status_code.unwrap_or(480);
                if !(300..700).contains(&code) {
                    return Err(Error::InvalidState(format!(
                        "invalid rejection status code: {}",
                        code
                    )));
                }
                let status_code = StatusCode::try_from(code)
                    .unwrap_or(StatusCode::TemporarilyUnavailable);
                self.reply_to_invite(status_code, None).await;
                self.emit_failed(Originator::Local, Cause::Rejected, None);
                self.close().await;
                Ok(())
            }
            SessionStatus::WaitingForAck => {
                if self.direction == Direction::Incoming
                    && self.timers.lock().unwrap().invite_2xx_retransmit.is_some()
                {
                    // our 200 is unacknowledged: finish the handshake
                    // first, then BYE (RFC 3261 §15)
                    *self.pending_post_ack.lock().unwrap() = Some(PendingPostAck::SendBye {
                        extra_headers: options.extra_headers,
                    });
                    return Ok(());
                }
                self.do_bye(options.extra_headers).await;
                Ok(())
            }
            SessionStatus::Confirmed => {
                self.do_bye(options.extra_headers).await;
                Ok(())
            }
            SessionStatus::Canceled => Ok(()),
        }
    }

    pub(crate) async fn do_bye(self: &Arc<Self>, extra_headers: Vec<Header>) {
        if let Some(dialog) = self.dialog() {
            match dialog.create_request(
                Method::Bye,
                extra_headers,
                None,
                &self.contact,
                self.ua.user_agent(),
            ) {
                Ok(bye) => {
                    RequestSender::new(
                        self.ua.core.clone(),
                        bye,
                        Arc::new(QuietApplicant {
                            session: self.clone(),
                        }),
                        self.ua.credential(),
                        false,
                    )
                    .spawn();
                }
                Err(e) => warn!(id = %self.id, "cannot build BYE: {}", e),
            }
        }
        self.emit_ended(Originator::Local, Cause::Bye);
        self.close().await;
    }

    /// Transport loss: Confirmed sessions end, earlier ones fail.
    pub(crate) async fn on_transport_closed(self: &Arc<Self>) {
        match self.status() {
            SessionStatus::Terminated => {}
            SessionStatus::Confirmed => {
                self.emit_ended(Originator::System, Cause::ConnectionError);
                self.close().await;
            }
            _ => {
                self.emit_failed(Originator::System, Cause::ConnectionError, None);
                self.close().await;
            }
        }
    }
}

/// CANCEL shares the INVITE's branch and CSeq number (RFC 3261 §9.1).
pub(crate) fn build_cancel(invite: &Request, reason: Option<&str>) -> Request {
    let mut cancel = invite.clone();
    cancel.method = Method::Cancel;
    cancel.body = vec![];
    cancel
        .headers_mut()
        .retain(|h| !matches!(h, Header::ContentLength(_) | Header::ContentType(_)));
    if let Ok(cseq) = cancel.cseq_header_mut() {
        cseq.mut_method(Method::Cancel).ok();
    }
    if let Some(reason) = reason {
        cancel.headers_mut().push(Header::Other(
            "Reason".into(),
            format!("SIP;cause=487;text=\"{}\"", reason),
        ));
    }
    cancel
        .headers_mut()
        .push(Header::ContentLength(0u32.into()));
    cancel
}
