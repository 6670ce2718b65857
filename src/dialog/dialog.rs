use super::DialogId;
use crate::{
    rsip_ext::extract_uri_from_contact,
    transaction::{key::TransactionRole, make_via_branch},
    Error, Result,
};
use rsip::{
    headers::Route,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, Param, Request,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Mutex,
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Established by a 1xx with a To tag.
    Early,
    /// Established or promoted by the 2xx.
    Confirmed,
}

/// RFC 3261 §12 dialog state: the two tags, both sequence numbers,
/// the route set and the remote target, plus the glare-avoidance
/// flags gating concurrent INVITE/UPDATE.
///
/// The owning invite session decides when the dialog dies; the UA
/// dialog map only stores ids.
pub struct Dialog {
    pub role: TransactionRole,
    id: Mutex<DialogId>,
    state: Mutex<DialogState>,

    local_seq: AtomicU32,
    remote_seq: AtomicU32,
    /// CSeq of the last INVITE we sent; ACK and CANCEL reuse it.
    invite_seq: AtomicU32,

    /// From/To of the dialog-forming INVITE; swapped when the local
    /// side is the UAS.
    from: rsip::typed::From,
    to: Mutex<rsip::typed::To>,

    remote_target: Mutex<rsip::Uri>,
    route_set: Mutex<Vec<Route>>,
    pub secure: bool,

    uac_pending_reply: AtomicBool,
    uas_pending_reply: AtomicBool,

    call_id: String,
    via_host: String,
}

impl Dialog {
    /// UAC dialog from the sent INVITE and a dialog-forming response
    /// (1xx-with-tag makes it Early, 2xx makes it Confirmed).
    pub fn new_uac(request: &Request, response: &rsip::Response, via_host: &str) -> Result<Self> {
        let id = DialogId::uac_from_response(response)?;
        if id.remote_tag.is_empty() {
            return Err(Error::Dialog("response carries no to tag".to_string(), id));
        }

        let remote_target = match response.contact_header() {
            Ok(contact) => extract_uri_from_contact(contact.value())?,
            Err(_) => request.uri.clone(),
        };

        let mut route_set = vec![];
        for header in response.headers.iter() {
            if let Header::RecordRoute(rr) = header {
                route_set.push(Route::from(rr.value()));
            }
        }
        route_set.reverse();

        let state = if response.status_code.kind() == rsip::StatusCodeKind::Successful {
            DialogState::Confirmed
        } else {
            DialogState::Early
        };

        let from = request.from_header()?.typed()?;
        let to = response.to_header()?.typed()?;
        let cseq = request.cseq_header()?.seq()?;
        let secure = matches!(remote_target.scheme, Some(rsip::Scheme::Sips));

        debug!(id = %id, "created uac dialog ({:?})", state);
        Ok(Self {
            role: TransactionRole::Client,
            via_host: via_host.to_string(),
            call_id: id.call_id.clone(),
            id: Mutex::new(id),
            state: Mutex::new(state),
            local_seq: AtomicU32::new(cseq),
            remote_seq: AtomicU32::new(0),
            invite_seq: AtomicU32::new(cseq),
            from,
            to: Mutex::new(to),
            remote_target: Mutex::new(remote_target),
            route_set: Mutex::new(route_set),
            secure,
            uac_pending_reply: AtomicBool::new(false),
            uas_pending_reply: AtomicBool::new(false),
        })
    }

    /// UAS dialog from a received INVITE and the tag this UA put in
    /// To. Early until the 2xx goes out.
    pub fn new_uas(request: &Request, local_tag: &str, via_host: &str) -> Result<Self> {
        let id = DialogId::uas_from_request(request, local_tag)?;

        let remote_target = match request.contact_header() {
            Ok(contact) => extract_uri_from_contact(contact.value())?,
            Err(_) => {
                return Err(Error::Dialog("INVITE carries no contact".to_string(), id));
            }
        };

        let mut route_set = vec![];
        for header in request.headers.iter() {
            if let Header::RecordRoute(rr) = header {
                route_set.push(Route::from(rr.value()));
            }
        }

        let from = request.from_header()?.typed()?;
        let mut to = request.to_header()?.typed()?;
        if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
            to = to.with_tag(local_tag.into());
        }
        let remote_seq = request.cseq_header()?.seq()?;
        let secure = matches!(remote_target.scheme, Some(rsip::Scheme::Sips));

        debug!(id = %id, "created uas dialog (Early)");
        Ok(Self {
            role: TransactionRole::Server,
            via_host: via_host.to_string(),
            call_id: id.call_id.clone(),
            id: Mutex::new(id),
            state: Mutex::new(DialogState::Early),
            local_seq: AtomicU32::new(0),
            remote_seq: AtomicU32::new(remote_seq),
            invite_seq: AtomicU32::new(0),
            from,
            to: Mutex::new(to),
            remote_target: Mutex::new(remote_target),
            route_set: Mutex::new(route_set),
            secure,
            uac_pending_reply: AtomicBool::new(false),
            uas_pending_reply: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> DialogId {
        self.id.lock().unwrap().clone()
    }

    pub fn state(&self) -> DialogState {
        *self.state.lock().unwrap()
    }

    pub fn is_confirmed(&self) -> bool {
        self.state() == DialogState::Confirmed
    }

    pub fn confirm(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == DialogState::Early {
            trace!(id = %self.id.lock().unwrap(), "dialog confirmed");
            *state = DialogState::Confirmed;
        }
    }

    /// Adopt the final remote tag when an early dialog is promoted
    /// by the 2xx.
    pub fn update_remote_tag(&self, tag: &str) {
        let mut id = self.id.lock().unwrap();
        id.remote_tag = tag.to_string();
        if self.role == TransactionRole::Client {
            let mut to = self.to.lock().unwrap();
            *to = to.clone().with_tag(tag.into());
        }
    }

    pub fn remote_target(&self) -> rsip::Uri {
        self.remote_target.lock().unwrap().clone()
    }

    /// Refresh the remote target from a Contact in a 2xx or
    /// re-INVITE, so later in-dialog requests route correctly.
    pub fn set_remote_target(&self, uri: rsip::Uri) {
        *self.remote_target.lock().unwrap() = uri;
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }

    pub fn invite_seq(&self) -> u32 {
        self.invite_seq.load(Ordering::Relaxed)
    }

    pub fn next_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Validate and record the CSeq of an inbound in-dialog request.
    /// Returns false for out-of-order requests, which get a 500.
    pub fn check_remote_seq(&self, cseq: u32) -> bool {
        let current = self.remote_seq.load(Ordering::Relaxed);
        if current > 0 && cseq < current {
            return false;
        }
        self.remote_seq.store(cseq, Ordering::Relaxed);
        true
    }

    // Glare avoidance per RFC 3261 §14.1: one outstanding
    // INVITE/UPDATE per direction.
    pub fn uac_pending_reply(&self) -> bool {
        self.uac_pending_reply.load(Ordering::Relaxed)
    }

    pub fn uas_pending_reply(&self) -> bool {
        self.uas_pending_reply.load(Ordering::Relaxed)
    }

    pub fn try_begin_uac_request(&self) -> bool {
        self.uac_pending_reply
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn end_uac_request(&self) {
        self.uac_pending_reply.store(false, Ordering::Relaxed);
    }

    pub fn try_begin_uas_request(&self) -> bool {
        self.uas_pending_reply
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn end_uas_request(&self) {
        self.uas_pending_reply.store(false, Ordering::Relaxed);
    }

    /// Build an in-dialog request. ACK and CANCEL inherit the
    /// INVITE's CSeq, everything else allocates the next one.
    pub fn create_request(
        &self,
        method: Method,
        extra_headers: Vec<Header>,
        body: Option<Vec<u8>>,
        contact: &rsip::Uri,
        user_agent: &str,
    ) -> Result<Request> {
        let cseq = match method {
            Method::Ack | Method::Cancel => self.invite_seq.load(Ordering::Relaxed),
            Method::Invite | Method::Update => {
                let seq = self.next_local_seq();
                if method == Method::Invite {
                    self.invite_seq.store(seq, Ordering::Relaxed);
                }
                seq
            }
            _ => self.next_local_seq(),
        };
        self.create_request_with_cseq(method, cseq, extra_headers, body, contact, user_agent)
    }

    pub fn create_request_with_cseq(
        &self,
        method: Method,
        cseq: u32,
        extra_headers: Vec<Header>,
        body: Option<Vec<u8>>,
        contact: &rsip::Uri,
        user_agent: &str,
    ) -> Result<Request> {
        let mut headers: Vec<Header> = vec![];

        let via = rsip::typed::Via {
            version: rsip::Version::V2,
            transport: rsip::transport::Transport::Wss,
            uri: rsip::Uri {
                host_with_port: rsip::Domain::from(self.via_host()).into(),
                ..Default::default()
            },
            params: vec![make_via_branch()],
        };
        headers.push(Header::Via(via.into()));
        headers.push(Header::MaxForwards(70.into()));

        let to_value = self.to.lock().unwrap().clone().untyped().value().to_string();
        let from_value = self.from.clone().untyped().value().to_string();
        match self.role {
            TransactionRole::Client => {
                headers.push(Header::From(from_value.into()));
                headers.push(Header::To(to_value.into()));
            }
            TransactionRole::Server => {
                headers.push(Header::From(to_value.into()));
                headers.push(Header::To(from_value.into()));
            }
        }
        headers.push(Header::CallId(self.call_id.clone().into()));
        headers.push(Header::CSeq(
            rsip::typed::CSeq {
                seq: cseq,
                method: method.clone(),
            }
            .into(),
        ));

        {
            let route_set = self.route_set.lock().unwrap();
            headers.extend(route_set.iter().cloned().map(Header::Route));
        }

        if !matches!(method, Method::Ack | Method::Cancel | Method::Bye) {
            headers.push(rsip::typed::Contact::from(contact.clone()).into());
        }
        headers.push(Header::UserAgent(user_agent.to_string().into()));

        for header in extra_headers {
            headers.push(header);
        }
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        Ok(Request {
            method,
            uri: self.remote_target.lock().unwrap().clone(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }

    fn via_host(&self) -> String {
        self.via_host.clone()
    }
}
