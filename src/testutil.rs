//! Shared scaffolding for the end-to-end signalling tests: a user
//! agent wired to an in-memory channel transport with a scripted
//! peer on the far side.

use crate::{
    config::{ServerConfig, UaConfig},
    media::StaticMedia,
    transport::channel::ChannelConnection,
    ua::events::UaEventReceiver,
    UserAgent,
};
use rsip::{
    prelude::{HasHeaders, HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, SipMessage,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub(crate) const SDP_OFFER: &str = "v=0\r\no=- 1 1 IN IP4 192.0.2.1\r\ns=-\r\nt=0 0\r\n\
m=audio 49170 RTP/AVP 0\r\na=sendrecv\r\n";
pub(crate) const SDP_ANSWER: &str = "v=0\r\no=- 2 2 IN IP4 192.0.2.2\r\ns=-\r\nt=0 0\r\n\
m=audio 49172 RTP/AVP 0\r\na=sendrecv\r\n";

/// The far side of the channel transport.
pub(crate) struct Peer {
    to_ua: UnboundedSender<SipMessage>,
    from_ua: UnboundedReceiver<SipMessage>,
}

impl Peer {
    pub fn send(&self, msg: SipMessage) {
        self.to_ua.send(msg).expect("peer send");
    }

    /// Next request of the given method, skipping retransmissions
    /// and other methods.
    pub async fn recv_request(&mut self, method: Method) -> rsip::Request {
        let deadline = Duration::from_secs(10);
        loop {
            let msg = tokio::time::timeout(deadline, self.from_ua.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {}", method))
                .expect("transport closed");
            if let SipMessage::Request(req) = msg {
                if req.method == method {
                    return req;
                }
            }
        }
    }

    /// Next response with the given status code.
    pub async fn recv_response(&mut self, code: u16) -> rsip::Response {
        let deadline = Duration::from_secs(10);
        loop {
            let msg = tokio::time::timeout(deadline, self.from_ua.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {} response", code))
                .expect("transport closed");
            if let SipMessage::Response(resp) = msg {
                if resp.status_code.code() == code {
                    return resp;
                }
            }
        }
    }

    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(msg)) = tokio::time::timeout(window, self.from_ua.recv()).await {
            panic!("unexpected message on the wire: {}", msg);
        }
    }

    /// Build a response echoing the request's identity headers.
    pub fn response_for(
        &self,
        request: &rsip::Request,
        status: rsip::StatusCode,
        to_tag: Option<&str>,
        extra_headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> rsip::Response {
        let mut headers = rsip::Headers::default();
        for header in request.headers.iter() {
            match header {
                Header::Via(h) => headers.push(Header::Via(h.clone())),
                Header::From(h) => headers.push(Header::From(h.clone())),
                Header::CallId(h) => headers.push(Header::CallId(h.clone())),
                Header::CSeq(h) => headers.push(Header::CSeq(h.clone())),
                Header::To(h) => {
                    let tagged = match to_tag {
                        Some(tag) => {
                            let typed = h.typed().expect("to header");
                            if typed.params.iter().any(|p| matches!(p, rsip::Param::Tag(_))) {
                                Header::To(typed.into())
                            } else {
                                Header::To(typed.with_tag(tag.into()).into())
                            }
                        }
                        None => Header::To(h.clone()),
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
        rsip::Response {
            status_code: status,
            headers,
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        }
    }

    /// Standard INVITE from the peer towards the UA under test.
    pub fn invite(&self, user: &str, branch: &str, body: Option<&str>) -> rsip::Request {
        let mut headers: Vec<Header> = vec![
            rsip::headers::Via::new(format!(
                "SIP/2.0/WSS peer.example.com;branch={}",
                branch
            ))
            .into(),
            rsip::headers::MaxForwards::new("70").into(),
            rsip::headers::From::new("Bob <sip:bob@example.com>;tag=peertag1").into(),
            rsip::headers::To::new(format!("<sip:{}@example.com>", user)).into(),
            rsip::headers::CallId::new(format!("{}@peer.example.com", branch)).into(),
            rsip::headers::CSeq::new("1 INVITE").into(),
            rsip::headers::Contact::new("<sip:bob@peer.example.com;transport=ws>").into(),
        ];
        if body.is_some() {
            headers.push(Header::ContentType("application/sdp".into()));
        }
        headers.push(Header::ContentLength(
            body.map_or(0u32, |b| b.len() as u32).into(),
        ));
        rsip::Request {
            method: Method::Invite,
            uri: rsip::Uri::try_from(format!("sip:{}@example.com", user).as_str()).unwrap(),
            headers: headers.into(),
            body: body.map(|b| b.as_bytes().to_vec()).unwrap_or_default(),
            version: rsip::Version::V2,
        }
    }

    /// In-dialog request towards the UA, derived from the UA's last
    /// response or request headers.
    pub fn in_dialog_request(
        &self,
        method: Method,
        branch: &str,
        call_id: &str,
        from: &str,
        to: &str,
        cseq: u32,
        extra_headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> rsip::Request {
        let mut headers: Vec<Header> = vec![
            rsip::headers::Via::new(format!(
                "SIP/2.0/WSS peer.example.com;branch={}",
                branch
            ))
            .into(),
            rsip::headers::MaxForwards::new("70").into(),
            rsip::headers::From::new(from).into(),
            rsip::headers::To::new(to).into(),
            rsip::headers::CallId::new(call_id).into(),
            rsip::headers::CSeq::new(format!("{} {}", cseq, method)).into(),
            rsip::headers::Contact::new("<sip:bob@peer.example.com;transport=ws>").into(),
        ];
        for header in extra_headers {
            headers.push(header);
        }
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        rsip::Request {
            method,
            uri: rsip::Uri::try_from("sip:alice@client.invalid").unwrap(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        }
    }
}

pub(crate) struct TestUa {
    pub ua: UserAgent,
    pub events: UaEventReceiver,
    pub peer: Peer,
}

pub(crate) fn default_config() -> UaConfig {
    UaConfig {
        ws_servers: vec![ServerConfig::new("wss://sip.example.com")],
        uri: "sip:alice@example.com".into(),
        password: Some("secret".into()),
        register: false,
        ..Default::default()
    }
}

/// A UA with a connected in-memory transport and a scripted peer.
pub(crate) async fn connected_ua(config: UaConfig) -> TestUa {
    let ua = UserAgent::new(config).expect("valid config");
    let mut events = ua.take_events().expect("event stream");

    let (to_ua, ua_rx) = unbounded_channel();
    let (ua_tx, from_ua) = unbounded_channel();
    let connection = ChannelConnection::new(ua_rx, ua_tx);
    {
        let transport = ua.inner.transport.clone();
        tokio::spawn(async move {
            transport.serve_connection(connection.into(), None).await;
        });
    }

    // wait until the UA sees the transport up
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(crate::ua::events::UaEvent::Connected)) => break,
            Ok(Some(_)) => continue,
            other => panic!("no Connected event: {:?}", other.is_err()),
        }
    }

    TestUa {
        ua,
        events,
        peer: Peer { to_ua, from_ua },
    }
}

pub(crate) fn media() -> Arc<StaticMedia> {
    Arc::new(StaticMedia::new(SDP_OFFER))
}

/// Extract `(call_id, from, to, cseq)` strings for in-dialog
/// follow-ups from a request the UA sent.
pub(crate) fn dialog_coords(request: &rsip::Request) -> (String, String, String, u32) {
    (
        request.call_id_header().unwrap().value().to_string(),
        request.from_header().unwrap().value().to_string(),
        request.to_header().unwrap().value().to_string(),
        request.cseq_header().unwrap().seq().unwrap(),
    )
}
