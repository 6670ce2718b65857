use crate::{
    transaction::transaction::{TransactionCore, TransactionCoreRef},
    transport::{channel::ChannelConnection, Connection, ServerSet, TransportEvent, WsTransport},
};
use crate::config::ServerConfig;
use rsip::SipMessage;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

mod test_client;

/// A transaction core wired to an in-memory peer. Inbound frames are
/// pumped through `handle_message`; frames the UA sends pop out of
/// the returned receiver.
pub(crate) struct TestPeer {
    pub core: TransactionCoreRef,
    pub to_ua: UnboundedSender<SipMessage>,
    pub from_ua: UnboundedReceiver<SipMessage>,
    pub unmatched: UnboundedReceiver<SipMessage>,
}

pub(crate) async fn test_core() -> TestPeer {
    let token = CancellationToken::new();
    let (event_tx, mut event_rx) = unbounded_channel();
    let (to_ua, ua_rx) = unbounded_channel();
    let (ua_tx, from_ua) = unbounded_channel();
    let connection: Connection = ChannelConnection::new(ua_rx, ua_tx).into();

    let servers = ServerSet::new(
        &[ServerConfig::new("wss://sip.example.com")],
        Duration::from_secs(2),
        Duration::from_secs(30),
    );
    let transport = WsTransport::new(servers, event_tx, token.child_token());
    {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport.serve_connection(connection, None).await;
        });
    }

    let core = TransactionCore::new(transport, token.child_token(), Some(Duration::from_millis(5)));
    {
        let core = core.clone();
        tokio::spawn(async move { core.process_timer().await });
    }

    let (unmatched_tx, unmatched) = unbounded_channel();
    {
        let core = core.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let TransportEvent::Message(msg) = event {
                    if let Ok(Some(msg)) = core.handle_message(msg).await {
                        unmatched_tx.send(msg).ok();
                    }
                }
            }
        });
    }

    // wait for the channel connection to be live
    tokio::time::sleep(Duration::from_millis(10)).await;
    TestPeer {
        core,
        to_ua,
        from_ua,
        unmatched,
    }
}

pub(crate) fn make_request(method: rsip::Method, branch: &str, cseq: u32) -> rsip::Request {
    use rsip::headers::*;
    rsip::Request {
        method: method.clone(),
        uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
        headers: vec![
            Via::new(format!("SIP/2.0/WSS abc.invalid;branch={}", branch)).into(),
            MaxForwards::new("70").into(),
            To::new("<sip:bob@example.com>").into(),
            From::new("Alice <sip:alice@example.com>;tag=fromtag1").into(),
            CallId::new("callid@example.com").into(),
            CSeq::new(format!("{} {}", cseq, method)).into(),
            ContentLength::new("0").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    }
}

pub(crate) fn make_response(
    req: &rsip::Request,
    status: rsip::StatusCode,
    to_tag: Option<&str>,
) -> rsip::Response {
    use rsip::prelude::HeadersExt;
    let mut headers = req.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            rsip::Header::Via(_)
                | rsip::Header::From(_)
                | rsip::Header::To(_)
                | rsip::Header::CallId(_)
                | rsip::Header::CSeq(_)
        )
    });
    let mut resp = rsip::Response {
        status_code: status,
        headers,
        version: rsip::Version::V2,
        body: Default::default(),
    };
    if let Some(tag) = to_tag {
        resp.to_header_mut()
            .unwrap()
            .mut_tag(tag.into())
            .expect("set to tag");
    }
    resp
}

#[cfg(test)]
mod unit {
    use crate::transaction::{make_call_id, make_tag, make_via_branch, random_text};

    #[test]
    fn test_random_text() {
        let text = random_text(10);
        assert_eq!(text.len(), 10);
        assert_ne!(random_text(10), random_text(10));
    }

    #[test]
    fn test_make_via_branch() {
        let branch = make_via_branch().to_string();
        assert!(branch.contains("z9hG4bK"));
    }

    #[test]
    fn test_make_tag_and_call_id() {
        assert_eq!(make_tag().to_string().len(), 8);
        assert!(make_call_id("example.com").to_string().ends_with("@example.com"));
    }
}
