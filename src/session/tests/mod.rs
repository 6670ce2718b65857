use crate::{
    session::{AnswerOptions, CallOptions, InviteSession, ReferNotification, SessionStatus, TerminateOptions},
    testutil::{connected_ua, default_config, media, TestUa, SDP_ANSWER, SDP_OFFER},
    ua::events::{Cause, Originator, SessionEvent, SessionEventReceiver, UaEvent},
};
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    Header, Method, StatusCode,
};
use std::time::Duration;

async fn next_event(events: &mut SessionEventReceiver) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("session event in time")
        .expect("session event stream open")
}

async fn wait_for<F: Fn(&SessionEvent) -> bool>(
    events: &mut SessionEventReceiver,
    what: &str,
    predicate: F,
) -> SessionEvent {
    loop {
        let event = next_event(events).await;
        if predicate(&event) {
            return event;
        }
        let _ = what;
    }
}

/// Establish an outgoing call over the scripted peer. Returns the
/// session, its event stream (already drained past Confirmed), and
/// the dialog coordinates for in-dialog requests from the peer.
async fn established_outgoing(
    t: &mut TestUa,
) -> (InviteSession, SessionEventReceiver, DialogCoords) {
    let session = t
        .ua
        .call("sip:bob@example.com", media(), CallOptions::default())
        .await
        .expect("call placed");
    let mut events = session.take_events().expect("session events");

    let invite = t.peer.recv_request(Method::Invite).await;
    t.peer.send(
        t.peer
            .response_for(
                &invite,
                StatusCode::OK,
                Some("bob1"),
                vec![
                    Header::Contact("<sip:bob@peer.example.com;transport=ws>".into()),
                    Header::ContentType("application/sdp".into()),
                ],
                Some(SDP_ANSWER.as_bytes().to_vec()),
            )
            .into(),
    );
    wait_for(&mut events, "confirmed", |e| {
        matches!(e, SessionEvent::Confirmed)
    })
    .await;
    let _ack = t.peer.recv_request(Method::Ack).await;

    let coords = DialogCoords {
        call_id: invite.call_id_header().unwrap().value().to_string(),
        // the peer's From is the UA's To and vice versa
        peer_from: format!("{};tag=bob1", invite.to_header().unwrap().value()),
        peer_to: invite.from_header().unwrap().value().to_string(),
        cseq: 1,
    };
    (session, events, coords)
}

struct DialogCoords {
    call_id: String,
    peer_from: String,
    peer_to: String,
    cseq: u32,
}

/// Scenario 2: incoming call, late offer, answered; the ACK carries
/// the answer.
#[tokio::test]
async fn test_incoming_late_offer_answered() {
    let mut t = connected_ua(default_config()).await;

    t.peer
        .send(t.peer.invite("alice", "z9hG4bKlate1", None).into());
    let ringing = t.peer.recv_response(180).await;
    let to_with_tag = ringing.to_header().unwrap().value().to_string();
    assert!(to_with_tag.contains("tag="), "180 assigns a to tag");

    let session = loop {
        match tokio::time::timeout(Duration::from_secs(5), t.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            UaEvent::NewSession {
                session,
                originator,
            } => {
                assert_eq!(originator, Originator::Remote);
                break session;
            }
            _ => {}
        }
    };
    let mut events = session.take_events().expect("session events");
    assert_eq!(session.status(), SessionStatus::WaitingForAnswer);

    session
        .answer(AnswerOptions {
            media: media(),
            extra_headers: vec![],
        })
        .await
        .expect("answered");

    // late offer: the 200 carries our offer
    let ok = t.peer.recv_response(200).await;
    assert_eq!(std::str::from_utf8(&ok.body).unwrap(), SDP_OFFER);
    assert_eq!(session.status(), SessionStatus::WaitingForAck);

    // ACK with the answer confirms
    let ack = t.peer.in_dialog_request(
        Method::Ack,
        "z9hG4bKlateack",
        "z9hG4bKlate1@peer.example.com",
        "Bob <sip:bob@example.com>;tag=peertag1",
        &to_with_tag,
        1,
        vec![Header::ContentType("application/sdp".into())],
        Some(SDP_ANSWER.as_bytes().to_vec()),
    );
    t.peer.send(ack.into());

    wait_for(&mut events, "confirmed", |e| {
        matches!(e, SessionEvent::Confirmed)
    })
    .await;
    assert_eq!(session.status(), SessionStatus::Confirmed);
}

/// Scenario 2 (negative): a late-offer ACK without SDP kills the
/// session with MISSING_SDP.
#[tokio::test]
async fn test_incoming_late_offer_ack_without_sdp() {
    let mut t = connected_ua(default_config()).await;

    t.peer
        .send(t.peer.invite("alice", "z9hG4bKlate2", None).into());
    let ringing = t.peer.recv_response(180).await;
    let to_with_tag = ringing.to_header().unwrap().value().to_string();

    let session = loop {
        match tokio::time::timeout(Duration::from_secs(5), t.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            UaEvent::NewSession { session, .. } => break session,
            _ => {}
        }
    };
    let mut events = session.take_events().expect("session events");
    session
        .answer(AnswerOptions {
            media: media(),
            extra_headers: vec![],
        })
        .await
        .expect("answered");
    t.peer.recv_response(200).await;

    let ack = t.peer.in_dialog_request(
        Method::Ack,
        "z9hG4bKlateack2",
        "z9hG4bKlate2@peer.example.com",
        "Bob <sip:bob@example.com>;tag=peertag1",
        &to_with_tag,
        1,
        vec![],
        None,
    );
    t.peer.send(ack.into());

    let bye = t.peer.recv_request(Method::Bye).await;
    let reason = crate::rsip_ext::header_value(&bye.headers, "Reason").unwrap_or_default();
    assert!(reason.contains("400"), "reason: {}", reason);

    match wait_for(&mut events, "ended", |e| matches!(e, SessionEvent::Ended { .. })).await {
        SessionEvent::Ended { originator, cause } => {
            assert_eq!(originator, Originator::Local);
            assert_eq!(cause, Cause::MissingSdp);
        }
        _ => unreachable!(),
    }
}

/// Incoming call canceled by the peer while ringing.
#[tokio::test]
async fn test_incoming_call_canceled() {
    let mut t = connected_ua(default_config()).await;

    let invite = t.peer.invite("alice", "z9hG4bKcan1", Some(SDP_OFFER));
    t.peer.send(invite.clone().into());
    t.peer.recv_response(180).await;

    let session = loop {
        match tokio::time::timeout(Duration::from_secs(5), t.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            UaEvent::NewSession { session, .. } => break session,
            _ => {}
        }
    };
    let mut events = session.take_events().expect("session events");

    // CANCEL reuses the INVITE's branch and CSeq number
    let mut cancel = invite;
    cancel.method = Method::Cancel;
    cancel.body = vec![];
    cancel
        .headers
        .retain(|h| !matches!(h, Header::ContentType(_) | Header::ContentLength(_)));
    if let Ok(cseq) = cancel.cseq_header_mut() {
        cseq.mut_method(Method::Cancel).unwrap();
    }
    cancel.headers.push(Header::ContentLength(0u32.into()));
    t.peer.send(cancel.into());

    // 200 for the CANCEL, 487 for the INVITE
    t.peer.recv_response(200).await;
    t.peer.recv_response(487).await;

    match wait_for(&mut events, "failed", |e| {
        matches!(e, SessionEvent::Failed { .. })
    })
    .await
    {
        SessionEvent::Failed {
            originator, cause, ..
        } => {
            assert_eq!(originator, Originator::Remote);
            assert_eq!(cause, Cause::Canceled);
        }
        _ => unreachable!(),
    }
    assert!(session.is_ended());
}

/// `no_answer_timeout` fires 408 and failed(local, NO_ANSWER).
#[tokio::test]
async fn test_no_answer_timeout() {
    let mut config = default_config();
    config.no_answer_timeout = 1;
    let mut t = connected_ua(config).await;

    t.peer
        .send(t.peer.invite("alice", "z9hG4bKnoans1", Some(SDP_OFFER)).into());
    t.peer.recv_response(180).await;
    let session = loop {
        match tokio::time::timeout(Duration::from_secs(5), t.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            UaEvent::NewSession { session, .. } => break session,
            _ => {}
        }
    };
    let mut events = session.take_events().expect("session events");

    t.peer.recv_response(408).await;
    match wait_for(&mut events, "failed", |e| {
        matches!(e, SessionEvent::Failed { .. })
    })
    .await
    {
        SessionEvent::Failed {
            originator, cause, ..
        } => {
            assert_eq!(originator, Originator::Local);
            assert_eq!(cause, Cause::NoAnswer);
        }
        _ => unreachable!(),
    }
}

/// Rejecting a ringing call replies the chosen status code.
#[tokio::test]
async fn test_reject_incoming_call() {
    let mut t = connected_ua(default_config()).await;

    t.peer
        .send(t.peer.invite("alice", "z9hG4bKrej1", Some(SDP_OFFER)).into());
    t.peer.recv_response(180).await;
    let session = loop {
        match tokio::time::timeout(Duration::from_secs(5), t.events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            UaEvent::NewSession { session, .. } => break session,
            _ => {}
        }
    };

    session
        .terminate(TerminateOptions {
            status_code: Some(486),
            ..Default::default()
        })
        .await
        .expect("rejected");
    t.peer.recv_response(486).await;
}

/// Hold mangles the re-offer to sendonly and emits hold(local).
#[tokio::test]
async fn test_hold_unhold() {
    let mut t = connected_ua(default_config()).await;
    let (session, mut events, coords) = established_outgoing(&mut t).await;

    session.hold().await.expect("hold");
    let reinvite = t.peer.recv_request(Method::Invite).await;
    let offer = std::str::from_utf8(&reinvite.body).unwrap();
    assert!(offer.contains("a=sendonly"), "offer: {}", offer);
    assert!(!offer.contains("a=sendrecv"));

    t.peer.send(
        t.peer
            .response_for(
                &reinvite,
                StatusCode::OK,
                None,
                vec![Header::ContentType("application/sdp".into())],
                Some(SDP_ANSWER.replace("a=sendrecv", "a=recvonly").into_bytes()),
            )
            .into(),
    );
    t.peer.recv_request(Method::Ack).await;
    wait_for(&mut events, "hold", |e| {
        matches!(
            e,
            SessionEvent::Hold {
                originator: Originator::Local
            }
        )
    })
    .await;
    assert!(session.is_on_local_hold());

    session.unhold().await.expect("unhold");
    let reinvite = t.peer.recv_request(Method::Invite).await;
    let offer = std::str::from_utf8(&reinvite.body).unwrap();
    assert!(offer.contains("a=sendrecv"), "offer: {}", offer);
    t.peer.send(
        t.peer
            .response_for(
                &reinvite,
                StatusCode::OK,
                None,
                vec![Header::ContentType("application/sdp".into())],
                Some(SDP_ANSWER.as_bytes().to_vec()),
            )
            .into(),
    );
    t.peer.recv_request(Method::Ack).await;
    wait_for(&mut events, "unhold", |e| {
        matches!(
            e,
            SessionEvent::Unhold {
                originator: Originator::Local
            }
        )
    })
    .await;
    assert!(!session.is_on_local_hold());
    let _ = coords;
}

/// Scenario 5: 491 on re-INVITE retries once after U(2.1, 4.0) s
/// with the next CSeq.
#[tokio::test]
async fn test_reinvite_glare_retry() {
    let mut t = connected_ua(default_config()).await;
    let (session, _events, _coords) = established_outgoing(&mut t).await;

    session.renegotiate(false).await.expect("renegotiate");
    let first = t.peer.recv_request(Method::Invite).await;
    let first_cseq = first.cseq_header().unwrap().seq().unwrap();
    t.peer.send(
        t.peer
            .response_for(&first, StatusCode::RequestPending, None, vec![], None)
            .into(),
    );

    let started = std::time::Instant::now();
    let second = t.peer.recv_request(Method::Invite).await;
    let waited = started.elapsed();
    assert!(
        waited >= Duration::from_millis(2000),
        "retried too early: {:?}",
        waited
    );
    assert_eq!(second.cseq_header().unwrap().seq().unwrap(), first_cseq + 1);

    t.peer.send(
        t.peer
            .response_for(
                &second,
                StatusCode::OK,
                None,
                vec![Header::ContentType("application/sdp".into())],
                Some(SDP_ANSWER.as_bytes().to_vec()),
            )
            .into(),
    );
    t.peer.recv_request(Method::Ack).await;
}

/// Inbound re-INVITE with sendonly puts us on remote hold; the
/// answer is mangled to recvonly.
#[tokio::test]
async fn test_remote_hold_via_reinvite() {
    let mut t = connected_ua(default_config()).await;
    let (session, mut events, coords) = established_outgoing(&mut t).await;

    let hold_offer = SDP_OFFER.replace("a=sendrecv", "a=sendonly");
    let reinvite = t.peer.in_dialog_request(
        Method::Invite,
        "z9hG4bKrehold1",
        &coords.call_id,
        &coords.peer_from,
        &coords.peer_to,
        coords.cseq + 1,
        vec![Header::ContentType("application/sdp".into())],
        Some(hold_offer.into_bytes()),
    );
    t.peer.send(reinvite.into());

    let ok = t.peer.recv_response(200).await;
    let answer = std::str::from_utf8(&ok.body).unwrap();
    assert!(answer.contains("a=recvonly"), "answer: {}", answer);

    wait_for(&mut events, "remote hold", |e| {
        matches!(
            e,
            SessionEvent::Hold {
                originator: Originator::Remote
            }
        )
    })
    .await;
    assert!(session.is_on_remote_hold());

    // ACK stops the session-owned 2xx retransmission
    let ack = t.peer.in_dialog_request(
        Method::Ack,
        "z9hG4bKreholdack",
        &coords.call_id,
        &coords.peer_from,
        &coords.peer_to,
        coords.cseq + 1,
        vec![],
        None,
    );
    t.peer.send(ack.into());
    t.peer.expect_silence(Duration::from_millis(1200)).await;
}

/// Peer BYE ends the session with ended(remote).
#[tokio::test]
async fn test_remote_bye() {
    let mut t = connected_ua(default_config()).await;
    let (session, mut events, coords) = established_outgoing(&mut t).await;

    let bye = t.peer.in_dialog_request(
        Method::Bye,
        "z9hG4bKbye9",
        &coords.call_id,
        &coords.peer_from,
        &coords.peer_to,
        coords.cseq + 1,
        vec![],
        None,
    );
    t.peer.send(bye.into());
    t.peer.recv_response(200).await;

    match wait_for(&mut events, "ended", |e| matches!(e, SessionEvent::Ended { .. })).await {
        SessionEvent::Ended { originator, cause } => {
            assert_eq!(originator, Originator::Remote);
            assert_eq!(cause, Cause::Bye);
        }
        _ => unreachable!(),
    }
    assert!(session.is_ended());
}

/// DTMF over INFO: dtmf-relay body, local newDTMF event, queued
/// pacing.
#[tokio::test]
async fn test_send_dtmf() {
    let mut t = connected_ua(default_config()).await;
    let (session, mut events, _coords) = established_outgoing(&mut t).await;

    session
        .send_dtmf("1#", crate::session::DtmfOptions::default())
        .expect("dtmf queued");

    let info = t.peer.recv_request(Method::Info).await;
    let content_type = crate::rsip_ext::header_value(&info.headers, "Content-Type");
    assert_eq!(content_type.as_deref(), Some("application/dtmf-relay"));
    assert_eq!(
        std::str::from_utf8(&info.body).unwrap(),
        "Signal=1\r\nDuration=100\r\n"
    );
    t.peer.send(
        t.peer
            .response_for(&info, StatusCode::OK, None, vec![], None)
            .into(),
    );

    match wait_for(&mut events, "dtmf", |e| matches!(e, SessionEvent::NewDtmf { .. })).await {
        SessionEvent::NewDtmf {
            originator, tone, ..
        } => {
            assert_eq!(originator, Originator::Local);
            assert_eq!(tone, '1');
        }
        _ => unreachable!(),
    }

    // second tone arrives after duration + gap
    let info = t.peer.recv_request(Method::Info).await;
    assert!(std::str::from_utf8(&info.body).unwrap().contains("Signal=#"));
    t.peer.send(
        t.peer
            .response_for(&info, StatusCode::OK, None, vec![], None)
            .into(),
    );
}

/// Inbound INFO with dtmf-relay surfaces newDTMF(remote).
#[tokio::test]
async fn test_receive_dtmf_info() {
    let mut t = connected_ua(default_config()).await;
    let (_session, mut events, coords) = established_outgoing(&mut t).await;

    let info = t.peer.in_dialog_request(
        Method::Info,
        "z9hG4bKinfo1",
        &coords.call_id,
        &coords.peer_from,
        &coords.peer_to,
        coords.cseq + 1,
        vec![Header::ContentType("application/dtmf-relay".into())],
        Some(b"Signal=7\r\nDuration=120\r\n".to_vec()),
    );
    t.peer.send(info.into());
    t.peer.recv_response(200).await;

    match wait_for(&mut events, "dtmf", |e| matches!(e, SessionEvent::NewDtmf { .. })).await {
        SessionEvent::NewDtmf {
            originator,
            tone,
            duration,
        } => {
            assert_eq!(originator, Originator::Remote);
            assert_eq!(tone, '7');
            assert_eq!(duration, 120);
        }
        _ => unreachable!(),
    }
}

/// Outbound blind transfer: REFER + NOTIFY progress.
#[tokio::test]
async fn test_refer_transfer_progress() {
    let mut t = connected_ua(default_config()).await;
    let (session, _events, coords) = established_outgoing(&mut t).await;

    let mut notifications = session.refer("carol").await.expect("refer sent");
    let refer = t.peer.recv_request(Method::Refer).await;
    let refer_to = crate::rsip_ext::header_value(&refer.headers, "Refer-To").unwrap();
    assert!(refer_to.contains("sip:carol@example.com"), "refer-to: {}", refer_to);
    let refer_cseq = refer.cseq_header().unwrap().seq().unwrap();

    t.peer.send(
        t.peer
            .response_for(&refer, StatusCode::Accepted, None, vec![], None)
            .into(),
    );

    // transfer progress as sipfrag NOTIFYs
    let notify = t.peer.in_dialog_request(
        Method::Notify,
        "z9hG4bKnot1",
        &coords.call_id,
        &coords.peer_from,
        &coords.peer_to,
        coords.cseq + 1,
        vec![
            Header::Other("Event".into(), format!("refer;id={}", refer_cseq)),
            Header::Other("Subscription-State".into(), "active;expires=60".into()),
            Header::ContentType("message/sipfrag;version=2.0".into()),
        ],
        Some(b"SIP/2.0 100 Trying\r\n".to_vec()),
    );
    t.peer.send(notify.into());
    t.peer.recv_response(200).await;
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap(),
        Some(ReferNotification::Trying)
    );

    let notify = t.peer.in_dialog_request(
        Method::Notify,
        "z9hG4bKnot2",
        &coords.call_id,
        &coords.peer_from,
        &coords.peer_to,
        coords.cseq + 2,
        vec![
            Header::Other("Event".into(), format!("refer;id={}", refer_cseq)),
            Header::Other(
                "Subscription-State".into(),
                "terminated;reason=noresource".into(),
            ),
            Header::ContentType("message/sipfrag;version=2.0".into()),
        ],
        Some(b"SIP/2.0 200 OK\r\n".to_vec()),
    );
    t.peer.send(notify.into());
    t.peer.recv_response(200).await;
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap(),
        Some(ReferNotification::Accepted)
    );
}

/// Inbound REFER: 202, initial NOTIFY, refer event; rejecting sends
/// a terminal 603 NOTIFY.
#[tokio::test]
async fn test_inbound_refer_rejected() {
    let mut t = connected_ua(default_config()).await;
    let (session, mut events, coords) = established_outgoing(&mut t).await;

    let refer = t.peer.in_dialog_request(
        Method::Refer,
        "z9hG4bKrefer1",
        &coords.call_id,
        &coords.peer_from,
        &coords.peer_to,
        coords.cseq + 1,
        vec![Header::Other(
            "Refer-To".into(),
            "<sip:carol@example.com>".into(),
        )],
        None,
    );
    t.peer.send(refer.into());

    t.peer.recv_response(202).await;
    let notify = t.peer.recv_request(Method::Notify).await;
    assert!(std::str::from_utf8(&notify.body).unwrap().contains("100 Trying"));
    t.peer.send(
        t.peer
            .response_for(&notify, StatusCode::OK, None, vec![], None)
            .into(),
    );

    let id = match wait_for(&mut events, "refer", |e| matches!(e, SessionEvent::Refer { .. }))
        .await
    {
        SessionEvent::Refer { id, refer_to, .. } => {
            assert_eq!(refer_to.to_string(), "sip:carol@example.com");
            id
        }
        _ => unreachable!(),
    };

    session.reject_refer(id).await.expect("rejected");
    let notify = t.peer.recv_request(Method::Notify).await;
    assert!(std::str::from_utf8(&notify.body).unwrap().contains("603"));
    let state = crate::rsip_ext::header_value(&notify.headers, "Subscription-State").unwrap();
    assert!(state.starts_with("terminated"));
}

/// Muting is local-only: events fire, no wire traffic.
#[tokio::test]
async fn test_mute_unmute() {
    let mut t = connected_ua(default_config()).await;
    let (session, mut events, _coords) = established_outgoing(&mut t).await;

    session.mute(true, false);
    match wait_for(&mut events, "muted", |e| matches!(e, SessionEvent::Muted { .. })).await {
        SessionEvent::Muted { audio, video } => {
            assert!(audio);
            assert!(!video);
        }
        _ => unreachable!(),
    }
    session.unmute(true, false);
    wait_for(&mut events, "unmuted", |e| {
        matches!(e, SessionEvent::Unmuted { .. })
    })
    .await;
    t.peer.expect_silence(Duration::from_millis(200)).await;
}
