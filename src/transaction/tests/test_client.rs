use super::{make_request, make_response, test_core};
use crate::transaction::{
    key::{TransactionKey, TransactionRole},
    transaction::{Transaction, TransactionOutput},
    TransactionState, TransactionType,
};
use rsip::SipMessage;

#[tokio::test]
async fn test_invite_client_accepts_2xx() {
    let mut peer = test_core().await;

    let invite = make_request(rsip::Method::Invite, "z9hG4bKict1", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key, invite, peer.core.clone());
    assert_eq!(tx.transaction_type, TransactionType::InviteClient);
    assert_eq!(tx.state, TransactionState::Calling);

    tx.send().await.expect("send invite");
    let sent = peer.from_ua.recv().await.expect("invite on the wire");
    let sent_req = match sent {
        SipMessage::Request(req) => req,
        other => panic!("expected request, got {}", other),
    };

    peer.to_ua
        .send(make_response(&sent_req, rsip::StatusCode::Ringing, Some("totag1")).into())
        .unwrap();
    match tx.receive().await {
        Some(TransactionOutput::Message(SipMessage::Response(resp))) => {
            assert_eq!(resp.status_code, rsip::StatusCode::Ringing);
        }
        other => panic!("expected 180, got {:?}", other),
    }
    assert_eq!(tx.state, TransactionState::Proceeding);

    peer.to_ua
        .send(make_response(&sent_req, rsip::StatusCode::OK, Some("totag1")).into())
        .unwrap();
    match tx.receive().await {
        Some(TransactionOutput::Message(SipMessage::Response(resp))) => {
            assert_eq!(resp.status_code, rsip::StatusCode::OK);
        }
        other => panic!("expected 200, got {:?}", other),
    }
    assert_eq!(tx.state, TransactionState::Accepted);

    // a retransmitted 2xx is delivered again for re-ACKing
    peer.to_ua
        .send(make_response(&sent_req, rsip::StatusCode::OK, Some("totag1")).into())
        .unwrap();
    match tx.receive().await {
        Some(TransactionOutput::Message(SipMessage::Response(resp))) => {
            assert_eq!(resp.status_code, rsip::StatusCode::OK);
        }
        other => panic!("expected retransmitted 200, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invite_client_rejection_acks_automatically() {
    use rsip::prelude::HeadersExt;
    let mut peer = test_core().await;

    let invite = make_request(rsip::Method::Invite, "z9hG4bKict2", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key, invite.clone(), peer.core.clone());
    tx.send().await.expect("send invite");
    peer.from_ua.recv().await.expect("invite on the wire");

    peer.to_ua
        .send(make_response(&invite, rsip::StatusCode::BusyHere, Some("totag2")).into())
        .unwrap();
    match tx.receive().await {
        Some(TransactionOutput::Message(SipMessage::Response(resp))) => {
            assert_eq!(resp.status_code, rsip::StatusCode::BusyHere);
        }
        other => panic!("expected 486, got {:?}", other),
    }
    assert_eq!(tx.state, TransactionState::Terminated);

    // the machine ACKs the rejection itself, branch and CSeq intact
    let acked = peer.from_ua.recv().await.expect("ack on the wire");
    match acked {
        SipMessage::Request(req) => {
            assert_eq!(req.method, rsip::Method::Ack);
            assert_eq!(req.cseq_header().unwrap().seq().unwrap(), 1);
            assert!(req
                .via_header()
                .unwrap()
                .to_string()
                .contains("z9hG4bKict2"));
            // To mirrors the response, including its tag
            assert!(req.to_header().unwrap().to_string().contains("totag2"));
        }
        other => panic!("expected ACK, got {}", other),
    }
}

#[tokio::test]
async fn test_non_invite_client_terminates_on_final() {
    let mut peer = test_core().await;

    let register = make_request(rsip::Method::Register, "z9hG4bKnict1", 1);
    let key = TransactionKey::from_request(&register, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key, register.clone(), peer.core.clone());
    assert_eq!(tx.transaction_type, TransactionType::NonInviteClient);
    assert_eq!(tx.state, TransactionState::Trying);
    tx.send().await.expect("send register");
    peer.from_ua.recv().await.expect("register on the wire");

    peer.to_ua
        .send(make_response(&register, rsip::StatusCode::OK, Some("totag3")).into())
        .unwrap();
    match tx.receive().await {
        Some(TransactionOutput::Message(SipMessage::Response(resp))) => {
            assert_eq!(resp.status_code, rsip::StatusCode::OK);
        }
        other => panic!("expected 200, got {:?}", other),
    }
    assert_eq!(tx.state, TransactionState::Terminated);
    assert!(tx.receive().await.is_none());
}

#[tokio::test]
async fn test_responses_delivered_in_arrival_order() {
    let mut peer = test_core().await;

    let invite = make_request(rsip::Method::Invite, "z9hG4bKict3", 1);
    let key = TransactionKey::from_request(&invite, TransactionRole::Client).unwrap();
    let mut tx = Transaction::new_client(key, invite.clone(), peer.core.clone());
    tx.send().await.expect("send invite");
    peer.from_ua.recv().await.expect("invite on the wire");

    peer.to_ua
        .send(make_response(&invite, rsip::StatusCode::Trying, None).into())
        .unwrap();
    peer.to_ua
        .send(make_response(&invite, rsip::StatusCode::Ringing, Some("t")).into())
        .unwrap();
    peer.to_ua
        .send(make_response(&invite, rsip::StatusCode::SessionProgress, Some("t")).into())
        .unwrap();

    let mut seen = vec![];
    for _ in 0..3 {
        match tx.receive().await {
            Some(TransactionOutput::Message(SipMessage::Response(resp))) => {
                seen.push(resp.status_code.code());
            }
            other => panic!("expected provisional, got {:?}", other),
        }
    }
    assert_eq!(seen, vec![100, 180, 183]);
}
