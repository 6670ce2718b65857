use super::{channel::ChannelConnection, Connection, ServerSet, TransportEvent, WsTransport};
use crate::config::ServerConfig;
use rsip::SipMessage;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

const OPTIONS_FRAME: &str = "OPTIONS sip:carol@chicago.com SIP/2.0\r\n\
Via: SIP/2.0/WSS pc33.atlanta.com;branch=z9hG4bKhjhs8ass877\r\n\
Max-Forwards: 70\r\n\
To: <sip:carol@chicago.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710\r\n\
CSeq: 63104 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";

fn test_transport() -> (
    WsTransport,
    super::TransportReceiver,
    UnboundedSender<SipMessage>,
    UnboundedReceiver<SipMessage>,
    Connection,
) {
    let (event_tx, event_rx) = unbounded_channel();
    let (peer_tx, ua_rx) = unbounded_channel();
    let (ua_tx, peer_rx) = unbounded_channel();
    let connection: Connection = ChannelConnection::new(ua_rx, ua_tx).into();
    let servers = ServerSet::new(
        &[ServerConfig::new("wss://sip.example.com")],
        Duration::from_secs(2),
        Duration::from_secs(30),
    );
    let transport = WsTransport::new(servers, event_tx, CancellationToken::new());
    (transport, event_rx, peer_tx, peer_rx, connection)
}

#[tokio::test]
async fn test_connected_event_and_message_delivery() {
    let (transport, mut events, peer_tx, _peer_rx, connection) = test_transport();

    let serve = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport.serve_connection(connection, None).await;
        })
    };

    match events.recv().await {
        Some(TransportEvent::Connected) => {}
        other => panic!("expected Connected, got {:?}", other),
    }
    assert!(transport.is_connected());

    let msg = SipMessage::try_from(OPTIONS_FRAME).expect("parse frame");
    peer_tx.send(msg).expect("peer send");
    match events.recv().await {
        Some(TransportEvent::Message(SipMessage::Request(req))) => {
            assert_eq!(req.method, rsip::Method::Options);
        }
        other => panic!("expected Message, got {:?}", other),
    }

    drop(peer_tx);
    match events.recv().await {
        Some(TransportEvent::Closed(_)) => {}
        other => panic!("expected Closed, got {:?}", other),
    }
    serve.await.unwrap();
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_outbound_send_reaches_peer() {
    let (transport, mut events, _peer_tx, mut peer_rx, connection) = test_transport();

    let serve = {
        let transport = transport.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            transport.serve_connection(connection, None).await;
        })
    };
    // wait for Connected before sending
    events.recv().await;

    let msg = SipMessage::try_from(OPTIONS_FRAME).expect("parse frame");
    transport.send(msg).await.expect("send");
    let received = peer_rx.recv().await.expect("peer received");
    assert!(matches!(received, SipMessage::Request(_)));

    transport.shutdown().await;
    serve.abort();
    let _ = serve.await;
}
