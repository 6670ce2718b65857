use super::{
    key::{TransactionKey, TransactionRole},
    timer::{TimerHandle, TimerQueue},
    TransactionState, TransactionTimer, TransactionType, T4, TIMER_B, TIMER_F, TIMER_H, TIMER_M,
};
use crate::{transport::WsTransport, Error, Result};
use rsip::{prelude::HeadersExt, Method, Request, Response, SipMessage, StatusCodeKind};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(super) const TIMER_INTERVAL: Duration = Duration::from_millis(20);

/// Events delivered into a transaction's channel by the core.
pub enum TransactionEvent {
    Received(SipMessage),
    Timer(TransactionTimer),
    TransportError(String),
    Terminate,
}

pub type TransactionEventSender = UnboundedSender<TransactionEvent>;
pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;

/// What a transaction hands its transaction user from `receive()`.
#[derive(Debug)]
pub enum TransactionOutput {
    Message(SipMessage),
    /// Timer B/F/H expiry: the peer never produced the awaited
    /// response or ACK.
    Timeout,
    TransportError(String),
}

/// Shared state of the transaction layer: the four live machines in
/// one map keyed by [`TransactionKey`], terminated machines kept
/// briefly for retransmission replay, and the timer queue driving
/// every machine.
pub struct TransactionCore {
    pub timers: TimerQueue<TransactionTimer>,
    pub transport: WsTransport,
    transactions: Mutex<HashMap<TransactionKey, TransactionEventSender>>,
    finished: Mutex<HashMap<TransactionKey, Option<SipMessage>>>,
    cancel_token: CancellationToken,
    timer_interval: Duration,
}

pub type TransactionCoreRef = Arc<TransactionCore>;

impl TransactionCore {
    pub fn new(
        transport: WsTransport,
        cancel_token: CancellationToken,
        timer_interval: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(TransactionCore {
            timers: TimerQueue::new(),
            transport,
            transactions: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            cancel_token,
            timer_interval: timer_interval.unwrap_or(TIMER_INTERVAL),
        })
    }

    /// Drive the timer queue until the owning UA shuts down.
    pub async fn process_timer(&self) {
        while !self.cancel_token.is_cancelled() {
            for timer in self.timers.due(Instant::now()) {
                if let TransactionTimer::Cleanup(key) = timer {
                    self.transactions.lock().unwrap().remove(&key);
                    self.finished.lock().unwrap().remove(&key);
                    continue;
                }
                let sender = self.transactions.lock().unwrap().get(timer.key()).cloned();
                if let Some(sender) = sender {
                    sender.send(TransactionEvent::Timer(timer)).ok();
                }
            }
            tokio::time::sleep(self.timer_interval).await;
        }
    }

    pub fn live_count(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    /// Transport failure is reported to every applicant holding a
    /// transaction.
    pub fn on_transport_error(&self, error: &str) {
        let senders: Vec<TransactionEventSender> = self
            .transactions
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for sender in senders {
            sender
                .send(TransactionEvent::TransportError(error.to_string()))
                .ok();
        }
    }

    /// Route one inbound message into the transaction layer.
    ///
    /// Returns the message back when no machine claims it: a request
    /// that needs a new server transaction, or a stray response.
    /// Retransmitted requests matching a live or recently finished
    /// server transaction are absorbed, replaying the last response.
    pub async fn handle_message(&self, msg: SipMessage) -> Result<Option<SipMessage>> {
        let key = match &msg {
            SipMessage::Request(req) => {
                TransactionKey::from_request(req, TransactionRole::Server)?
            }
            SipMessage::Response(resp) => TransactionKey::from_response(resp)?,
        };

        let sender = self.transactions.lock().unwrap().get(&key).cloned();
        if let Some(sender) = sender {
            sender.send(TransactionEvent::Received(msg)).ok();
            return Ok(None);
        }

        if let SipMessage::Request(req) = &msg {
            // ACK for a non-2xx final targets the INVITE machine
            if req.method == Method::Ack {
                let sibling = key.invite_sibling();
                let sender = self.transactions.lock().unwrap().get(&sibling).cloned();
                if let Some(sender) = sender {
                    sender.send(TransactionEvent::Received(msg)).ok();
                    return Ok(None);
                }
                if self.finished.lock().unwrap().contains_key(&sibling) {
                    trace!(key = %sibling, "absorbing ACK for finished transaction");
                    return Ok(None);
                }
                return Ok(Some(msg));
            }

            let replay = match self.finished.lock().unwrap().get(&key) {
                Some(Some(SipMessage::Response(last))) => Some(last.clone()),
                Some(_) => {
                    trace!(key = %key, "absorbing retransmission, nothing to replay");
                    return Ok(None);
                }
                None => None,
            };
            if let Some(last) = replay {
                debug!(key = %key, "replaying last response for retransmission");
                self.transport.send(last.into()).await.ok();
                return Ok(None);
            }
        }

        Ok(Some(msg))
    }

    fn attach(&self, key: &TransactionKey, sender: TransactionEventSender) {
        self.transactions
            .lock()
            .unwrap()
            .insert(key.clone(), sender);
    }

    fn detach(&self, key: &TransactionKey, last_message: Option<SipMessage>) {
        self.transactions.lock().unwrap().remove(key);

        if let Some(msg) = last_message {
            if self.finished.lock().unwrap().contains_key(key) {
                return;
            }
            let linger = if matches!(msg, SipMessage::Request(_)) {
                T4
            } else {
                TIMER_B
            };
            self.timers
                .schedule(linger, TransactionTimer::Cleanup(key.clone()));
            self.finished
                .lock()
                .unwrap()
                .insert(key.clone(), Some(msg));
        }
    }
}

/// One of the four RFC 3261 §17 machines.
///
/// Client transactions are created with [`Transaction::new_client`],
/// sent with `send()` and then driven by awaiting `receive()`.
/// Server transactions are created from an inbound request and
/// answered with `respond()`.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    pub(crate) core: TransactionCoreRef,
    last_response: Option<Response>,
    last_ack: Option<Request>,
    tu_receiver: TransactionEventReceiver,
    tu_sender: TransactionEventSender,
    timer_wait: Option<TimerHandle>,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        core: TransactionCoreRef,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        let state = match transaction_type {
            TransactionType::InviteClient => TransactionState::Calling,
            TransactionType::NonInviteClient => TransactionState::Trying,
            TransactionType::InviteServer => TransactionState::Proceeding,
            TransactionType::NonInviteServer => TransactionState::Trying,
        };
        Self {
            transaction_type,
            key,
            original,
            state,
            core,
            last_response: None,
            last_ack: None,
            tu_receiver,
            tu_sender,
            timer_wait: None,
        }
    }

    pub fn new_client(key: TransactionKey, original: Request, core: TransactionCoreRef) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::InviteClient,
            _ => TransactionType::NonInviteClient,
        };
        Transaction::new(tx_type, key, original, core)
    }

    pub fn new_server(key: TransactionKey, original: Request, core: TransactionCoreRef) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::InviteServer,
            _ => TransactionType::NonInviteServer,
        };
        let tx = Transaction::new(tx_type, key, original, core);
        tx.core.attach(&tx.key, tx.tu_sender.clone());
        tx
    }

    pub fn is_client(&self) -> bool {
        matches!(
            self.transaction_type,
            TransactionType::InviteClient | TransactionType::NonInviteClient
        )
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TransactionState::Terminated
    }

    /// Dispatch the client request and start the response-wait timer.
    pub async fn send(&mut self) -> Result<()> {
        if !self.is_client() {
            return Err(Error::Transaction(
                "send is only valid for client transactions".to_string(),
                self.key.clone(),
            ));
        }

        self.core
            .transport
            .send(self.original.clone().into())
            .await?;
        self.core.attach(&self.key, self.tu_sender.clone());

        // WebSocket is reliable: no retransmission timer, only the
        // overall wait bound.
        let (wait, timer) = match self.transaction_type {
            TransactionType::InviteClient => (TIMER_B, TransactionTimer::TimerB(self.key.clone())),
            _ => (TIMER_F, TransactionTimer::TimerF(self.key.clone())),
        };
        self.timer_wait
            .take()
            .map(|h| self.core.timers.cancel(h));
        self.timer_wait.replace(self.core.timers.schedule(wait, timer));
        Ok(())
    }

    /// Send a response on a server transaction.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.is_client() {
            return Err(Error::Transaction(
                "respond is only valid for server transactions".to_string(),
                self.key.clone(),
            ));
        }
        if self.state == TransactionState::Terminated {
            return Err(Error::Transaction(
                "transaction already terminated".to_string(),
                self.key.clone(),
            ));
        }

        self.core
            .transport
            .send(response.clone().into())
            .await?;

        match response.status_code.kind() {
            StatusCodeKind::Provisional => {
                self.last_response.replace(response);
                self.transition(TransactionState::Proceeding);
            }
            StatusCodeKind::Successful => {
                // the 2xx retransmit discipline for INVITE belongs to
                // the invite session, every machine ends here
                self.last_response.replace(response);
                self.transition(TransactionState::Terminated);
            }
            _ => {
                self.last_response.replace(response);
                match self.transaction_type {
                    TransactionType::InviteServer => {
                        // wait for the ACK, bounded by Timer H
                        self.transition(TransactionState::Completed);
                    }
                    _ => self.transition(TransactionState::Terminated),
                }
            }
        }
        Ok(())
    }

    /// ACK for a non-2xx final, generated inside the transaction per
    /// RFC 3261 §17.1.1.3: same branch and CSeq number, To taken from
    /// the response.
    fn ack_for_rejection(&self, resp: &Response) -> Option<Request> {
        let mut headers: Vec<rsip::Header> = vec![];
        for header in self.original.headers.iter() {
            match header {
                rsip::Header::Via(_)
                | rsip::Header::From(_)
                | rsip::Header::CallId(_)
                | rsip::Header::MaxForwards(_)
                | rsip::Header::Route(_) => headers.push(header.clone()),
                _ => {}
            }
        }
        for header in resp.headers.iter() {
            if let rsip::Header::To(_) = header {
                headers.push(header.clone());
            }
        }
        let cseq = self.original.cseq_header().ok()?.seq().ok()?;
        headers.push(rsip::Header::CSeq(
            rsip::typed::CSeq {
                seq: cseq,
                method: Method::Ack,
            }
            .into(),
        ));
        headers.push(rsip::Header::ContentLength(0u32.into()));
        Some(Request {
            method: Method::Ack,
            uri: self.original.uri.clone(),
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        })
    }

    /// Await the next thing the transaction user must see. `None`
    /// means the machine reached `Terminated` and the channel drained.
    pub async fn receive(&mut self) -> Option<TransactionOutput> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg) => {
                    let out = match msg {
                        SipMessage::Request(req) => self.on_request(req),
                        SipMessage::Response(resp) => self.on_response(resp),
                    };
                    if let Some(out) = out {
                        return Some(out);
                    }
                }
                TransactionEvent::Timer(timer) => {
                    if let Some(out) = self.on_timer(timer) {
                        return Some(out);
                    }
                }
                TransactionEvent::TransportError(error) => {
                    self.transition(TransactionState::Terminated);
                    return Some(TransactionOutput::TransportError(error));
                }
                TransactionEvent::Terminate => return None,
            }
        }
        None
    }

    fn on_request(&mut self, req: Request) -> Option<TransactionOutput> {
        if self.is_client() {
            return None;
        }
        match self.state {
            TransactionState::Completed => {
                if req.method == Method::Ack {
                    self.transition(TransactionState::Confirmed);
                    // reliable transport: Timer I is zero
                    self.transition(TransactionState::Terminated);
                    return Some(TransactionOutput::Message(SipMessage::Request(req)));
                }
                None
            }
            _ => {
                // retransmission of the original request while still
                // processing: replay what we last said, if anything
                if req.method == self.original.method {
                    if let Some(last) = self.last_response.clone() {
                        let transport = self.core.transport.clone();
                        tokio::spawn(async move {
                            transport.send(last.into()).await.ok();
                        });
                    }
                    return None;
                }
                Some(TransactionOutput::Message(SipMessage::Request(req)))
            }
        }
    }

    fn on_response(&mut self, resp: Response) -> Option<TransactionOutput> {
        if !self.is_client() {
            return None;
        }
        match self.state {
            TransactionState::Calling | TransactionState::Trying | TransactionState::Proceeding => {
                match resp.status_code.kind() {
                    StatusCodeKind::Provisional => {
                        self.transition(TransactionState::Proceeding);
                    }
                    StatusCodeKind::Successful => {
                        self.last_response.replace(resp.clone());
                        if self.transaction_type == TransactionType::InviteClient {
                            // RFC 6026: linger to pass 2xx
                            // retransmissions up for re-ACKing
                            self.transition(TransactionState::Accepted);
                        } else {
                            self.transition(TransactionState::Terminated);
                        }
                    }
                    _ => {
                        self.last_response.replace(resp.clone());
                        if self.transaction_type == TransactionType::InviteClient {
                            if let Some(ack) = self.ack_for_rejection(&resp) {
                                self.last_ack.replace(ack.clone());
                                let transport = self.core.transport.clone();
                                tokio::spawn(async move {
                                    transport.send(ack.into()).await.ok();
                                });
                            }
                        }
                        self.transition(TransactionState::Terminated);
                    }
                }
                Some(TransactionOutput::Message(SipMessage::Response(resp)))
            }
            TransactionState::Accepted => {
                if resp.status_code.kind() == StatusCodeKind::Successful {
                    return Some(TransactionOutput::Message(SipMessage::Response(resp)));
                }
                None
            }
            TransactionState::Completed => {
                // retransmitted final: re-ACK if we already ACKed
                if let Some(ack) = self.last_ack.clone() {
                    let transport = self.core.transport.clone();
                    tokio::spawn(async move {
                        transport.send(ack.into()).await.ok();
                    });
                }
                None
            }
            _ => None,
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Option<TransactionOutput> {
        match timer {
            TransactionTimer::TimerB(_) | TransactionTimer::TimerF(_) => match self.state {
                TransactionState::Calling
                | TransactionState::Trying
                | TransactionState::Proceeding => {
                    self.transition(TransactionState::Terminated);
                    Some(TransactionOutput::Timeout)
                }
                _ => None,
            },
            TransactionTimer::TimerH(_) => {
                if self.state == TransactionState::Completed {
                    self.transition(TransactionState::Terminated);
                    return Some(TransactionOutput::Timeout);
                }
                None
            }
            TransactionTimer::TimerM(_) => {
                if self.state == TransactionState::Accepted {
                    self.transition(TransactionState::Terminated);
                }
                None
            }
            TransactionTimer::Cleanup(_) => None,
        }
    }

    fn transition(&mut self, state: TransactionState) {
        if self.state == state {
            return;
        }
        match state {
            TransactionState::Completed => {
                self.cancel_wait_timer();
                if self.transaction_type == TransactionType::InviteServer {
                    self.timer_wait.replace(
                        self.core
                            .timers
                            .schedule(TIMER_H, TransactionTimer::TimerH(self.key.clone())),
                    );
                }
            }
            TransactionState::Accepted => {
                self.cancel_wait_timer();
                self.timer_wait.replace(
                    self.core
                        .timers
                        .schedule(TIMER_M, TransactionTimer::TimerM(self.key.clone())),
                );
            }
            TransactionState::Terminated => {
                self.cleanup();
                self.tu_sender.send(TransactionEvent::Terminate).ok();
            }
            _ => {}
        }
        trace!(key = %self.key, "transition: {} -> {}", self.state, state);
        self.state = state;
    }

    fn cancel_wait_timer(&mut self) {
        self.timer_wait.take().map(|h| self.core.timers.cancel(h));
    }

    fn cleanup(&mut self) {
        self.cancel_wait_timer();
        let last_message = match self.transaction_type {
            TransactionType::InviteClient => {
                self.last_ack.take().map(SipMessage::Request)
            }
            TransactionType::InviteServer | TransactionType::NonInviteServer => {
                self.last_response.take().map(SipMessage::Response)
            }
            _ => None,
        };
        self.core.detach(&self.key, last_message);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Terminated {
            warn!(key = %self.key, "transaction dropped in state {}", self.state);
        }
        self.cleanup();
    }
}
