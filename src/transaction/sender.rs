use super::{
    key::{TransactionKey, TransactionRole},
    make_via_branch,
    transaction::{Transaction, TransactionCoreRef, TransactionOutput},
};
use crate::{
    auth::{Credential, DigestAuth, DigestChallenge},
    rsip_ext::RsipHeadersExt,
    Result,
};
use async_trait::async_trait;
use rsip::{
    prelude::{HasHeaders, HeadersExt, ToTypedHeader},
    Header, Method, SipMessage, StatusCode,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The applicant behind a request sender or transaction.
///
/// One capability set implemented by the invite session, the
/// registrator, outgoing MESSAGE/INFO/DTMF senders and the refer
/// subscriber.
#[async_trait]
pub trait TransactionUser: Send + Sync {
    async fn receive_response(&self, response: rsip::Response);
    async fn on_request_timeout(&self);
    async fn on_transport_error(&self, error: String);
    async fn on_dialog_error(&self) {}
    /// CSeq to use for the digest replay. `None` means one above the
    /// challenged request; dialogs and the registrar allocate from
    /// their own counters instead.
    fn next_cseq_for_retry(&self) -> Option<u32> {
        None
    }
}

/// Wraps one client transaction: dispatches the request, replays it
/// once against a digest challenge, forwards everything else to the
/// applicant.
pub struct RequestSender {
    core: TransactionCoreRef,
    request: rsip::Request,
    applicant: Arc<dyn TransactionUser>,
    credential: Option<Credential>,
    /// UA is in `UserClosed`: only BYE and ACK may still go out.
    user_closed: bool,
}

impl RequestSender {
    pub fn new(
        core: TransactionCoreRef,
        request: rsip::Request,
        applicant: Arc<dyn TransactionUser>,
        credential: Option<Credential>,
        user_closed: bool,
    ) -> Self {
        Self {
            core,
            request,
            applicant,
            credential,
            user_closed,
        }
    }

    /// Run the send in the background.
    pub fn spawn(self) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    pub async fn run(self) {
        let RequestSender {
            core,
            request,
            applicant,
            credential,
            user_closed,
        } = self;

        if user_closed && !matches!(request.method, Method::Bye | Method::Ack) {
            applicant
                .on_transport_error("user agent is closed".to_string())
                .await;
            return;
        }

        let key = match TransactionKey::from_request(&request, TransactionRole::Client) {
            Ok(key) => key,
            Err(e) => {
                warn!("cannot build transaction key: {}", e);
                applicant.on_transport_error(e.to_string()).await;
                return;
            }
        };
        let mut tx = Transaction::new_client(key, request, core.clone());
        if let Err(e) = tx.send().await {
            warn!(key = %tx.key, "request send failed: {}", e);
            applicant.on_transport_error(e.to_string()).await;
            return;
        }

        let mut auth: Option<DigestAuth> = None;
        let mut staled = false;

        while let Some(output) = tx.receive().await {
            match output {
                TransactionOutput::Message(SipMessage::Response(resp)) => {
                    let challenged = matches!(
                        resp.status_code,
                        StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
                    );
                    if challenged && credential.is_some() {
                        match Self::answer_challenge(
                            &core,
                            &tx,
                            &resp,
                            credential.as_ref().unwrap(),
                            &mut auth,
                            &mut staled,
                            applicant.next_cseq_for_retry(),
                        )
                        .await
                        {
                            Ok(Some(mut retry_tx)) => {
                                if let Err(e) = retry_tx.send().await {
                                    applicant.on_transport_error(e.to_string()).await;
                                    return;
                                }
                                tx = retry_tx;
                                continue;
                            }
                            Ok(None) => {
                                // second challenge, surface it
                                applicant.receive_response(resp).await;
                            }
                            Err(e) => {
                                info!(key = %tx.key, "challenge handling failed: {}", e);
                                applicant.receive_response(resp).await;
                            }
                        }
                    } else {
                        applicant.receive_response(resp).await;
                    }
                }
                TransactionOutput::Message(_) => {}
                TransactionOutput::Timeout => {
                    applicant.on_request_timeout().await;
                    return;
                }
                TransactionOutput::TransportError(error) => {
                    applicant.on_transport_error(error).await;
                    return;
                }
            }
        }
    }

    /// Build the replayed transaction for a 401/407, or `None` when
    /// the challenge must be surfaced instead.
    async fn answer_challenge(
        core: &TransactionCoreRef,
        tx: &Transaction,
        resp: &rsip::Response,
        credential: &Credential,
        auth: &mut Option<DigestAuth>,
        staled: &mut bool,
        retry_cseq: Option<u32>,
    ) -> Result<Option<Transaction>> {
        let challenge = DigestChallenge::from_response(resp)?;
        let stale = challenge.stale;

        if auth.is_some() && !(stale && !*staled) {
            // already answered once and the nonce is not stale
            return Ok(None);
        }
        if stale {
            *staled = true;
        }

        let digest = auth.insert(DigestAuth::new(credential.clone(), challenge));
        if !digest.supported() {
            return Ok(None);
        }

        let mut new_req = tx.original.clone();

        let cseq = match retry_cseq {
            Some(cseq) => cseq,
            None => tx.original.cseq_header()?.seq()? + 1,
        };
        new_req.cseq_header_mut()?.mut_seq(cseq)?;

        let authorization = digest.authorization(&new_req.method, &new_req.uri);
        new_req.headers_mut().retain(|h| {
            !matches!(h, Header::Authorization(_) | Header::ProxyAuthorization(_))
        });
        new_req.headers_mut().unique_push(authorization);

        // the replay is a new transaction: fresh branch
        let via = new_req.via_header()?.typed()?;
        let mut via = via.clone();
        via.params.retain(|p| !matches!(p, rsip::Param::Branch(_)));
        via.params.push(make_via_branch());
        let mut headers = new_req.headers().clone();
        crate::header_pop!(headers, Header::Via);
        headers.push_front(Header::Via(via.into()));
        *new_req.headers_mut() = headers;

        debug!(key = %tx.key, cseq, "replaying request with credentials");
        let key = TransactionKey::from_request(&new_req, TransactionRole::Client)?;
        Ok(Some(Transaction::new_client(key, new_req, core.clone())))
    }
}
