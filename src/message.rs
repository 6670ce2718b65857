use crate::{
    transaction::{
        make_call_id, make_tag,
        sender::{RequestSender, TransactionUser},
        transaction::Transaction,
    },
    ua::{dispatcher::incoming_message_event, events::Cause, make_response, UserAgentInner},
    Error, Result,
};
use async_trait::async_trait;
use rand::Rng;
use rsip::{prelude::UntypedHeader, Header, Method, StatusCode, StatusCodeKind};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

/// One fire-and-forget MESSAGE: no dialog, lives until the final
/// response, the timeout, or a transport error.
struct MessageApplicant {
    outcome: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl MessageApplicant {
    fn resolve(&self, result: Result<()>) {
        if let Some(sender) = self.outcome.lock().unwrap().take() {
            sender.send(result).ok();
        }
    }
}

#[async_trait]
impl TransactionUser for MessageApplicant {
    async fn receive_response(&self, response: rsip::Response) {
        match response.status_code.kind() {
            StatusCodeKind::Provisional => {}
            StatusCodeKind::Successful => self.resolve(Ok(())),
            _ => {
                let code = response.status_code.code();
                let cause = Cause::from_status(code);
                self.resolve(Err(Error::Error(format!(
                    "MESSAGE rejected: {} ({})",
                    code, cause
                ))));
            }
        }
    }

    async fn on_request_timeout(&self) {
        self.resolve(Err(Error::Timeout("MESSAGE timed out".to_string())));
    }

    async fn on_transport_error(&self, error: String) {
        self.resolve(Err(Error::Transport(error)));
    }
}

pub(crate) async fn send_message(
    ua: &Arc<UserAgentInner>,
    target: &str,
    body: Vec<u8>,
    content_type: &str,
) -> Result<()> {
    let target = ua.normalize_target(target)?;
    let call_id = make_call_id(&ua.settings.via_host).value().to_string();
    let request = ua.create_request(
        Method::Message,
        target.clone(),
        target,
        &make_tag().to_string(),
        &call_id,
        rand::rng().random_range(1..10000),
        vec![Header::ContentType(content_type.to_string().into())],
        Some(body),
    );

    let (sender, receiver) = oneshot::channel();
    let applicant = Arc::new(MessageApplicant {
        outcome: Mutex::new(Some(sender)),
    });
    RequestSender::new(
        ua.core.clone(),
        request,
        applicant,
        ua.credential(),
        ua.is_user_closed(),
    )
    .spawn();

    receiver
        .await
        .map_err(|_| Error::Error("MESSAGE sender vanished".to_string()))?
}

/// Inbound MESSAGE: 200 while the transaction is fresh, then the
/// `newMessage` event.
pub(crate) async fn receive_message(ua: &Arc<UserAgentInner>, mut tx: Transaction) {
    let request = tx.original.clone();
    debug!("incoming MESSAGE from {}", request.uri);
    let ok = make_response(&request, StatusCode::OK, None, vec![], None);
    tx.respond(ok).await.ok();
    incoming_message_event(ua, &request);
}
