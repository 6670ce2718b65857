use super::{make_response, UserAgentInner, ALLOWED_METHODS};
use crate::{
    dialog::DialogId,
    rsip_ext::header_value,
    session::SessionInner,
    transaction::key::{TransactionKey, TransactionRole},
    transaction::transaction::Transaction,
    ua::events::{IncomingMessage, Originator, UaEvent},
};
use rsip::{
    prelude::{HasHeaders, HeadersExt, UntypedHeader},
    Header, Method, Request, Response, StatusCode,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inbound request routing. The transaction layer has
/// already absorbed retransmissions; everything arriving here needs
/// a fresh server transaction or is a stray ACK.
pub(crate) async fn dispatch_request(ua: &Arc<UserAgentInner>, request: Request) {
    if !validate_mandatory_headers(ua, &request).await {
        return;
    }

    // 1. requests for someone else; the random contact user counts
    // as ours since in-dialog targets route to it
    let ruri_user = request
        .uri
        .auth
        .as_ref()
        .map(|auth| auth.user.clone())
        .unwrap_or_default();
    let contact_user = ua
        .contact_uri()
        .auth
        .as_ref()
        .map(|auth| auth.user.clone())
        .unwrap_or_default();
    if !matches!(request.method, Method::Ack)
        && ruri_user != ua.settings.user
        && ruri_user != contact_user
    {
        debug!("request for unknown user {}", ruri_user);
        reply_outside_transaction(ua, &request, StatusCode::NotFound).await;
        return;
    }

    let to_tag = request
        .to_header()
        .ok()
        .and_then(|to| to.tag().ok().flatten())
        .map(|tag| tag.value().to_string());

    match request.method {
        Method::Ack => {
            dispatch_ack(ua, request).await;
            return;
        }
        Method::Cancel => {
            dispatch_cancel(ua, request).await;
            return;
        }
        _ => {}
    }

    // 3. a server transaction for everything else
    let key = match TransactionKey::from_request(&request, TransactionRole::Server) {
        Ok(key) => key,
        Err(e) => {
            warn!("cannot key inbound request: {}", e);
            return;
        }
    };
    let mut tx = Transaction::new_server(key, request.clone(), ua.core.clone());

    // 4. in-dialog requests
    if let Some(to_tag) = to_tag {
        let dialog_id = match DialogId::from_inbound_request(&request) {
            Ok(id) => id,
            Err(_) => {
                tx.respond(make_response(
                    &request,
                    StatusCode::CallTransactionDoesNotExist,
                    None,
                    vec![],
                    None,
                ))
                .await
                .ok();
                return;
            }
        };

        if let Some(session) = ua.find_session_by_dialog(&dialog_id) {
            session.inner.receive_request(tx).await;
            return;
        }

        // NOTIFY with no dialog: route by session (transfer NOTIFYs
        // may beat the dialog into the maps)
        if request.method == Method::Notify {
            let call_id = request
                .call_id_header()
                .map(|h| h.value().to_string())
                .unwrap_or_default();
            let from_tag = request
                .from_header()
                .ok()
                .and_then(|f| f.tag().ok().flatten())
                .map(|t| t.value().to_string())
                .unwrap_or_default();
            if let Some(session) = ua.find_session(&call_id, &from_tag, Some(&to_tag)) {
                session.inner.receive_request(tx).await;
                return;
            }
        }

        tx.respond(make_response(
            &request,
            StatusCode::CallTransactionDoesNotExist,
            None,
            vec![],
            None,
        ))
        .await
        .ok();
        return;
    }

    // 5. out-of-dialog requests
    match request.method {
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
        Method::Message => {
            crate::message::receive_message(ua, tx).await;
        }
        Method::Invite => {
            // an unregistered UA is unreachable on purpose
            let registered = ua
                .registrator
                .lock()
                .unwrap()
                .as_ref()
                .map(|r| r.is_registered())
                .unwrap_or(false);
            if ua.settings.config.register && !registered {
                tx.respond(make_response(&request, StatusCode::Gone, None, vec![], None))
                    .await
                    .ok();
                return;
            }
            if let Err(e) = SessionInner::new_incoming(ua.clone(), tx).await {
                info!("inbound INVITE rejected: {}", e);
            }
        }
        Method::Bye => {
            tx.respond(make_response(
                &request,
                StatusCode::CallTransactionDoesNotExist,
                None,
                vec![],
                None,
            ))
            .await
            .ok();
        }
        _ => {
            tx.respond(make_response(
                &request,
                StatusCode::MethodNotAllowed,
                None,
                vec![Header::Allow(ALLOWED_METHODS.into())],
                None,
            ))
            .await
            .ok();
        }
    }
}

/// ACK with no matching transaction: route to the session by dialog,
/// silently drop otherwise.
async fn dispatch_ack(ua: &Arc<UserAgentInner>, request: Request) {
    if let Ok(dialog_id) = DialogId::from_inbound_request(&request) {
        if let Some(session) = ua.find_session_by_dialog(&dialog_id) {
            session.inner.receive_ack(request).await;
            return;
        }
    }
    debug!("dropping stray ACK");
}

/// CANCEL routes to the ringing session; 481 when none matches.
async fn dispatch_cancel(ua: &Arc<UserAgentInner>, request: Request) {
    let key = match TransactionKey::from_request(&request, TransactionRole::Server) {
        Ok(key) => key,
        Err(_) => return,
    };
    let mut tx = Transaction::new_server(key, request.clone(), ua.core.clone());

    let call_id = request
        .call_id_header()
        .map(|h| h.value().to_string())
        .unwrap_or_default();
    let from_tag = request
        .from_header()
        .ok()
        .and_then(|f| f.tag().ok().flatten())
        .map(|t| t.value().to_string())
        .unwrap_or_default();

    match ua.find_session(&call_id, &from_tag, None) {
        Some(session) => {
            session.inner.receive_cancel(tx).await;
        }
        None => {
            tx.respond(make_response(
                &request,
                StatusCode::CallTransactionDoesNotExist,
                None,
                vec![],
                None,
            ))
            .await
            .ok();
        }
    }
}

/// Responses the transaction layer did not claim: nothing to do but
/// log; retransmitted 2xx to INVITE are claimed by the lingering
/// client transaction instead.
pub(crate) fn dispatch_stray_response(_ua: &Arc<UserAgentInner>, response: Response) {
    debug!(
        "dropping stray response {} {}",
        response.status_code,
        response
            .cseq_header()
            .map(|c| c.to_string())
            .unwrap_or_default()
    );
}

/// §4.2: To, From, Call-ID, CSeq and Via are mandatory; reject
/// what we can with a best-effort 400.
async fn validate_mandatory_headers(ua: &Arc<UserAgentInner>, request: &Request) -> bool {
    let complete = request.to_header().is_ok()
        && request.from_header().is_ok()
        && request.call_id_header().is_ok()
        && request.cseq_header().is_ok()
        && request.via_header().is_ok()
        && header_value(request.headers(), "Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map(|len| len == request.body.len())
            .unwrap_or(true);
    if complete {
        return true;
    }
    info!("malformed request, replying 400 when possible");
    if request.via_header().is_ok() && request.cseq_header().is_ok() {
        let bad = make_response(request, StatusCode::BadRequest, None, vec![], None);
        ua.core.transport.send(bad.into()).await.ok();
    }
    false
}

/// A final response sent outside any transaction (pre-transaction
/// rejections like 404).
async fn reply_outside_transaction(
    ua: &Arc<UserAgentInner>,
    request: &Request,
    status: StatusCode,
) {
    if request.method == Method::Ack {
        return;
    }
    let key = match TransactionKey::from_request(request, TransactionRole::Server) {
        Ok(key) => key,
        Err(_) => return,
    };
    let mut tx = Transaction::new_server(key, request.clone(), ua.core.clone());
    tx.respond(make_response(request, status, None, vec![], None))
        .await
        .ok();
}

/// Emit `newMessage` and answer 200 for an out-of-dialog MESSAGE.
pub(crate) fn incoming_message_event(ua: &Arc<UserAgentInner>, request: &Request) {
    let message = IncomingMessage {
        from: request
            .from_header()
            .map(|h| h.value().to_string())
            .unwrap_or_default(),
        to: request
            .to_header()
            .map(|h| h.value().to_string())
            .unwrap_or_default(),
        content_type: header_value(request.headers(), "Content-Type"),
        body: request.body.clone(),
    };
    ua.emit(UaEvent::NewMessage {
        message,
        originator: Originator::Remote,
    });
}
