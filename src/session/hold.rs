use super::{SessionInner, SessionStatus};
use crate::{
    session::timers,
    transaction::sender::{RequestSender, TransactionUser},
    ua::events::{Cause, Originator, SdpType, SessionEvent},
    Error, Result,
};
use async_trait::async_trait;
use rand::Rng;
use rsip::{Header, Method, StatusCodeKind};
use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rewrite `a=` media direction attributes for hold:
///
/// - local-only hold: sendrecv -> sendonly, recvonly -> inactive
/// - remote-only hold: sendrecv -> recvonly, sendonly -> inactive
/// - both: everything inactive
pub fn mangle_directions(sdp: &str, local_hold: bool, remote_hold: bool) -> String {
    if !local_hold && !remote_hold {
        return sdp.to_string();
    }
    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    sdp.split_inclusive(newline)
        .map(|line| {
            let trimmed = line.trim_end();
            let mangled = match (local_hold, remote_hold) {
                (true, true) => match trimmed {
                    "a=sendrecv" | "a=sendonly" | "a=recvonly" => Some("a=inactive"),
                    _ => None,
                },
                (true, false) => match trimmed {
                    "a=sendrecv" => Some("a=sendonly"),
                    "a=recvonly" => Some("a=inactive"),
                    _ => None,
                },
                (false, true) => match trimmed {
                    "a=sendrecv" => Some("a=recvonly"),
                    "a=sendonly" => Some("a=inactive"),
                    _ => None,
                },
                (false, false) => None,
            };
            match mangled {
                Some(mangled) => format!("{}{}", mangled, newline),
                None => line.to_string(),
            }
        })
        .collect()
}

/// Does a remote offer place us on hold?
pub fn offer_requests_hold(sdp: &str) -> bool {
    let mut saw_direction = false;
    for line in sdp.lines() {
        match line.trim_end() {
            "a=sendonly" | "a=inactive" => {
                saw_direction = true;
            }
            "a=sendrecv" | "a=recvonly" => {
                return false;
            }
            _ => {}
        }
    }
    saw_direction
}

/// Applicant for the re-INVITE/UPDATE renegotiation.
struct RenegotiateApplicant {
    session: Arc<SessionInner>,
    use_update: bool,
    /// What to flip back on failure: (previous local_hold, desired).
    rollback_hold: Option<(bool, bool)>,
}

#[async_trait]
impl TransactionUser for RenegotiateApplicant {
    async fn receive_response(&self, response: rsip::Response) {
        let session = &self.session;
        let status_code = response.status_code.code();
        if response.status_code.kind() == StatusCodeKind::Provisional {
            return;
        }
        let dialog = match session.dialog() {
            Some(dialog) => dialog,
            None => return,
        };
        dialog.end_uac_request();

        match response.status_code.kind() {
            StatusCodeKind::Successful => {
                if !self.use_update {
                    session.send_ack(&dialog).await;
                }
                let answer = String::from_utf8(response.body.clone()).unwrap_or_default();
                if !answer.is_empty() {
                    if let Some(media) = session.media() {
                        if media.set_remote(answer.clone()).await.is_err() {
                            warn!(id = %session.id, "renegotiation answer rejected");
                        } else {
                            session.emit(SessionEvent::Sdp {
                                originator: Originator::Remote,
                                sdp_type: SdpType::Answer,
                                sdp: answer,
                            });
                        }
                    }
                }
                timers::on_uac_final_response(session, &response);
                session.rtc_ready.store(true, Ordering::Relaxed);
                if let Some((_, desired)) = self.rollback_hold {
                    if desired {
                        session.emit(SessionEvent::Hold {
                            originator: Originator::Local,
                        });
                    } else {
                        session.emit(SessionEvent::Unhold {
                            originator: Originator::Local,
                        });
                    }
                }
            }
            _ if status_code == 491 => {
                // glare: this 491 answers a re-offer we sent, so we
                // retry in the UAC window U(2.1, 4.0) s (RFC 3261 §14.1)
                session.rtc_ready.store(true, Ordering::Relaxed);
                let wait_ms = rand::rng().random_range(2100..=4000u64);
                info!(id = %session.id, "491 glare, retrying in {} ms", wait_ms);
                let session = session.clone();
                let use_update = self.use_update;
                let desired = self.rollback_hold.map(|(_, desired)| desired);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    if session.status() != SessionStatus::Confirmed {
                        return;
                    }
                    let result = match desired {
                        Some(desired) => do_hold(&session, desired).await,
                        None => session.renegotiate(use_update).await,
                    };
                    if let Err(e) = result {
                        warn!(id = %session.id, "glare retry failed: {}", e);
                    }
                });
            }
            _ if status_code == 408 || status_code == 481 => {
                // RFC 3261 §12.2.1.2: these kill the dialog
                session.rtc_ready.store(true, Ordering::Relaxed);
                session.emit_ended(Originator::System, Cause::RequestTimeout);
                session.close().await;
            }
            _ => {
                // keep the session, roll the intent back
                session.rtc_ready.store(true, Ordering::Relaxed);
                debug!(id = %session.id, status_code, "renegotiation rejected");
                if let Some((previous, _)) = self.rollback_hold {
                    session.local_hold.store(previous, Ordering::Relaxed);
                }
            }
        }
    }

    async fn on_request_timeout(&self) {
        let session = &self.session;
        if let Some(dialog) = session.dialog() {
            dialog.end_uac_request();
        }
        session.rtc_ready.store(true, Ordering::Relaxed);
        session.emit_ended(Originator::System, Cause::RequestTimeout);
        session.close().await;
    }

    async fn on_transport_error(&self, _error: String) {
        let session = &self.session;
        if let Some(dialog) = session.dialog() {
            dialog.end_uac_request();
        }
        session.rtc_ready.store(true, Ordering::Relaxed);
        session.on_transport_closed().await;
    }

    fn next_cseq_for_retry(&self) -> Option<u32> {
        self.session.dialog().map(|d| d.next_local_seq())
    }
}

impl SessionInner {
    pub(crate) async fn hold(self: &Arc<Self>, hold: bool) -> Result<()> {
        let previous = self.local_hold.load(Ordering::Relaxed);
        if previous == hold {
            return Ok(());
        }
        self.local_hold.store(hold, Ordering::Relaxed);
        if let Err(e) = do_hold(self, hold).await {
            self.local_hold.store(previous, Ordering::Relaxed);
            return Err(e);
        }
        Ok(())
    }

    /// Send a re-INVITE (or UPDATE) carrying the current local
    /// description. Guard per §4.6.3.
    pub(crate) async fn renegotiate(self: &Arc<Self>, use_update: bool) -> Result<()> {
        send_reoffer(self, use_update, None).await
    }
}

async fn do_hold(session: &Arc<SessionInner>, hold: bool) -> Result<()> {
    let previous = !hold;
    send_reoffer(session, false, Some((previous, hold))).await
}

async fn send_reoffer(
    session: &Arc<SessionInner>,
    use_update: bool,
    rollback_hold: Option<(bool, bool)>,
) -> Result<()> {
    if !session.rtc_ready.load(Ordering::Relaxed) {
        return Err(Error::InvalidState(
            "another offer/answer exchange is in progress".to_string(),
        ));
    }
    let dialog = session.require_dialog()?;
    if dialog.uas_pending_reply() {
        return Err(Error::InvalidState(
            "peer has an exchange in progress".to_string(),
        ));
    }
    if !dialog.try_begin_uac_request() {
        return Err(Error::InvalidState(
            "an exchange is already outstanding".to_string(),
        ));
    }

    session.rtc_ready.store(false, Ordering::Relaxed);
    let offer = match session.build_local_offer().await {
        Ok(offer) => offer,
        Err(e) => {
            session.rtc_ready.store(true, Ordering::Relaxed);
            dialog.end_uac_request();
            return Err(e);
        }
    };

    let method = if use_update {
        Method::Update
    } else {
        Method::Invite
    };
    let mut extra_headers = vec![Header::ContentType("application/sdp".into())];
    if session.ua.settings.config.session_timers {
        if let Some(se) = timers::refresh_header(session) {
            extra_headers.push(se);
        }
    }
    let request = dialog.create_request(
        method,
        extra_headers,
        Some(offer.into_bytes()),
        &session.contact,
        session.ua.user_agent(),
    )?;

    let applicant = Arc::new(RenegotiateApplicant {
        session: session.clone(),
        use_update,
        rollback_hold,
    });
    RequestSender::new(
        session.ua.core.clone(),
        request,
        applicant,
        session.ua.credential(),
        session.ua.is_user_closed(),
    )
    .spawn();
    Ok(())
}
