use super::{SessionInner, SessionStatus};
use crate::{
    transaction::sender::{RequestSender, TransactionUser},
    ua::events::{Originator, SessionEvent},
    Error, Result,
};
use async_trait::async_trait;
use rsip::{Header, Method};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tracing::{debug, warn};

pub const DEFAULT_DURATION: u64 = 100;
pub const MIN_DURATION: u64 = 70;
pub const MAX_DURATION: u64 = 6000;
pub const DEFAULT_INTER_TONE_GAP: u64 = 500;
pub const MIN_INTER_TONE_GAP: u64 = 50;
/// A `,` in the tone string pauses this long and sends nothing.
pub const COMMA_PAUSE: u64 = 200;

#[derive(Debug, Clone, Copy)]
pub struct DtmfOptions {
    pub duration: u64,
    pub inter_tone_gap: u64,
}

impl Default for DtmfOptions {
    fn default() -> Self {
        Self {
            duration: DEFAULT_DURATION,
            inter_tone_gap: DEFAULT_INTER_TONE_GAP,
        }
    }
}

impl DtmfOptions {
    fn clamped(self) -> Self {
        Self {
            duration: self.duration.clamp(MIN_DURATION, MAX_DURATION),
            inter_tone_gap: self.inter_tone_gap.max(MIN_INTER_TONE_GAP),
        }
    }
}

pub(crate) struct DtmfQueue {
    queue: VecDeque<(char, DtmfOptions)>,
    running: bool,
}

impl DtmfQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            running: false,
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.running = false;
    }
}

fn valid_tone(tone: char) -> bool {
    matches!(tone, '0'..='9' | 'A'..='D' | '#' | '*' | ',')
}

/// RFC 2833 over INFO: `Signal=<tone>\r\nDuration=<ms>`.
pub(crate) fn dtmf_body(tone: char, duration: u64) -> String {
    format!("Signal={}\r\nDuration={}\r\n", tone, duration)
}

pub(crate) fn parse_dtmf_body(body: &[u8]) -> Option<(char, u64)> {
    let text = std::str::from_utf8(body).ok()?;
    let mut tone = None;
    let mut duration = DEFAULT_DURATION;
    for line in text.lines() {
        let mut kv = line.splitn(2, '=');
        match (kv.next().map(str::trim), kv.next().map(str::trim)) {
            (Some(key), Some(value)) if key.eq_ignore_ascii_case("signal") => {
                tone = value.chars().next().map(|c| c.to_ascii_uppercase());
            }
            (Some(key), Some(value)) if key.eq_ignore_ascii_case("duration") => {
                duration = value.parse().unwrap_or(DEFAULT_DURATION);
            }
            _ => {}
        }
    }
    tone.filter(|t| valid_tone(*t)).map(|t| (t, duration))
}

/// Queue tones and start the pacing task if idle.
pub(crate) fn send_dtmf(session: &Arc<SessionInner>, tones: &str, options: DtmfOptions) -> Result<()> {
    if session.status() != SessionStatus::Confirmed
        && session.status() != SessionStatus::WaitingForAck
    {
        return Err(Error::InvalidState(format!(
            "cannot send DTMF in state {:?}",
            session.status()
        )));
    }
    let tones = tones.to_ascii_uppercase();
    if tones.is_empty() || !tones.chars().all(valid_tone) {
        return Err(Error::InvalidTarget(format!("invalid DTMF tones: {}", tones)));
    }

    let options = options.clamped();
    let start = {
        let mut dtmf = session.dtmf.lock().unwrap();
        for tone in tones.chars() {
            dtmf.queue.push_back((tone, options));
        }
        if dtmf.running {
            false
        } else {
            dtmf.running = true;
            true
        }
    };
    if start {
        spawn_pump(session.clone());
    }
    Ok(())
}

fn spawn_pump(session: Arc<SessionInner>) {
    tokio::spawn(async move {
        loop {
            if session.cancel_token.is_cancelled()
                || session.status() == SessionStatus::Terminated
            {
                session.dtmf.lock().unwrap().clear();
                return;
            }
            let next = session.dtmf.lock().unwrap().queue.pop_front();
            let (tone, options) = match next {
                Some(next) => next,
                None => {
                    session.dtmf.lock().unwrap().running = false;
                    return;
                }
            };

            if tone == ',' {
                tokio::time::sleep(Duration::from_millis(COMMA_PAUSE)).await;
                continue;
            }

            if let Err(e) = send_one(&session, tone, options.duration).await {
                warn!(id = %session.id, "DTMF send failed: {}", e);
                session.dtmf.lock().unwrap().clear();
                return;
            }
            session.emit(SessionEvent::NewDtmf {
                originator: Originator::Local,
                tone,
                duration: options.duration,
            });
            tokio::time::sleep(Duration::from_millis(
                options.duration + options.inter_tone_gap,
            ))
            .await;
        }
    });
}

struct DtmfApplicant {
    session: Arc<SessionInner>,
}

#[async_trait]
impl TransactionUser for DtmfApplicant {
    async fn receive_response(&self, response: rsip::Response) {
        debug!("DTMF INFO answered with {}", response.status_code);
    }
    async fn on_request_timeout(&self) {}
    async fn on_transport_error(&self, _error: String) {}
    fn next_cseq_for_retry(&self) -> Option<u32> {
        self.session.dialog().map(|d| d.next_local_seq())
    }
}

async fn send_one(session: &Arc<SessionInner>, tone: char, duration: u64) -> Result<()> {
    let dialog = session.require_dialog()?;
    let request = dialog.create_request(
        Method::Info,
        vec![Header::ContentType("application/dtmf-relay".into())],
        Some(dtmf_body(tone, duration).into_bytes()),
        &session.contact,
        session.ua.user_agent(),
    )?;
    RequestSender::new(
        session.ua.core.clone(),
        request,
        Arc::new(DtmfApplicant {
            session: session.clone(),
        }),
        session.ua.credential(),
        session.ua.is_user_closed(),
    )
    .spawn();
    Ok(())
}
