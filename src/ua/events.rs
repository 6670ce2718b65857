use crate::session::InviteSession;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Originator {
    Local,
    Remote,
    System,
}

/// Named termination/failure causes mapped from protocol outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Rejected,
    Busy,
    Unavailable,
    NotFound,
    AddressIncomplete,
    IncompatibleSdp,
    BadMediaDescription,
    Canceled,
    NoAnswer,
    Expires,
    NoAck,
    MissingSdp,
    ConnectionError,
    RequestTimeout,
    InternalError,
    AuthenticationError,
    DialogError,
    UserDeniedMediaAccess,
    WebrtcError,
    Bye,
    SipFailureCode,
}

impl Cause {
    /// Map a final status code to a named cause (RFC 3261 response
    /// classes, JS-world cause taxonomy).
    pub fn from_status(code: u16) -> Cause {
        match code {
            401 | 407 => Cause::AuthenticationError,
            403 | 603 => Cause::Rejected,
            404 | 604 => Cause::NotFound,
            408 => Cause::RequestTimeout,
            410 | 480 | 500 | 502 | 503 => Cause::Unavailable,
            415 | 488 | 606 => Cause::IncompatibleSdp,
            484 => Cause::AddressIncomplete,
            486 | 600 => Cause::Busy,
            487 => Cause::Canceled,
            _ => Cause::SipFailureCode,
        }
    }
}

impl std::fmt::Display for Cause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Cause::Rejected => "Rejected",
            Cause::Busy => "Busy",
            Cause::Unavailable => "Unavailable",
            Cause::NotFound => "Not Found",
            Cause::AddressIncomplete => "Address Incomplete",
            Cause::IncompatibleSdp => "Incompatible SDP",
            Cause::BadMediaDescription => "Bad Media Description",
            Cause::Canceled => "Canceled",
            Cause::NoAnswer => "No Answer",
            Cause::Expires => "Expires",
            Cause::NoAck => "No ACK",
            Cause::MissingSdp => "Missing SDP",
            Cause::ConnectionError => "Connection Error",
            Cause::RequestTimeout => "Request Timeout",
            Cause::InternalError => "Internal Error",
            Cause::AuthenticationError => "Authentication Error",
            Cause::DialogError => "Dialog Error",
            Cause::UserDeniedMediaAccess => "User Denied Media Access",
            Cause::WebrtcError => "WebRTC Error",
            Cause::Bye => "Terminated",
            Cause::SipFailureCode => "SIP Failure Code",
        };
        write!(f, "{}", name)
    }
}

/// Incoming MESSAGE surfaced to the application.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub from: String,
    pub to: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Events emitted by the user agent itself.
pub enum UaEvent {
    Connected,
    Disconnected {
        error: Option<String>,
    },
    Registered {
        expires: u32,
    },
    Unregistered {
        cause: Option<Cause>,
    },
    RegistrationFailed {
        response: Option<rsip::Response>,
        cause: Cause,
    },
    NewSession {
        session: InviteSession,
        originator: Originator,
    },
    NewMessage {
        message: IncomingMessage,
        originator: Originator,
    },
}

/// Whether an SDP blob was an offer or an answer when surfaced via
/// the `Sdp` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Per-session events. `{originator, response, cause}` payloads
/// follow the observable surface: who initiated the change, the
/// response that drove it if any, and the mapped cause on failure.
pub enum SessionEvent {
    Connecting,
    /// The media engine was attached to the session.
    Peerconnection,
    Progress {
        originator: Originator,
        response: Option<rsip::Response>,
    },
    Accepted {
        originator: Originator,
        response: Option<rsip::Response>,
    },
    Confirmed,
    Ended {
        originator: Originator,
        cause: Cause,
    },
    Failed {
        originator: Originator,
        cause: Cause,
        response: Option<rsip::Response>,
    },
    Hold {
        originator: Originator,
    },
    Unhold {
        originator: Originator,
    },
    Muted {
        audio: bool,
        video: bool,
    },
    Unmuted {
        audio: bool,
        video: bool,
    },
    NewDtmf {
        originator: Originator,
        tone: char,
        duration: u64,
    },
    NewInfo {
        originator: Originator,
        content_type: Option<String>,
        body: Vec<u8>,
    },
    /// Inbound REFER; accept with `InviteSession::accept_refer` using
    /// the carried id, or reject with `reject_refer`.
    Refer {
        id: u32,
        refer_to: rsip::Uri,
        referred_by: Option<String>,
    },
    /// Inbound INVITE with Replaces targeting this session; the new
    /// session replaces this one once it confirms.
    Replaces {
        session: InviteSession,
    },
    /// Local or remote description passed through the media seam.
    Sdp {
        originator: Originator,
        sdp_type: SdpType,
        sdp: String,
    },
}

pub type UaEventSender = UnboundedSender<UaEvent>;
pub type UaEventReceiver = UnboundedReceiver<UaEvent>;
pub type SessionEventSender = UnboundedSender<SessionEvent>;
pub type SessionEventReceiver = UnboundedReceiver<SessionEvent>;
