use self::key::TransactionKey;
use std::time::Duration;

pub mod key;
pub mod sender;
pub mod timer;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use sender::{RequestSender, TransactionUser};
pub use transaction::{Transaction, TransactionCore, TransactionCoreRef, TransactionOutput};

/// RFC 3261 timer baseline values.
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);
/// 64*T1: bounds response waiting (B, F) and ACK waiting (H, M).
pub const TIMER_B: Duration = Duration::from_secs(32);
pub const TIMER_F: Duration = TIMER_B;
pub const TIMER_H: Duration = TIMER_B;
pub const TIMER_M: Duration = TIMER_B;

pub const TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CALL_ID_LEN: usize = 22;

/// Transaction machine states, shared by the four machines.
///
/// ICT: Calling -> Proceeding -> Completed -> Terminated, or
/// Calling/Proceeding -> Accepted -> Terminated for 2xx (RFC 6026).
/// NICT: Trying -> Proceeding -> Completed -> Terminated.
/// IST: Proceeding -> Completed -> Confirmed -> Terminated; a 2xx
/// terminates the machine directly, retransmission of the 2xx then
/// belongs to the invite session.
/// NIST: Trying -> Proceeding -> Completed -> Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Accepted,
    Confirmed,
    Terminated,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Calling => "Calling",
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Accepted => "Accepted",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Terminated => "Terminated",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionType::InviteClient => "InviteClient",
            TransactionType::NonInviteClient => "NonInviteClient",
            TransactionType::InviteServer => "InviteServer",
            TransactionType::NonInviteServer => "NonInviteServer",
        };
        write!(f, "{}", name)
    }
}

/// Timers owned by the transaction core. Over WebSocket (a reliable
/// transport) there is no retransmission timer; the remaining timers
/// bound how long each machine waits before giving up.
pub enum TransactionTimer {
    /// ICT: no final response within 64*T1.
    TimerB(TransactionKey),
    /// NICT: no final response within 64*T1.
    TimerF(TransactionKey),
    /// IST: no ACK for a non-2xx final within 64*T1.
    TimerH(TransactionKey),
    /// ICT: linger in Accepted to absorb 2xx retransmissions.
    TimerM(TransactionKey),
    /// Evict a terminated transaction from the replay map.
    Cleanup(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerB(key)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerM(key)
            | TransactionTimer::Cleanup(key) => key,
        }
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::TimerB(key) => write!(f, "TimerB: {}", key),
            TransactionTimer::TimerF(key) => write!(f, "TimerF: {}", key),
            TransactionTimer::TimerH(key) => write!(f, "TimerH: {}", key),
            TransactionTimer::TimerM(key) => write!(f, "TimerM: {}", key),
            TransactionTimer::Cleanup(key) => write!(f, "Cleanup: {}", key),
        }
    }
}

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(format!("z9hG4bK{}", random_text(BRANCH_LEN)).into())
}

pub fn make_tag() -> rsip::param::Tag {
    random_text(TAG_LEN).into()
}

pub fn make_call_id(domain: &str) -> rsip::headers::CallId {
    format!("{}@{}", random_text(CALL_ID_LEN), domain).into()
}

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}
