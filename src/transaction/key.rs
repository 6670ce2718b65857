use crate::{Error, Result};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Method,
};
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl std::fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionRole::Client => write!(f, "UAC"),
            TransactionRole::Server => write!(f, "UAS"),
        }
    }
}

/// RFC 3261 §17.1.3 / §17.2.3 transaction identity.
///
/// Client transactions match on the Via branch plus the CSeq method;
/// server transactions additionally carry the Via sent-by so that
/// distinct clients reusing a branch cannot collide. ACK and CANCEL
/// share the INVITE's branch but form their own keys because the
/// method differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub role: TransactionRole,
    pub sent_by: Option<String>,
}

impl Hash for TransactionKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.role.hash(state);
        self.sent_by.hash(state);
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sent_by {
            Some(sent_by) => write!(
                f,
                "{} {} {} [{}]",
                self.role, self.method, self.branch, sent_by
            ),
            None => write!(f, "{} {} {}", self.role, self.method, self.branch),
        }
    }
}

impl TransactionKey {
    pub fn from_request(req: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let branch = via
            .branch()
            .ok_or_else(|| {
                Error::Transaction(
                    "via branch missing".to_string(),
                    TransactionKey::invalid(role),
                )
            })?
            .to_string();
        let sent_by = match role {
            TransactionRole::Server => Some(via.uri.host_with_port.to_string()),
            TransactionRole::Client => None,
        };
        Ok(TransactionKey {
            branch,
            method: req.method.clone(),
            role,
            sent_by,
        })
    }

    /// Key for a response, matched against the client transaction
    /// that sent the request: branch from the top Via, method from
    /// CSeq.
    pub fn from_response(resp: &rsip::Response) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let branch = via
            .branch()
            .ok_or_else(|| {
                Error::Transaction(
                    "via branch missing".to_string(),
                    TransactionKey::invalid(TransactionRole::Client),
                )
            })?
            .to_string();
        Ok(TransactionKey {
            branch,
            method: resp.cseq_header()?.method()?,
            role: TransactionRole::Client,
            sent_by: None,
        })
    }

    /// The INVITE server transaction an ACK or CANCEL targets: same
    /// branch and sent-by, method swapped for INVITE.
    pub fn invite_sibling(&self) -> Self {
        TransactionKey {
            method: Method::Invite,
            ..self.clone()
        }
    }

    fn invalid(role: TransactionRole) -> Self {
        TransactionKey {
            branch: String::new(),
            method: Method::Invite,
            role,
            sent_by: None,
        }
    }
}
