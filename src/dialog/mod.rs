use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};

pub mod dialog;

pub use dialog::{Dialog, DialogState};


/// RFC 3261 §12 dialog identity: Call-ID plus the two tags.
///
/// Lookups must succeed regardless of which side minted which tag,
/// so equality and hashing ignore tag order.
#[derive(Clone, Debug)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    /// Identity as seen by the UAC that sent `request`.
    pub fn uac_from_request(request: &rsip::Request) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();
        let local_tag = match request.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Error("from tag not found".to_string())),
        };
        let remote_tag = match request.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => String::new(),
        };
        Ok(DialogId {
            call_id,
            local_tag,
            remote_tag,
        })
    }

    /// Identity as seen by the UAS that received `request`; the
    /// local tag is the one this UA assigned to To.
    pub fn uas_from_request(request: &rsip::Request, local_tag: &str) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();
        let remote_tag = match request.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Error("from tag not found".to_string())),
        };
        Ok(DialogId {
            call_id,
            local_tag: local_tag.to_string(),
            remote_tag,
        })
    }

    /// Identity a UAC derives from a response to its request.
    pub fn uac_from_response(response: &rsip::Response) -> Result<Self> {
        let call_id = response.call_id_header()?.value().to_string();
        let local_tag = match response.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Error("from tag not found".to_string())),
        };
        let remote_tag = match response.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => String::new(),
        };
        Ok(DialogId {
            call_id,
            local_tag,
            remote_tag,
        })
    }

    /// Identity for an inbound in-dialog request, from the receiving
    /// side's point of view.
    pub fn from_inbound_request(request: &rsip::Request) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();
        let remote_tag = match request.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Error("from tag not found".to_string())),
        };
        let local_tag = match request.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => String::new(),
        };
        Ok(DialogId {
            call_id,
            local_tag,
            remote_tag,
        })
    }
}

impl PartialEq for DialogId {
    fn eq(&self, other: &DialogId) -> bool {
        if self.call_id != other.call_id {
            return false;
        }
        (self.local_tag == other.local_tag && self.remote_tag == other.remote_tag)
            || (self.local_tag == other.remote_tag && self.remote_tag == other.local_tag)
    }
}

impl Eq for DialogId {}

impl std::hash::Hash for DialogId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.call_id.hash(state);
        if self.local_tag > self.remote_tag {
            self.local_tag.hash(state);
            self.remote_tag.hash(state);
        } else {
            self.remote_tag.hash(state);
            self.local_tag.hash(state);
        }
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.call_id, self.local_tag, self.remote_tag
        )
    }
}
