//! Dialog layer: dialog identification, local/remote CSeq bookkeeping and
//! route-set capture per RFC 3261 section 12.

pub mod authenticate;
pub mod dialog;
pub mod registration;

#[cfg(test)]
mod tests;

pub use dialog::{Dialog, DialogState};

use crate::message::{Request, Response};
use crate::{Error, Result};
use std::fmt;

/// A dialog id: Call-ID plus both tags (RFC 3261 section 12). The from-tag
/// is the tag of the From header as seen by the party that stores the id,
/// so client and server sides of one dialog hold mirrored ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl TryFrom<&Request> for DialogId {
    type Error = Error;

    fn try_from(req: &Request) -> Result<Self> {
        let call_id = req.headers.call_id_header()?.to_string();
        let from_tag = req
            .headers
            .from_header()?
            .tag()
            .unwrap_or_default()
            .to_string();
        let to_tag = req
            .headers
            .to_header()?
            .tag()
            .unwrap_or_default()
            .to_string();
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

impl TryFrom<&Response> for DialogId {
    type Error = Error;

    fn try_from(resp: &Response) -> Result<Self> {
        let call_id = resp.headers.call_id_header()?.to_string();
        let from_tag = resp
            .headers
            .from_header()?
            .tag()
            .unwrap_or_default()
            .to_string();
        let to_tag = resp
            .headers
            .to_header()?
            .tag()
            .unwrap_or_default()
            .to_string();
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.from_tag, self.to_tag)
    }
}
