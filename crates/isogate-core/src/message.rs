//! A relayed message: optional TLV header followed by the ISO-8583 body.

use crate::error::{GatewayError, GatewayResult};
use crate::tlv::{read_frame, write_frame, Tag, TlvFrame};
use std::fmt;
use std::io::Cursor;

/// Network institution identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nii(pub u16);

impl Nii {
    /// Key used for traffic that carries no NII.
    pub const ANY: Nii = Nii(u16::MAX);

    /// Parse the ASCII decimal form used in headers and config (`"003"`).
    pub fn parse(s: &str) -> Option<Nii> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse::<u16>().ok().filter(|n| *n != u16::MAX).map(Nii)
    }

    pub fn is_any(self) -> bool {
        self == Nii::ANY
    }
}

impl fmt::Display for Nii {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            f.write_str("*")
        } else {
            write!(f, "{:03}", self.0)
        }
    }
}

/// Header (if the side carries one) plus opaque body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GatewayMessage {
    pub header: Option<TlvFrame>,
    pub body: Vec<u8>,
}

impl GatewayMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            header: None,
            body: body.into(),
        }
    }

    pub fn with_header(header: TlvFrame, body: impl Into<Vec<u8>>) -> Self {
        Self {
            header: Some(header),
            body: body.into(),
        }
    }

    /// Split raw message bytes (length prefix already removed).
    pub fn parse(bytes: &[u8], with_header: bool) -> GatewayResult<Self> {
        if !with_header {
            return Ok(Self::new(bytes));
        }
        let mut cursor = Cursor::new(bytes);
        let header = read_frame(&mut cursor)?;
        let consumed = cursor.position() as usize;
        Ok(Self::with_header(header, &bytes[consumed..]))
    }

    pub fn to_bytes(&self) -> GatewayResult<Vec<u8>> {
        match &self.header {
            None => Ok(self.body.clone()),
            Some(header) => {
                let mut out = write_frame(header)?;
                out.extend_from_slice(&self.body);
                Ok(out)
            }
        }
    }

    /// Routing NII from the header. A present but malformed NII is a header error.
    pub fn nii(&self) -> GatewayResult<Option<Nii>> {
        let Some(raw) = self.header.as_ref().and_then(|h| h.get_str(Tag::Nii)) else {
            return Ok(None);
        };
        Nii::parse(raw)
            .map(Some)
            .ok_or_else(|| GatewayError::wrong_header(format!("malformed NII {raw:?}")))
    }

    /// ISO-8583 message type indicator: the first four ASCII digits of the body.
    pub fn mti(&self) -> Option<&str> {
        let mti = self.body.get(..4)?;
        if mti.iter().all(u8::is_ascii_digit) {
            std::str::from_utf8(mti).ok()
        } else {
            None
        }
    }

    /// Network-management messages (`08xx`) are what a logon looks like.
    pub fn is_network_management(&self) -> bool {
        self.mti().is_some_and(|m| m.starts_with("08"))
    }

    pub fn response_code(&self) -> Option<&str> {
        self.header.as_ref().and_then(|h| h.get_str(Tag::ResponseCode))
    }

    /// A response counts as declined when it carries a non-`00` response code.
    pub fn is_declined(&self) -> bool {
        self.response_code().is_some_and(|rc| rc != "00")
    }
}
