//! TLV header exchanged between gateway peers.
//!
//! Wire format: every element is `[tag lo][tag hi][len][value; len]`. A frame
//! is `START, tag*, END`; START and END use the value slot for an optional
//! marker, a zero length means "no value". Decoding is eager and fails fast:
//! any violation yields `WRONG_HEADER` and nothing is returned.

use crate::error::{GatewayError, GatewayResult};
use std::io::{ErrorKind, Read};

/// Longest value a single element can carry.
pub const MAX_VALUE_LEN: usize = u8::MAX as usize;

/// Fixed tag space of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum Tag {
    Start = 0x0001,
    /// ASCII decimal network institution identifier.
    Nii = 0x0002,
    TerminalId = 0x0003,
    MerchantId = 0x0004,
    /// One byte of [`CipherInfo`] flags.
    CipherInfo = 0x0010,
    KeyId = 0x0011,
    Kcv = 0x0012,
    Mac = 0x0013,
    Sequence = 0x0020,
    SourceAddr = 0x0021,
    Timestamp = 0x0022,
    ResponseCode = 0x0030,
    End = 0x00FF,
}

impl Tag {
    /// Tags that may appear between START and END.
    pub const INTERMEDIATE: [Tag; 11] = [
        Tag::Nii,
        Tag::TerminalId,
        Tag::MerchantId,
        Tag::CipherInfo,
        Tag::KeyId,
        Tag::Kcv,
        Tag::Mac,
        Tag::Sequence,
        Tag::SourceAddr,
        Tag::Timestamp,
        Tag::ResponseCode,
    ];

    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<Tag> {
        match id {
            0x0001 => Some(Tag::Start),
            0x00FF => Some(Tag::End),
            _ => Self::INTERMEDIATE.iter().copied().find(|t| t.id() == id),
        }
    }

    /// Low byte first.
    pub fn to_wire(self) -> [u8; 2] {
        let id = self.id();
        [(id & 0xFF) as u8, (id >> 8) as u8]
    }

    pub fn from_wire(bytes: [u8; 2]) -> Option<Tag> {
        Self::from_id(u16::from(bytes[0]) | (u16::from(bytes[1]) << 8))
    }
}

/// Flags carried by [`Tag::CipherInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CipherInfo {
    pub encrypted: bool,
    pub mac: bool,
}

impl CipherInfo {
    const ENCRYPTED: u8 = 0b01;
    const MAC: u8 = 0b10;

    pub fn from_byte(b: u8) -> Self {
        Self {
            encrypted: b & Self::ENCRYPTED != 0,
            mac: b & Self::MAC != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.encrypted {
            b |= Self::ENCRYPTED;
        }
        if self.mac {
            b |= Self::MAC;
        }
        b
    }

    pub fn is_protected(self) -> bool {
        self.encrypted || self.mac
    }
}

/// Ordered tag -> optional value mapping, always bracketed by START/END.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlvFrame {
    start: Option<Vec<u8>>,
    entries: Vec<(Tag, Option<Vec<u8>>)>,
    end: Option<Vec<u8>>,
}

fn normalise(value: Option<Vec<u8>>) -> Option<Vec<u8>> {
    value.filter(|v| !v.is_empty())
}

impl TlvFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `tag` to `value`, keeping its position if already present.
    ///
    /// START and END set the frame markers. An empty value is stored as `None`.
    pub fn insert(&mut self, tag: Tag, value: Option<Vec<u8>>) {
        let value = normalise(value);
        match tag {
            Tag::Start => self.start = value,
            Tag::End => self.end = value,
            _ => {
                if let Some(slot) = self.entries.iter_mut().find(|(t, _)| *t == tag) {
                    slot.1 = value;
                } else {
                    self.entries.push((tag, value));
                }
            }
        }
    }

    pub fn put(&mut self, tag: Tag, value: impl AsRef<[u8]>) {
        self.insert(tag, Some(value.as_ref().to_vec()));
    }

    pub fn remove(&mut self, tag: Tag) -> Option<Vec<u8>> {
        let pos = self.entries.iter().position(|(t, _)| *t == tag)?;
        self.entries.remove(pos).1
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.iter().any(|(t, _)| *t == tag)
    }

    /// Value of an intermediate tag. `None` both when absent and when valueless.
    pub fn get(&self, tag: Tag) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tag)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn get_str(&self, tag: Tag) -> Option<&str> {
        self.get(tag).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn start_marker(&self) -> Option<&[u8]> {
        self.start.as_deref()
    }

    pub fn end_marker(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    /// Intermediate entries in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (Tag, Option<&[u8]>)> {
        self.entries.iter().map(|(t, v)| (*t, v.as_deref()))
    }

    /// Number of intermediate entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cipher_info(&self) -> CipherInfo {
        self.get(Tag::CipherInfo)
            .and_then(|v| v.first().copied())
            .map(CipherInfo::from_byte)
            .unwrap_or_default()
    }

    /// Size of the encoded frame in bytes.
    pub fn encoded_len(&self) -> usize {
        let element = |v: &Option<Vec<u8>>| 3 + v.as_ref().map_or(0, Vec::len);
        element(&self.start)
            + self.entries.iter().map(|(_, v)| element(v)).sum::<usize>()
            + element(&self.end)
    }
}

/// Encode `frame` to its wire representation.
pub fn write_frame(frame: &TlvFrame) -> GatewayResult<Vec<u8>> {
    let mut out = Vec::with_capacity(frame.encoded_len());
    write_element(&mut out, Tag::Start, frame.start.as_deref())?;
    for (tag, value) in &frame.entries {
        write_element(&mut out, *tag, value.as_deref())?;
    }
    write_element(&mut out, Tag::End, frame.end.as_deref())?;
    Ok(out)
}

fn write_element(out: &mut Vec<u8>, tag: Tag, value: Option<&[u8]>) -> GatewayResult<()> {
    let value = value.unwrap_or_default();
    if value.len() > MAX_VALUE_LEN {
        return Err(GatewayError::wrong_header(format!(
            "{tag:?} value is {} bytes (max {MAX_VALUE_LEN})",
            value.len()
        )));
    }
    out.extend_from_slice(&tag.to_wire());
    out.push(value.len() as u8);
    out.extend_from_slice(value);
    Ok(())
}

/// Decode one frame from `reader`, which must be positioned on its START tag.
///
/// On success the reader is left just past END.
pub fn read_frame<R: Read>(reader: &mut R) -> GatewayResult<TlvFrame> {
    let first = read_tag(reader, "START")?;
    if first != Tag::Start {
        return Err(GatewayError::wrong_header(format!(
            "first tag is {first:?}, expected START"
        )));
    }

    let mut frame = TlvFrame {
        start: read_value(reader, Tag::Start)?,
        ..TlvFrame::default()
    };

    loop {
        let tag = read_tag(reader, "END")?;
        let value = read_value(reader, tag)?;
        match tag {
            Tag::End => {
                frame.end = value;
                return Ok(frame);
            }
            Tag::Start => {
                return Err(GatewayError::wrong_header("START repeated inside frame"));
            }
            _ if frame.contains(tag) => {
                return Err(GatewayError::wrong_header(format!("duplicate tag {tag:?}")));
            }
            _ => frame.entries.push((tag, value)),
        }
    }
}

fn read_tag<R: Read>(reader: &mut R, expecting: &str) -> GatewayResult<Tag> {
    let mut raw = [0u8; 2];
    fill(reader, &mut raw, || format!("stream ended before {expecting}"))?;
    Tag::from_wire(raw).ok_or_else(|| {
        GatewayError::wrong_header(format!(
            "unknown tag 0x{:04x}",
            u16::from(raw[0]) | (u16::from(raw[1]) << 8)
        ))
    })
}

fn read_value<R: Read>(reader: &mut R, tag: Tag) -> GatewayResult<Option<Vec<u8>>> {
    let mut len = [0u8; 1];
    fill(reader, &mut len, || format!("stream ended before {tag:?} length"))?;
    if len[0] == 0 {
        return Ok(None);
    }
    let mut value = vec![0u8; usize::from(len[0])];
    fill(reader, &mut value, || {
        format!("{tag:?} declares {} bytes, stream ended first", len[0])
    })?;
    Ok(Some(value))
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8], eof: impl FnOnce() -> String) -> GatewayResult<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => GatewayError::wrong_header(eof()),
        _ => GatewayError::from(e),
    })
}
