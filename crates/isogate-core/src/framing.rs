//! Length-prefixed message framing for ISO-8583 over TCP.
//!
//! Wire format: `[length header][message]`, where the header is either two
//! big-endian bytes or four ASCII decimal digits.

use crate::error::{GatewayError, GatewayResult, Side, VerificationError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default ceiling on a single message.
pub const DEFAULT_MAX_MESSAGE: usize = 8192;

/// How the length of each message is announced on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthHeader {
    /// Two bytes, big-endian.
    #[default]
    Binary2,
    /// Four ASCII decimal digits.
    Ascii4,
}

impl LengthHeader {
    pub fn size(self) -> usize {
        match self {
            LengthHeader::Binary2 => 2,
            LengthHeader::Ascii4 => 4,
        }
    }

    /// Largest length this header can express.
    pub fn capacity(self) -> usize {
        match self {
            LengthHeader::Binary2 => u16::MAX as usize,
            LengthHeader::Ascii4 => 9999,
        }
    }

    fn encode(self, len: usize) -> GatewayResult<Vec<u8>> {
        if len > self.capacity() {
            return Err(GatewayError::new(
                VerificationError::MessageTooLarge,
                format!("{len} bytes does not fit a {self:?} header"),
            ));
        }
        Ok(match self {
            LengthHeader::Binary2 => (len as u16).to_be_bytes().to_vec(),
            LengthHeader::Ascii4 => format!("{len:04}").into_bytes(),
        })
    }

    fn decode(self, raw: &[u8]) -> GatewayResult<usize> {
        match self {
            LengthHeader::Binary2 => Ok(u16::from_be_bytes([raw[0], raw[1]]) as usize),
            LengthHeader::Ascii4 => {
                if !raw.iter().all(u8::is_ascii_digit) {
                    return Err(GatewayError::wrong_header(format!(
                        "length header {raw:02x?} is not ASCII digits"
                    )));
                }
                Ok(raw.iter().fold(0usize, |n, d| n * 10 + usize::from(d - b'0')))
            }
        }
    }
}

/// Prefix `body` with its length header.
pub fn frame_encode(body: &[u8], header: LengthHeader) -> GatewayResult<Vec<u8>> {
    let prefix = header.encode(body.len())?;
    let mut frame = Vec::with_capacity(prefix.len() + body.len());
    frame.extend(prefix);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    header: LengthHeader,
    max_message: usize,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(header: LengthHeader, max_message: usize) -> Self {
        Self {
            header,
            max_message,
            buffer: Vec::new(),
        }
    }

    /// Feed raw bytes and return every complete message (length header stripped).
    pub fn feed_raw(&mut self, data: &[u8]) -> GatewayResult<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Pop one complete message out of the buffer, if there is one.
    pub fn next_frame(&mut self) -> GatewayResult<Option<Vec<u8>>> {
        let hlen = self.header.size();
        if self.buffer.len() < hlen {
            return Ok(None);
        }
        let len = self.header.decode(&self.buffer[..hlen])?;
        if len > self.max_message {
            return Err(GatewayError::new(
                VerificationError::MessageTooLarge,
                format!("declared {len} bytes (max {})", self.max_message),
            ));
        }
        if self.buffer.len() < hlen + len {
            return Ok(None);
        }
        let payload = self.buffer[hlen..hlen + len].to_vec();
        self.buffer.drain(..hlen + len);
        Ok(Some(payload))
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Reads whole messages from an async byte stream.
///
/// [`MessageReader::next_message`] only suspends inside the underlying
/// `read`, and bytes are moved into the decoder once that read completes,
/// so the future can be dropped in a `select!` without losing data.
pub struct MessageReader<R> {
    inner: R,
    side: Side,
    decoder: FrameDecoder,
    buf: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, side: Side, header: LengthHeader, max_message: usize) -> Self {
        Self {
            inner,
            side,
            decoder: FrameDecoder::new(header, max_message),
            buf: vec![0u8; 4096].into_boxed_slice(),
        }
    }

    /// Next complete message, or `None` on a clean EOF between messages.
    pub async fn next_message(&mut self) -> GatewayResult<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.decoder.next_frame().map_err(|e| e.on(self.side))? {
                return Ok(Some(frame));
            }
            let n = self
                .inner
                .read(&mut self.buf)
                .await
                .map_err(|e| GatewayError::io(self.side, e))?;
            if n == 0 {
                if self.decoder.pending() == 0 {
                    return Ok(None);
                }
                return Err(GatewayError::disconnected(self.side));
            }
            self.decoder.buffer.extend_from_slice(&self.buf[..n]);
        }
    }
}

/// Write one length-prefixed message and flush it.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    side: Side,
    body: &[u8],
    header: LengthHeader,
) -> GatewayResult<()> {
    let frame = frame_encode(body, header).map_err(|e| e.on(side))?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| GatewayError::io(side, e))?;
    writer.flush().await.map_err(|e| GatewayError::io(side, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single() {
        let frame = frame_encode(b"0800hello", LengthHeader::Binary2).unwrap();
        assert_eq!(&frame[..2], &[0x00, 0x09]);
        let mut decoder = FrameDecoder::new(LengthHeader::Binary2, DEFAULT_MAX_MESSAGE);
        let decoded = decoder.feed_raw(&frame).unwrap();
        assert_eq!(decoded, vec![b"0800hello".to_vec()]);
    }

    #[test]
    fn round_trip_multiple() {
        let msgs: Vec<&[u8]> = vec![b"a", b"bb", b"ccc"];
        let mut combined = Vec::new();
        for m in &msgs {
            combined.extend(frame_encode(m, LengthHeader::Ascii4).unwrap());
        }
        assert_eq!(&combined[..4], b"0001");

        let mut decoder = FrameDecoder::new(LengthHeader::Ascii4, DEFAULT_MAX_MESSAGE);
        let decoded = decoder.feed_raw(&combined).unwrap();
        assert_eq!(decoded, msgs.iter().map(|m| m.to_vec()).collect::<Vec<_>>());
    }

    #[test]
    fn incremental_feed() {
        let frame = frame_encode(b"0200payload", LengthHeader::Binary2).unwrap();
        let mut decoder = FrameDecoder::new(LengthHeader::Binary2, DEFAULT_MAX_MESSAGE);

        // Feed one byte at a time
        for i in 0..frame.len() - 1 {
            assert!(decoder.feed_raw(&frame[i..i + 1]).unwrap().is_empty());
        }
        let decoded = decoder.feed_raw(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(decoded, vec![b"0200payload".to_vec()]);
    }

    #[test]
    fn pending_bytes() {
        let frame = frame_encode(b"xyz", LengthHeader::Binary2).unwrap();
        let mut decoder = FrameDecoder::new(LengthHeader::Binary2, DEFAULT_MAX_MESSAGE);

        decoder.feed_raw(&frame[..3]).unwrap();
        assert_eq!(decoder.pending(), 3);

        decoder.reset();
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn oversized_declaration_is_rejected() {
        let mut decoder = FrameDecoder::new(LengthHeader::Binary2, 16);
        let err = decoder.feed_raw(&[0x01, 0x00]).unwrap_err();
        assert_eq!(err.kind, VerificationError::MessageTooLarge);
    }

    #[test]
    fn non_digit_ascii_header_is_wrong_header() {
        let mut decoder = FrameDecoder::new(LengthHeader::Ascii4, DEFAULT_MAX_MESSAGE);
        let err = decoder.feed_raw(b"00x1a").unwrap_err();
        assert_eq!(err.kind, VerificationError::WrongHeader);
    }

    #[test]
    fn ascii_header_capacity() {
        assert!(frame_encode(&vec![0u8; 10_000], LengthHeader::Ascii4).is_err());
    }

    #[tokio::test]
    async fn reader_yields_messages_then_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = MessageReader::new(server, Side::Source, LengthHeader::Binary2, 1024);

        write_message(&mut client, Side::Destination, b"first", LengthHeader::Binary2)
            .await
            .unwrap();
        write_message(&mut client, Side::Destination, b"second", LengthHeader::Binary2)
            .await
            .unwrap();
        drop(client);

        assert_eq!(reader.next_message().await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(reader.next_message().await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(reader.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_inside_message_is_disconnect() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader =
            MessageReader::new(server, Side::Destination, LengthHeader::Binary2, 1024);
        client.write_all(&[0x00, 0x10, b'a']).await.unwrap();
        drop(client);

        let err = reader.next_message().await.unwrap_err();
        assert_eq!(err.kind, VerificationError::DisconnectedFromDestination);
        assert_eq!(err.side, Some(Side::Destination));
    }
}
