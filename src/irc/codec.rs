//! Line codec — frames the server byte stream into [`Message`]s.
//!
//! Inbound lines are split on `\n`, tolerating both `\r\n` (RFC 2812) and the
//! bare `\n` some daemons emit on server notices. Outbound messages are
//! always `\r\n`-terminated.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError};

/// Hard cap on one inbound line. The RFC says 512 bytes; oversized LINKS
/// info fields and snote payloads show up in the wild, so allow slack.
const MAX_LINE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds {MAX_LINE} bytes")]
    LineTooLong,
    #[error("line is not valid UTF-8")]
    BadEncoding,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames IRC lines; one decoded item per wire line.
#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            let Some(nl) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_LINE {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };
            if nl > MAX_LINE {
                return Err(CodecError::LineTooLong);
            }

            let raw = src.split_to(nl + 1);
            let mut line = &raw[..nl];
            if line.last() == Some(&b'\r') {
                line = &line[..nl - 1];
            }

            let text = std::str::from_utf8(line).map_err(|_| CodecError::BadEncoding)?;
            match Message::parse(text) {
                Ok(msg) => return Ok(Some(msg)),
                // Empty keep-alive lines are legal noise between messages.
                Err(ParseError::Empty) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Encoder<Message> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
