use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

use super::header::{OpCode, HEADER_LENGTH};

bitflags! {
    /// Flags carried in the `flagBits` field of an `OP_MSG`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        /// The message ends with a CRC-32C checksum.
        const CHECKSUM_PRESENT = 0b0000_0001;
        /// The sender will send further messages without waiting for a reply ("exhaust" mode).
        const MORE_TO_COME = 0b0000_0010;
        /// The client is prepared to receive multiple replies for this request.
        const EXHAUST_ALLOWED = 1 << 16;
    }
}

/// A single section of an `OP_MSG` body. Only "kind 0" (a single document) sections are
/// produced or consumed by this crate; "kind 1" document sequences are not needed by any
/// command this driver issues.
#[derive(Debug, Clone)]
pub struct MessageSection {
    pub document: Document,
}

impl MessageSection {
    pub fn new(document: Document) -> Self {
        Self { document }
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(0u8); // kind 0: body document
        bson::to_writer(&mut *buf, &self.document).map_err(Error::from)?;
        Ok(())
    }
}

/// An in-memory representation of an `OP_MSG` message: flags plus one or more sections.
/// This crate only ever sends a single kind-0 section, but parses whatever the server
/// returns (which is always a single kind-0 section for the commands this driver issues).
#[derive(Debug, Clone)]
pub struct Message {
    pub flags: MessageFlags,
    pub sections: Vec<MessageSection>,
    pub request_id: i32,
    pub response_to: i32,
}

impl Message {
    /// Build a request message wrapping `body`, assigning `$db` if it isn't already
    /// present.
    pub fn with_command(mut body: Document, db_name: &str, request_id: i32) -> Self {
        body.entry("$db".to_string())
            .or_insert_with(|| bson::Bson::String(db_name.to_string()));
        Self {
            flags: MessageFlags::empty(),
            sections: vec![MessageSection::new(body)],
            request_id,
            response_to: 0,
        }
    }

    /// Serialize this message (without compression) to raw `OP_MSG` bytes, including the
    /// 16-byte header.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        for section in &self.sections {
            section.write_to(&mut body)?;
        }

        let total_len = HEADER_LENGTH + body.len() as i32;

        let mut out = Vec::with_capacity(total_len as usize);
        out.extend_from_slice(&total_len.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&(OpCode::Message.wire_value()).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse the body bytes of an already-decompressed `OP_MSG` (i.e. everything after the
    /// 16-byte header).
    pub fn parse_body(body: &[u8], request_id: i32, response_to: i32) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::protocol("OP_MSG body shorter than flagBits"));
        }
        let flags = MessageFlags::from_bits_truncate(u32::from_le_bytes(
            body[0..4].try_into().unwrap(),
        ));

        let mut sections = Vec::new();
        let mut offset = 4usize;
        while offset < body.len() {
            let kind = body[offset];
            offset += 1;
            match kind {
                0 => {
                    let mut cursor = std::io::Cursor::new(&body[offset..]);
                    let document: Document = bson::from_reader(&mut cursor)?;
                    offset += cursor.position() as usize;
                    sections.push(MessageSection::new(document));
                }
                1 => {
                    // Document sequence section: not produced by any reply this driver
                    // decodes, but skip it correctly by its declared length so a
                    // well-formed message with one never corrupts parsing.
                    if offset + 4 > body.len() {
                        return Err(Error::protocol("truncated document sequence section"));
                    }
                    let seq_len =
                        i32::from_le_bytes(body[offset..offset + 4].try_into().unwrap()) as usize;
                    offset += seq_len;
                }
                other => {
                    return Err(Error::protocol(format!("unknown OP_MSG section kind {other}")));
                }
            }
        }

        Ok(Self {
            flags,
            sections,
            request_id,
            response_to,
        })
    }

    /// The single body document expected from every command reply this driver issues.
    pub fn body(&self) -> Result<&Document> {
        self.sections
            .first()
            .map(|s| &s.document)
            .ok_or_else(|| Error::protocol("OP_MSG reply carried no sections"))
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_exact_body<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::transport(format!("short read of message body: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    #[test]
    fn with_command_sets_db_when_absent() {
        let msg = Message::with_command(doc! { "ping": 1 }, "admin", 1);
        assert_eq!(
            msg.sections[0].document.get_str("$db").unwrap(),
            "admin"
        );
    }

    #[test]
    fn with_command_preserves_explicit_db() {
        let msg = Message::with_command(doc! { "ping": 1, "$db": "other" }, "admin", 1);
        assert_eq!(
            msg.sections[0].document.get_str("$db").unwrap(),
            "other"
        );
    }

    #[test]
    fn round_trips_a_single_section() {
        let msg = Message::with_command(doc! { "hello": 1 }, "admin", 5);
        let bytes = msg.to_vec().unwrap();
        let body = &bytes[HEADER_LENGTH as usize..];
        let parsed = Message::parse_body(body, 5, 0).unwrap();
        assert_eq!(parsed.body().unwrap(), &msg.sections[0].document);
    }
}
