//! The `OP_MSG`/`OP_COMPRESSED` wire codec.

pub mod compression;
pub mod header;
pub mod message;
pub mod util;

use bson::Document;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

pub use compression::CompressorId;
pub use header::{Header, OpCode, HEADER_LENGTH};
pub use message::{Message, MessageFlags};
pub use util::RequestIdAllocator;

/// Encode `body` as a fresh `OP_MSG` request, compressing it with `compressor` first if one
/// is negotiated and the uncompressed body exceeds the compression threshold.
pub fn encode_request(
    body: Document,
    db_name: &str,
    request_id: i32,
    compressor: Option<CompressorId>,
) -> Result<Vec<u8>> {
    let message = Message::with_command(body, db_name, request_id);
    let uncompressed = message.to_vec()?;

    let Some(compressor) = compressor else {
        return Ok(uncompressed);
    };
    if compressor == CompressorId::Noop {
        return Ok(uncompressed);
    }

    let payload = &uncompressed[HEADER_LENGTH as usize..];
    if payload.len() <= compression::COMPRESS_IF_LARGER_THAN {
        return Ok(uncompressed);
    }

    let compressed_payload = compression::compress(compressor, payload)?;

    let mut out = Vec::with_capacity(HEADER_LENGTH as usize + 9 + compressed_payload.len());
    let total_len = HEADER_LENGTH + 9 + compressed_payload.len() as i32;
    out.extend_from_slice(&total_len.to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&OpCode::Compressed.wire_value().to_le_bytes());
    out.extend_from_slice(&OpCode::Message.wire_value().to_le_bytes());
    out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    out.push(compressor.to_byte());
    out.extend_from_slice(&compressed_payload);
    Ok(out)
}

/// Read one full reply from `reader`: the header, then the body (decompressing if the
/// header's opcode is `OP_COMPRESSED`), asserting `responseTo == expected_request_id`.
pub async fn read_reply<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected_request_id: i32,
) -> Result<Document> {
    let header = Header::read_from(reader).await?;
    if header.response_to != expected_request_id {
        return Err(Error::protocol(format!(
            "reply responseTo {} did not match in-flight request id {}",
            header.response_to, expected_request_id
        )));
    }
    let body_len = header.body_length()?;
    let body = message::read_exact_body(reader, body_len).await?;

    let message = match header.op_code {
        OpCode::Message => Message::parse_body(&body, header.request_id, header.response_to)?,
        OpCode::Compressed => {
            if body.len() < 9 {
                return Err(Error::protocol("OP_COMPRESSED body shorter than its header"));
            }
            let original_opcode =
                i32::from_le_bytes(body[0..4].try_into().unwrap());
            let uncompressed_size =
                i32::from_le_bytes(body[4..8].try_into().unwrap()) as usize;
            let compressor = CompressorId::from_byte(body[8])?;
            let decompressed =
                compression::decompress(compressor, &body[9..], uncompressed_size)?;
            if original_opcode != OpCode::Message.wire_value() {
                return Err(Error::protocol(format!(
                    "OP_COMPRESSED wrapped an unsupported opcode {original_opcode}"
                )));
            }
            Message::parse_body(&decompressed, header.request_id, header.response_to)?
        }
    };

    Ok(message.body()?.clone())
}

pub async fn write_request<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    message::write_message(writer, bytes).await
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn small_body_is_not_compressed() {
        let bytes = encode_request(doc! { "ping": 1 }, "admin", 1, Some(CompressorId::Zstd))
            .unwrap();
        let header = Header::read_from(&mut std::io::Cursor::new(&bytes)).await.unwrap();
        assert_eq!(header.op_code, OpCode::Message);
    }

    #[tokio::test]
    async fn large_body_is_compressed_when_negotiated() {
        let mut big = Document::new();
        big.insert("payload", "x".repeat(2000));
        let bytes = encode_request(big, "admin", 1, Some(CompressorId::Zlib)).unwrap();
        let header = Header::read_from(&mut std::io::Cursor::new(&bytes)).await.unwrap();
        assert_eq!(header.op_code, OpCode::Compressed);
    }

    #[tokio::test]
    async fn round_trips_an_uncompressed_reply() {
        let bytes = encode_request(doc! { "hello": 1.0 }, "admin", 9, None).unwrap();
        // Flip the header to look like a reply: responseTo should equal the request id.
        let mut reply_bytes = bytes.clone();
        reply_bytes[4..8].copy_from_slice(&9i32.to_le_bytes());
        reply_bytes[8..12].copy_from_slice(&9i32.to_le_bytes());
        let mut cursor = std::io::Cursor::new(reply_bytes);
        let doc = read_reply(&mut cursor, 9).await.unwrap();
        assert_eq!(doc.get_f64("hello").unwrap(), 1.0);
    }

    #[tokio::test]
    async fn mismatched_response_to_is_fatal() {
        let bytes = encode_request(doc! { "hello": 1.0 }, "admin", 9, None).unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(read_reply(&mut cursor, 123).await.is_err());
    }
}
