use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size in bytes of a wire protocol message header.
pub const HEADER_LENGTH: i32 = 16;

/// The wire protocol opcodes this crate speaks. Legacy opcodes (`OP_QUERY`, `OP_REPLY`, ...)
/// are not implemented; every request this crate sends is `OP_MSG`, optionally wrapped in
/// `OP_COMPRESSED`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Compressed,
    Message,
}

impl OpCode {
    fn from_i32(value: i32) -> Result<Self> {
        match value {
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Message),
            other => Err(Error::protocol(format!("unrecognized opcode {other}"))),
        }
    }

    fn to_i32(self) -> i32 {
        match self {
            OpCode::Compressed => 2012,
            OpCode::Message => 2013,
        }
    }

    /// The numeric wire value for this opcode.
    pub fn wire_value(self) -> i32 {
        self.to_i32()
    }
}

/// The 16-byte header prefixing every wire protocol message.
#[derive(Debug, Copy, Clone)]
pub struct Header {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl Header {
    pub fn new(length: i32, request_id: i32, response_to: i32, op_code: OpCode) -> Self {
        Self {
            length,
            request_id,
            response_to,
            op_code,
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.length.to_le_bytes()).await?;
        writer.write_all(&self.request_id.to_le_bytes()).await?;
        writer.write_all(&self.response_to.to_le_bytes()).await?;
        writer.write_all(&self.op_code.to_i32().to_le_bytes()).await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_LENGTH as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| Error::transport(format!("short read of message header: {e}")))?;
        let length = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let request_id = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let response_to = i32::from_le_bytes(buf[8..12].try_into().unwrap());
        let op_code = OpCode::from_i32(i32::from_le_bytes(buf[12..16].try_into().unwrap()))?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }

    /// Number of body bytes that follow this header, i.e. `messageLength - 16`.
    pub fn body_length(&self) -> Result<usize> {
        let len = self.length - HEADER_LENGTH;
        if len < 0 {
            return Err(Error::protocol(format!(
                "message length {} is smaller than the header",
                self.length
            )));
        }
        Ok(len as usize)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_a_buffer() {
        let header = Header::new(42, 7, 0, OpCode::Message);
        let mut buf = Vec::new();
        header.write_to(&mut buf).await.unwrap();
        assert_eq!(buf.len(), HEADER_LENGTH as usize);

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Header::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded.length, 42);
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.response_to, 0);
        assert_eq!(decoded.op_code, OpCode::Message);
    }

    #[tokio::test]
    async fn rejects_unknown_opcode() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&16i32.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&999i32.to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(Header::read_from(&mut cursor).await.is_err());
    }
}
