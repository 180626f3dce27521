//! Wire format for a single file transfer.
//!
//! Sender to receiver: `[u32 BE header length][JSON TransferHeader][body]`
//! where the body is exactly `file_size_bytes` raw bytes followed by EOF.
//! Receiver to sender: one verdict byte after the header, and a best-effort
//! `Stored` byte once the file has been committed.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{Error, Result};

pub const MAX_HEADER_LEN: usize = 4 * 1024;
pub const MAX_FILE_NAME_LEN: usize = 255;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub file_name: String,
    pub file_size_bytes: u64,
}

impl TransferHeader {
    pub fn new(file_name: impl Into<String>, file_size_bytes: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file_size_bytes,
        }
    }
}

/// Receiver's answer to a header, and the final completion byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verdict {
    Accepted = 0x01,
    TooLarge = 0x02,
    Busy = 0x03,
    InvalidHeader = 0x04,
    Stored = 0x10,
}

impl Verdict {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Verdict::Accepted),
            0x02 => Some(Verdict::TooLarge),
            0x03 => Some(Verdict::Busy),
            0x04 => Some(Verdict::InvalidHeader),
            0x10 => Some(Verdict::Stored),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Verdict::Accepted => "accepted",
            Verdict::TooLarge => "file exceeds the receiver's size limit",
            Verdict::Busy => "receiver is at its concurrent transfer limit",
            Verdict::InvalidHeader => "receiver could not accept the header",
            Verdict::Stored => "stored",
        }
    }
}

fn header_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_HEADER_LEN)
        .new_codec()
}

pub async fn write_header<W>(writer: &mut W, header: &TransferHeader) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(header)?;
    let mut framed = FramedWrite::new(writer, header_codec());
    framed.send(Bytes::from(json)).await?;
    Ok(())
}

/// Reads one header frame. The codec may have buffered the start of the
/// body; those bytes are returned and must be consumed before reading
/// further from `reader`.
pub async fn read_header<R>(reader: &mut R) -> Result<(TransferHeader, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(reader, header_codec());
    let frame: BytesMut = match framed.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(Error::Protocol(format!("bad header frame: {}", e))),
        None => return Err(Error::Protocol("connection closed before header".into())),
    };
    let header: TransferHeader = serde_json::from_slice(&frame)
        .map_err(|e| Error::Protocol(format!("malformed header: {}", e)))?;
    let leftover = framed.read_buffer_mut().split().freeze();
    Ok((header, leftover))
}

pub async fn write_verdict<W>(writer: &mut W, verdict: Verdict) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(verdict as u8).await?;
    writer.flush().await
}

pub async fn read_verdict<R>(reader: &mut R) -> Result<Verdict>
where
    R: AsyncRead + Unpin,
{
    let b = reader.read_u8().await?;
    Verdict::from_byte(b).ok_or_else(|| Error::Protocol(format!("unknown verdict byte {:#04x}", b)))
}

/// Reduces an advertised name to a single safe path component.
///
/// Both `/` and `\` count as separators so a Windows sender cannot smuggle
/// a directory. Returns `None` for empty, `.`/`..`, or overlong names.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    if last.len() > MAX_FILE_NAME_LEN || last.chars().any(|c| c.is_control()) {
        return None;
    }
    Some(last.to_string())
}
