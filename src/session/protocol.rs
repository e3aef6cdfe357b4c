//! Wire messages for the session blob server.
//!
//! Frame format: len:u32 | type:u8 | payload
//! All multi-byte integers are big-endian, strings are length-prefixed
//! (u16 len + UTF-8).
//!
//! Blob contents are not framed: PUT is followed by exactly `size` raw bytes
//! from the client, GET_OK is followed by exactly `size` raw bytes from the
//! server.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Session protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum control frame size (1MB). Blob data never travels in frames.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

// Reply codes, borrowed from FTP so operators recognise them in logs
pub const CODE_NOT_LOGGED_IN: u16 = 530;
pub const CODE_UNAVAILABLE: u16 = 550;
pub const CODE_LOCAL_ERROR: u16 = 451;
pub const CODE_BAD_SEQUENCE: u16 = 503;
pub const CODE_BAD_NAME: u16 = 553;
pub const CODE_VERSION: u16 = 505;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    HelloOk = 0x02,
    Put = 0x03,
    Get = 0x04,
    GetOk = 0x05,
    Delete = 0x06,
    Ok = 0x07,
    Error = 0x08,
    Quit = 0x09,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::HelloOk),
            0x03 => Some(Self::Put),
            0x04 => Some(Self::Get),
            0x05 => Some(Self::GetOk),
            0x06 => Some(Self::Delete),
            0x07 => Some(Self::Ok),
            0x08 => Some(Self::Error),
            0x09 => Some(Self::Quit),
            _ => None,
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} length truncated", what);
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        );
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .with_context(|| format!("Invalid UTF-8 in {}", what))
}

fn frame(msg_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(payload);
    buf.freeze()
}

// =============================================================================
// HELLO (0x01) / HELLO_OK (0x02)
// =============================================================================

#[derive(Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Hello {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hello")
            .field("version", &self.version)
            .field("user", &self.user)
            .field("password", &"*".repeat(self.password.len()))
            .finish()
    }
}

impl Hello {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(6 + self.user.len() + self.password.len());
        payload.put_u16(self.version);
        put_str(&mut payload, &self.user);
        put_str(&mut payload, &self.password);
        frame(MessageType::Hello, &payload)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            anyhow::bail!("Hello payload too short");
        }
        let version = payload.get_u16();
        let user = get_str(&mut payload, "Hello user")?;
        let password = get_str(&mut payload, "Hello password")?;
        Ok(Self {
            version,
            user,
            password,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloOk {
    pub version: u16,
}

impl HelloOk {
    pub fn encode(&self) -> Bytes {
        frame(MessageType::HelloOk, &self.version.to_be_bytes())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            anyhow::bail!("HelloOk payload too short");
        }
        Ok(Self {
            version: payload.get_u16(),
        })
    }
}

// =============================================================================
// PUT (0x03) / GET (0x04) / GET_OK (0x05) / DELETE (0x06)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Put {
    pub name: String,
    pub size: u64,
}

impl Put {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(10 + self.name.len());
        put_str(&mut payload, &self.name);
        payload.put_u64(self.size);
        frame(MessageType::Put, &payload)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let name = get_str(&mut payload, "Put name")?;
        if payload.remaining() < 8 {
            anyhow::bail!("Put size truncated");
        }
        Ok(Self {
            name,
            size: payload.get_u64(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Get {
    pub name: String,
}

impl Get {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(2 + self.name.len());
        put_str(&mut payload, &self.name);
        frame(MessageType::Get, &payload)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            name: get_str(&mut payload, "Get name")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOk {
    pub size: u64,
}

impl GetOk {
    pub fn encode(&self) -> Bytes {
        frame(MessageType::GetOk, &self.size.to_be_bytes())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 8 {
            anyhow::bail!("GetOk payload too short");
        }
        Ok(Self {
            size: payload.get_u64(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    pub name: String,
}

impl Delete {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(2 + self.name.len());
        put_str(&mut payload, &self.name);
        frame(MessageType::Delete, &payload)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            name: get_str(&mut payload, "Delete name")?,
        })
    }
}

// =============================================================================
// OK (0x07) / ERROR (0x08) / QUIT (0x09)
// =============================================================================

pub fn ok_frame() -> Bytes {
    frame(MessageType::Ok, &[])
}

pub fn quit_frame() -> Bytes {
    frame(MessageType::Quit, &[])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: u16,
    pub message: String,
}

impl Error {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(4 + self.message.len());
        payload.put_u16(self.code);
        put_str(&mut payload, &self.message);
        frame(MessageType::Error, &payload)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            anyhow::bail!("Error payload too short");
        }
        let code = payload.get_u16();
        let message = get_str(&mut payload, "Error message")?;
        Ok(Self { code, message })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type).context("Unknown message type")?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    w.flush().await.context("Failed to flush frame")?;
    Ok(())
}

/// Remote blob names are flat: no separators, no parent references.
pub fn is_valid_blob_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(encoded: &Bytes) -> Bytes {
        // Skip frame header (4 bytes len + 1 byte type)
        Bytes::copy_from_slice(&encoded[5..])
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = Hello::new("bitrep", "secret");
        let decoded = Hello::decode(payload_of(&hello.encode())).unwrap();
        assert_eq!(decoded, hello);
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert!(!format!("{:?}", decoded).contains("secret"));
    }

    #[test]
    fn test_put_header_layout() {
        let put = Put {
            name: "capture-001.warc-42-1700000000000".to_string(),
            size: 1024,
        };
        let encoded = put.encode();
        assert_eq!(encoded[4], MessageType::Put as u8);
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len() - 5);
        assert_eq!(Put::decode(payload_of(&encoded)).unwrap(), put);
    }

    #[test]
    fn test_error_roundtrip() {
        let err = Error::new(CODE_UNAVAILABLE, "No such blob");
        assert_eq!(Error::decode(payload_of(&err.encode())).unwrap(), err);
    }

    #[test]
    fn test_truncated_payloads_rejected() {
        assert!(Hello::decode(Bytes::from_static(&[0])).is_err());
        assert!(Put::decode(Bytes::from_static(&[0, 5, b'a'])).is_err());
        assert!(GetOk::decode(Bytes::from_static(&[0, 0, 0])).is_err());
    }

    #[tokio::test]
    async fn test_frame_io() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Get { name: "x".into() }.encode())
            .await
            .unwrap();
        write_frame(&mut wire, &ok_frame()).await.unwrap();

        let mut reader = &wire[..];
        let (t, payload) = read_frame(&mut reader).await.unwrap();
        assert_eq!(t, MessageType::Get);
        assert_eq!(Get::decode(payload).unwrap().name, "x");
        let (t, payload) = read_frame(&mut reader).await.unwrap();
        assert_eq!(t, MessageType::Ok);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        wire.push(MessageType::Ok as u8);
        let mut reader = &wire[..];
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[test]
    fn test_message_type_from_u8() {
        assert_eq!(MessageType::from_u8(0x01), Some(MessageType::Hello));
        assert_eq!(MessageType::from_u8(0x05), Some(MessageType::GetOk));
        assert_eq!(MessageType::from_u8(0xFF), None);
    }

    #[test]
    fn test_blob_names() {
        assert!(is_valid_blob_name("capture-001.warc-17-1700000000000"));
        assert!(!is_valid_blob_name("../etc/passwd"));
        assert!(!is_valid_blob_name("a/b"));
        assert!(!is_valid_blob_name(""));
        assert!(!is_valid_blob_name(".."));
    }
}
