//! Streaming content digests.
//!
//! Checksums are always rendered as lowercase hexadecimal strings. MD5 is the
//! default algorithm because existing bit archive ledgers record MD5 digests;
//! BLAKE3 is available for new deployments.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Read buffer used when digesting whole files
const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Blake3,
}

impl ChecksumAlgorithm {
    pub fn hasher(self) -> Hasher {
        Hasher::new(self)
    }

    /// Length of the hex rendering of a digest
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 32,
            ChecksumAlgorithm::Blake3 => 64,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
            ChecksumAlgorithm::Blake3 => write!(f, "blake3"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("'{0}' is not a hexadecimal digest")]
pub struct InvalidChecksum(pub String);

/// A content digest, stored in its lowercase hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    /// Parse a hex digest. Upper case input is normalised to lower case.
    pub fn from_hex(hex_digest: &str) -> Result<Self, InvalidChecksum> {
        let trimmed = hex_digest.trim();
        if trimmed.is_empty()
            || trimmed.len() % 2 != 0
            || !trimmed.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(InvalidChecksum(hex_digest.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Checksum {
    type Error = InvalidChecksum;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Checksum::from_hex(&value)
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.0
    }
}

impl std::str::FromStr for Checksum {
    type Err = InvalidChecksum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Checksum::from_hex(s)
    }
}

/// Incremental digest state
#[derive(Clone)]
pub struct Hasher {
    inner: HasherInner,
}

#[derive(Clone)]
enum HasherInner {
    Md5(Md5),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let inner = match algorithm {
            ChecksumAlgorithm::Md5 => HasherInner::Md5(Md5::new()),
            ChecksumAlgorithm::Blake3 => HasherInner::Blake3(Box::new(blake3::Hasher::new())),
        };
        Self { inner }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self.inner {
            HasherInner::Md5(_) => ChecksumAlgorithm::Md5,
            HasherInner::Blake3(_) => ChecksumAlgorithm::Blake3,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherInner::Md5(h) => h.update(data),
            HasherInner::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(self) -> Checksum {
        match self.inner {
            HasherInner::Md5(h) => Checksum::from_digest(&h.finalize()),
            HasherInner::Blake3(h) => Checksum::from_digest(h.finalize().as_bytes()),
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("algorithm", &self.algorithm())
            .finish()
    }
}

/// Digest of an in-memory buffer.
pub fn checksum_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> Checksum {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finalize()
}

/// Digest everything a reader yields. Returns the digest and the byte count.
pub async fn checksum_reader<R>(algorithm: ChecksumAlgorithm, reader: &mut R) -> io::Result<(Checksum, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; DIGEST_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize(), total))
}

/// Digest a file on disk.
pub async fn checksum_file(algorithm: ChecksumAlgorithm, path: &Path) -> io::Result<Checksum> {
    let mut file = tokio::fs::File::open(path).await?;
    let (checksum, _) = checksum_reader(algorithm, &mut file).await?;
    Ok(checksum)
}

/// Reader adapter that digests every byte handed to the caller.
pub struct ChecksumReader<R> {
    inner: R,
    hasher: Hasher,
    bytes: u64,
}

impl<R> ChecksumReader<R> {
    pub fn new(inner: R, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            inner,
            hasher: algorithm.hasher(),
            bytes: 0,
        }
    }

    /// Bytes observed so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Digest of everything read so far, without consuming the reader.
    pub fn digest(&self) -> Checksum {
        self.hasher.clone().finalize()
    }

    pub fn into_parts(self) -> (R, Checksum, u64) {
        (self.inner, self.hasher.finalize(), self.bytes)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChecksumReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        if !fresh.is_empty() {
            let this = &mut *self;
            this.hasher.update(fresh);
            this.bytes += fresh.len() as u64;
        }
        Poll::Ready(Ok(()))
    }
}

/// Writer adapter that digests every byte accepted by the inner writer.
pub struct ChecksumWriter<W> {
    inner: W,
    hasher: Hasher,
    bytes: u64,
}

impl<W> ChecksumWriter<W> {
    pub fn new(inner: W, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            inner,
            hasher: algorithm.hasher(),
            bytes: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn into_parts(self) -> (W, Checksum, u64) {
        (self.inner, self.hasher.finalize(), self.bytes)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ChecksumWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        let this = &mut *self;
        this.hasher.update(&buf[..n]);
        this.bytes += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::AsyncWriteExt;

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn test_md5_known_values() {
        assert_eq!(checksum_bytes(ChecksumAlgorithm::Md5, b"").as_str(), EMPTY_MD5);
        assert_eq!(
            checksum_bytes(ChecksumAlgorithm::Md5, b"abc").as_str(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_blake3_hex_len() {
        let cs = checksum_bytes(ChecksumAlgorithm::Blake3, b"abc");
        assert_eq!(cs.as_str().len(), ChecksumAlgorithm::Blake3.hex_len());
        assert_eq!(cs.as_str(), blake3::hash(b"abc").to_hex().as_str());
    }

    #[test]
    fn test_from_hex_normalises_case() {
        let cs = Checksum::from_hex("D41D8CD98F00B204E9800998ECF8427E").unwrap();
        assert_eq!(cs.as_str(), EMPTY_MD5);
        assert!(Checksum::from_hex("xyz").is_err());
        assert!(Checksum::from_hex("").is_err());
        assert!(Checksum::from_hex("abc").is_err());
    }

    #[test]
    fn test_serde_is_plain_string() {
        let cs = checksum_bytes(ChecksumAlgorithm::Md5, b"");
        let json = serde_json::to_string(&cs).unwrap();
        assert_eq!(json, format!("\"{}\"", EMPTY_MD5));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cs);
        assert!(serde_json::from_str::<Checksum>("\"not hex\"").is_err());
    }

    #[tokio::test]
    async fn test_checksum_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture-001.warc");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();

        let from_file = checksum_file(ChecksumAlgorithm::Md5, &path).await.unwrap();
        assert_eq!(from_file, checksum_bytes(ChecksumAlgorithm::Md5, &data));
    }

    #[tokio::test]
    async fn test_checksum_reader_tracks_bytes() {
        let data = b"hello archive".to_vec();
        let mut reader = ChecksumReader::new(&data[..], ChecksumAlgorithm::Md5);
        let mut sink = Vec::new();
        tokio::io::copy(&mut reader, &mut sink).await.unwrap();

        assert_eq!(reader.bytes_read(), data.len() as u64);
        let (_, cs, n) = reader.into_parts();
        assert_eq!(n, data.len() as u64);
        assert_eq!(cs, checksum_bytes(ChecksumAlgorithm::Md5, &data));
    }

    #[tokio::test]
    async fn test_checksum_writer() {
        let mut writer = ChecksumWriter::new(Vec::new(), ChecksumAlgorithm::Blake3);
        writer.write_all(b"part one, ").await.unwrap();
        writer.write_all(b"part two").await.unwrap();
        writer.flush().await.unwrap();

        let (out, cs, n) = writer.into_parts();
        assert_eq!(out, b"part one, part two");
        assert_eq!(n, 18);
        assert_eq!(cs, checksum_bytes(ChecksumAlgorithm::Blake3, b"part one, part two"));
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_digest(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            split in 0usize..4096,
        ) {
            let split = split.min(data.len());
            let mut hasher = ChecksumAlgorithm::Md5.hasher();
            hasher.update(&data[..split]);
            hasher.update(&data[split..]);
            prop_assert_eq!(hasher.finalize(), checksum_bytes(ChecksumAlgorithm::Md5, &data));
        }
    }
}
