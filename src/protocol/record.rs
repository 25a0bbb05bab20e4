//! Record marking for stream transports (RFC 5531 section 11)
// (c) 2025 Ross Younger
//!
//! Each message is sent as one or more fragments. A fragment is a 4-byte
//! big-endian header followed by that many bytes of data; the top bit of the
//! header marks the last fragment of the record.

use bytes::{BufMut as _, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Top bit of a fragment header: this is the final fragment
pub const LAST_FRAGMENT: u32 = 0x8000_0000;
/// Largest record we are prepared to reassemble
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;
/// Outbound messages are split into fragments of at most this size
pub const DEFAULT_FRAGMENT_SIZE: usize = 1024 * 1024;
// a fragment length must leave the last-fragment bit clear
static_assertions::const_assert!(DEFAULT_FRAGMENT_SIZE < LAST_FRAGMENT as usize);

/// Errors reading a record
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The peer closed the connection cleanly between records
    #[error("connection closed by peer")]
    Closed,
    /// The peer closed the connection part way through a record
    #[error("connection closed mid-record")]
    Truncated,
    /// The reassembled record would exceed the limit
    #[error("record too large ({0} bytes)")]
    TooLarge(usize),
    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads bytes until `buf` is full.
/// Returns the number of bytes read, which is short only at end of stream.
async fn read_fully<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Reads and reassembles one record
pub async fn read_record<R: AsyncRead + Unpin>(
    r: &mut R,
    max_size: usize,
) -> Result<Bytes, RecordError> {
    let mut record = BytesMut::new();
    let mut first = true;
    loop {
        let mut header = [0u8; 4];
        let n = read_fully(r, &mut header).await?;
        if n == 0 && first {
            return Err(RecordError::Closed);
        }
        if n < header.len() {
            return Err(RecordError::Truncated);
        }
        first = false;
        let header = u32::from_be_bytes(header);
        let len = (header & !LAST_FRAGMENT) as usize;
        let total = record.len() + len;
        if total > max_size {
            return Err(RecordError::TooLarge(total));
        }
        let start = record.len();
        record.resize(total, 0);
        if read_fully(r, &mut record[start..]).await? < len {
            return Err(RecordError::Truncated);
        }
        if header & LAST_FRAGMENT != 0 {
            return Ok(record.freeze());
        }
    }
}

/// Frames a message into fragments of at most `fragment_size` bytes.
/// An empty message still produces a single (empty, final) fragment.
#[must_use]
pub fn encode_record(message: &[u8], fragment_size: usize) -> Bytes {
    let fragment_size = fragment_size.clamp(1, (LAST_FRAGMENT - 1) as usize);
    let mut out = BytesMut::with_capacity(message.len() + 4 * (1 + message.len() / fragment_size));
    let mut chunks = message.chunks(fragment_size).peekable();
    if chunks.peek().is_none() {
        out.put_u32(LAST_FRAGMENT);
    }
    while let Some(chunk) = chunks.next() {
        // chunk length is bounded by fragment_size, itself below 2^31
        #[allow(clippy::cast_possible_truncation)]
        let mut header = chunk.len() as u32;
        if chunks.peek().is_none() {
            header |= LAST_FRAGMENT;
        }
        out.put_u32(header);
        out.put_slice(chunk);
    }
    out.freeze()
}

/// Writes one record and flushes the stream
pub async fn write_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    message: &[u8],
) -> std::io::Result<()> {
    w.write_all(&encode_record(message, DEFAULT_FRAGMENT_SIZE))
        .await?;
    w.flush().await
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt as _;

    use super::{MAX_RECORD_SIZE, RecordError, encode_record, read_record, write_record};

    #[test]
    fn single_fragment_layout() {
        assert_eq!(encode_record(b"abc", 100).as_ref(), b"\x80\0\0\x03abc");
        assert_eq!(encode_record(b"", 100).as_ref(), b"\x80\0\0\0");
    }

    #[test]
    fn multi_fragment_layout() {
        assert_eq!(
            encode_record(b"abcde", 2).as_ref(),
            b"\0\0\0\x02ab\0\0\0\x02cd\x80\0\0\x01e"
        );
    }

    #[tokio::test]
    async fn reassembles_fragments() {
        let (mut rx, mut tx) = tokio::io::simplex(1024);
        tx.write_all(&encode_record(b"hello, world", 5)).await.unwrap();
        write_record(&mut tx, b"second").await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);
        let first = read_record(&mut rx, MAX_RECORD_SIZE).await.unwrap();
        assert_eq!(first.as_ref(), b"hello, world");
        let second = read_record(&mut rx, MAX_RECORD_SIZE).await.unwrap();
        assert_eq!(second.as_ref(), b"second");
        assert!(matches!(
            read_record(&mut rx, MAX_RECORD_SIZE).await,
            Err(RecordError::Closed)
        ));
    }

    #[tokio::test]
    async fn header_split_across_reads() {
        let mut rx = tokio_test::io::Builder::new()
            .read(b"\0\0")
            .read(b"\0\x02ab\x80\0")
            .read(b"\0\x01c")
            .build();
        let record = read_record(&mut rx, MAX_RECORD_SIZE).await.unwrap();
        assert_eq!(record.as_ref(), b"abc");
    }

    #[tokio::test]
    async fn eof_mid_record() {
        let (mut rx, mut tx) = tokio::io::simplex(1024);
        tx.write_all(b"\x80\0\0\x10abc").await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);
        assert!(matches!(
            read_record(&mut rx, MAX_RECORD_SIZE).await,
            Err(RecordError::Truncated)
        ));
    }

    #[tokio::test]
    async fn eof_mid_header() {
        let (mut rx, mut tx) = tokio::io::simplex(1024);
        tx.write_all(b"\x80\0").await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);
        assert!(matches!(
            read_record(&mut rx, MAX_RECORD_SIZE).await,
            Err(RecordError::Truncated)
        ));
    }

    #[tokio::test]
    async fn oversize_record() {
        let (mut rx, mut tx) = tokio::io::simplex(1024);
        tx.write_all(&encode_record(&[0u8; 64], 16)).await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);
        assert!(matches!(
            read_record(&mut rx, 40).await,
            Err(RecordError::TooLarge(48))
        ));
    }
}
