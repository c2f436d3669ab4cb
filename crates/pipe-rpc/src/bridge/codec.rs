//! Framed codec for envelope traffic.
//!
//! Frame layout: `[i32 little-endian length N][N bytes of UTF-8 JSON]`.
//! Uses LengthDelimitedCodec for framing + serde_json for serialization, and
//! adds the validation the protocol needs on top: a length of zero or below is
//! a framing violation, and a stream ending inside a frame is reported as
//! truncation rather than a clean close.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Envelope;

const HEADER_LEN: usize = 4;
const LARGE_FRAME_BYTES: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid message length {0}")]
    InvalidLength(i64),

    #[error("unexpected end of stream inside a frame")]
    Truncated,

    #[error("end of stream")]
    EndOfStream,

    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Codec that frames envelopes with a signed little-endian length prefix.
pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
    // Set once a header has been validated and handed to `inner`, cleared
    // when the matching payload is complete.
    in_frame: bool,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(HEADER_LEN)
                .little_endian()
                .max_frame_length(i32::MAX as usize)
                .new_codec(),
            in_frame: false,
        }
    }
}

fn validate_length(raw: i32) -> Result<usize, CodecError> {
    if raw <= 0 {
        return Err(CodecError::InvalidLength(raw as i64));
    }
    Ok(raw as usize)
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.in_frame {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            let raw = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
            validate_length(raw)?;
            self.in_frame = true;
        }

        match self.inner.decode(src)? {
            Some(bytes) => {
                self.in_frame = false;
                let envelope = serde_json::from_slice(&bytes)?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(envelope) => Ok(Some(envelope)),
            None if buf.is_empty() && !self.in_frame => Ok(None),
            None => Err(CodecError::Truncated),
        }
    }
}

impl<'a> Encoder<&'a Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &'a Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(item)?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, kind = item.kind(), "Encoding frame");
        if json_len > LARGE_FRAME_BYTES {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        Ok(self.inner.encode(Bytes::from(json), dst)?)
    }
}

/// Write one framed envelope and flush.
pub async fn write_envelope<W>(stream: &mut W, envelope: &Envelope) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    EnvelopeCodec::new().encode(envelope, &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read exactly one framed envelope.
///
/// Loops over short reads until the full frame is buffered. A stream that
/// closes before the first header byte yields [`CodecError::EndOfStream`];
/// one that closes anywhere later yields [`CodecError::Truncated`].
pub async fn read_envelope<R>(stream: &mut R) -> Result<Envelope, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    read_full(stream, &mut header, true).await?;
    let len = validate_length(i32::from_le_bytes(header))?;

    let mut body = vec![0u8; len];
    read_full(stream, &mut body, false).await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn read_full<R>(stream: &mut R, buf: &mut [u8], at_boundary: bool) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut offset = 0;
    while offset < buf.len() {
        let read = stream.read(&mut buf[offset..]).await?;
        if read == 0 {
            return Err(if at_boundary && offset == 0 {
                CodecError::EndOfStream
            } else {
                CodecError::Truncated
            });
        }
        offset += read;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn sample() -> Envelope {
        Envelope::request("Echo", &("hi",)).unwrap()
    }

    #[test]
    fn codec_roundtrip() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        let env = sample();
        codec.encode(&env, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn prefix_is_little_endian_payload_length() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        let env = sample();
        codec.encode(&env, &mut buf).unwrap();

        let json = serde_json::to_vec(&env).unwrap();
        assert_eq!(&buf[..4], &(json.len() as i32).to_le_bytes());
        assert_eq!(&buf[4..], &json[..]);
    }

    #[test]
    fn zero_length_is_rejected() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&0i32.to_le_bytes()[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::InvalidLength(0)));
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&(-5i32).to_le_bytes()[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::InvalidLength(-5)));
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = EnvelopeCodec::new();
        let mut full = BytesMut::new();
        codec.encode(&sample(), &mut full).unwrap();

        let mut buf = BytesMut::new();
        let bytes = full.to_vec();
        let (head, tail) = bytes.split_at(7);
        buf.extend_from_slice(head);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(tail);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn eof_inside_frame_is_truncation() {
        let mut codec = EnvelopeCodec::new();
        let mut full = BytesMut::new();
        codec.encode(&sample(), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
    }

    #[test]
    fn eof_after_header_only_is_truncation() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&10i32.to_le_bytes()[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
    }

    #[test]
    fn eof_on_boundary_is_clean() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_helpers_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let env = sample();
        write_envelope(&mut a, &env).await.unwrap();
        let read = read_envelope(&mut b).await.unwrap();
        assert_eq!(read, env);
    }

    #[tokio::test]
    async fn one_byte_reads_reassemble_the_frame() {
        // A 1-byte duplex buffer forces every read to return a single byte.
        let (mut a, mut b) = tokio::io::duplex(1);
        let env = sample();
        let expected = env.clone();
        let writer = tokio::spawn(async move {
            write_envelope(&mut a, &env).await.unwrap();
            write_envelope(&mut a, &env).await.unwrap();
        });

        assert_eq!(read_envelope(&mut b).await.unwrap(), expected);

        let mut framed = FramedRead::new(b, EnvelopeCodec::new());
        assert_eq!(framed.next().await.unwrap().unwrap(), expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn read_reports_end_of_stream_and_truncation() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_envelope(&mut b).await,
            Err(CodecError::EndOfStream)
        ));

        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&20i32.to_le_bytes()).await.unwrap();
        a.write_all(b"{\"Req").await.unwrap();
        drop(a);
        assert!(matches!(
            read_envelope(&mut b).await,
            Err(CodecError::Truncated)
        ));
    }

    #[tokio::test]
    async fn framed_read_surfaces_truncation() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&20i32.to_le_bytes()).await.unwrap();
        a.write_all(b"{\"Req").await.unwrap();
        drop(a);

        let mut framed = FramedRead::new(b, EnvelopeCodec::new());
        let err = framed.next().await.unwrap().unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
    }
}
