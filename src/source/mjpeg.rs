use std::error;
use std::fmt;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, FramedRead};

use crate::source::Backoff;

/// JPEG start-of-image and end-of-image markers.
const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Caps on buffered garbage and frame size so a misbehaving source cannot
/// grow the read buffer without bound.
const MAX_PREAMBLE_LEN: usize = 64 * 1024;
const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Reader for a device-local MJPEG stream. Owns the underlying TCP
/// connection; dropping the reader releases it on every exit path.
pub struct StreamReader {
    frames: FramedRead<TcpStream, MjpegCodec>,
}

impl StreamReader {
    /// Connects to the stream server, retrying on the given backoff.
    /// Exhausting the attempt budget means no stream is available and the
    /// session must not enter the frame loop.
    pub async fn connect(host: &str, port: u16, backoff: Backoff) -> Result<Self, StreamOpenError> {
        for attempt in 0..backoff.attempts {
            match Self::open(host, port).await {
                Ok(reader) => {
                    tracing::debug!(host, port, attempt, "connected to stream server");
                    return Ok(reader);
                }
                Err(err) => {
                    tracing::debug!(%err, host, port, attempt, "stream server not accepting yet");
                }
            }
            time::sleep(backoff.delay).await;
        }

        Err(StreamOpenError::Unavailable)
    }

    async fn open(host: &str, port: u16) -> Result<Self, io::Error> {
        let mut stream = TcpStream::connect((host, port)).await?;
        let request = format!(
            "GET / HTTP/1.1\r\n\
             Host: {host}:{port}\r\n\
             Accept: multipart/x-mixed-replace\r\n\
             Connection: close\r\n\
             \r\n"
        );
        stream.write_all(request.as_bytes()).await?;

        Ok(Self {
            frames: FramedRead::new(stream, MjpegCodec::new()),
        })
    }

    /// Yields the next decoded frame, or `None` once the stream has ended.
    /// Read errors end the stream and are not escalated.
    pub async fn next(&mut self) -> Option<Bytes> {
        match self.frames.next().await {
            Some(Ok(frame)) => Some(frame),
            Some(Err(err)) => {
                tracing::debug!(%err, "stream read failed, treating as end of stream");
                None
            }
            None => None,
        }
    }
}

#[derive(Debug)]
pub enum StreamOpenError {
    Unavailable,
}

impl fmt::Display for StreamOpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamOpenError::Unavailable => write!(f, "stream server never accepted a connection"),
        }
    }
}

impl error::Error for StreamOpenError {}

/// Recovers discrete JPEG frames from a multipart/x-mixed-replace body.
///
/// Two strategies, like the upstream servers this reads from: if the part
/// headers carry a `Content-Length` the payload is taken by length,
/// otherwise the frame is the span from the SOI marker to the next EOI
/// marker. Everything before the SOI (HTTP response head, boundary lines,
/// part headers) is discarded with the frame.
pub struct MjpegCodec;

impl MjpegCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MjpegCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MjpegCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        let soi = match find(src, &SOI) {
            Some(soi) => soi,
            None => {
                if src.len() > MAX_PREAMBLE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "no frame start within preamble budget",
                    ));
                }
                return Ok(None);
            }
        };

        if let Some(length) = content_length(&src[..soi]) {
            if length > MAX_FRAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "frame exceeds maximum length",
                ));
            }
            if src.len() < soi + length {
                src.reserve(soi + length - src.len());
                return Ok(None);
            }
            src.advance(soi);
            return Ok(Some(src.split_to(length).freeze()));
        }

        match find(&src[soi + SOI.len()..], &EOI) {
            Some(at) => {
                let end = soi + SOI.len() + at + EOI.len();
                src.advance(soi);
                Ok(Some(src.split_to(end - soi).freeze()))
            }
            None => {
                if src.len() - soi > MAX_FRAME_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame exceeds maximum length",
                    ));
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // A torn-off boundary or partial part at end of stream is a
                // normal way for a live source to stop.
                src.clear();
                Ok(None)
            }
        }
    }
}

fn find(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|window| window == marker)
}

/// Takes the value of the last `Content-Length` header in the part headers
/// preceding the payload. The last one wins because on the first frame the
/// slice also contains the HTTP response head.
fn content_length(headers: &[u8]) -> Option<usize> {
    const NAME: &[u8] = b"content-length:";

    let mut at = None;
    for i in 0..headers.len().saturating_sub(NAME.len() - 1) {
        if headers[i..i + NAME.len()].eq_ignore_ascii_case(NAME) {
            at = Some(i + NAME.len());
        }
    }

    let mut value: usize = 0;
    let mut seen_digit = false;
    for &byte in &headers[at?..] {
        match byte {
            b' ' | b'\t' if !seen_digit => {}
            b'0'..=b'9' => {
                value = value.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
                seen_digit = true;
            }
            _ => break,
        }
    }

    seen_digit.then_some(value)
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};
    use tokio_stream::StreamExt;
    use tokio_util::codec::{Decoder, FramedRead};

    use super::MjpegCodec;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0x01, 0x02, 0x03, 0xFF, 0xD9];

    fn part_with_length(payload: &[u8]) -> Vec<u8> {
        let mut part = format!(
            "--BoundaryString\r\n\
             Content-Type: image/jpeg\r\n\
             Content-Length: {}\r\n\
             \r\n",
            payload.len()
        )
        .into_bytes();
        part.extend_from_slice(payload);
        part.extend_from_slice(b"\r\n");
        part
    }

    fn part_without_length(payload: &[u8]) -> Vec<u8> {
        let mut part = b"--BoundaryString\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        part.extend_from_slice(payload);
        part.extend_from_slice(b"\r\n");
        part
    }

    #[test]
    fn decodes_length_prefixed_part() {
        let mut codec = MjpegCodec::new();
        let mut buf = BytesMut::from(&part_with_length(JPEG)[..]);

        let frame = codec.decode(&mut buf).unwrap();
        assert_eq!(frame, Some(Bytes::from_static(JPEG)));
    }

    #[test]
    fn decodes_marker_terminated_part() {
        let mut codec = MjpegCodec::new();
        let mut buf = BytesMut::from(&part_without_length(JPEG)[..]);

        let frame = codec.decode(&mut buf).unwrap();
        assert_eq!(frame, Some(Bytes::from_static(JPEG)));
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut codec = MjpegCodec::new();
        let part = part_with_length(JPEG);
        let (head, tail) = part.split_at(part.len() - 4);

        let mut buf = BytesMut::from(head);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.put_slice(tail);
        let frame = codec.decode(&mut buf).unwrap();
        assert_eq!(frame, Some(Bytes::from_static(JPEG)));
    }

    #[test]
    fn skips_http_response_head_before_first_frame() {
        let mut codec = MjpegCodec::new();
        let mut stream = b"HTTP/1.1 200 OK\r\n\
             Content-Type: multipart/x-mixed-replace; boundary=BoundaryString\r\n\
             \r\n"
            .to_vec();
        stream.extend_from_slice(&part_with_length(JPEG));

        let mut buf = BytesMut::from(&stream[..]);
        let frame = codec.decode(&mut buf).unwrap();
        assert_eq!(frame, Some(Bytes::from_static(JPEG)));
    }

    #[tokio::test]
    async fn framed_read_yields_frames_in_order() {
        let first: Vec<u8> = vec![0xFF, 0xD8, 0xAA, 0xFF, 0xD9];
        let second: Vec<u8> = vec![0xFF, 0xD8, 0xBB, 0xBB, 0xFF, 0xD9];

        let mut stream = part_with_length(&first);
        stream.extend_from_slice(&part_without_length(&second));

        let mut frames = FramedRead::new(&stream[..], MjpegCodec::new());
        assert_eq!(frames.next().await.unwrap().unwrap(), Bytes::from(first));
        assert_eq!(frames.next().await.unwrap().unwrap(), Bytes::from(second));
        assert!(frames.next().await.is_none());
    }
}
