//! Stream multiplexing frame protocol
//!
//! When several output lanes share one byte stream every write is wrapped in
//! a frame:
//!
//! ```text
//! +--------+-----------+-------------------------+---------------+
//! | tag u8 | 0x00 x 3  | payload length (u32 BE) | payload bytes |
//! +--------+-----------+-------------------------+---------------+
//! ```
//!
//! Readers demultiplex on the tag to rebuild each lane's byte sequence.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

pub const HEADER_LEN: usize = 8;

/// Largest payload the decoder accepts unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Output lane identifier carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StdStream {
    Stdout = 1,
    Stderr = 2,
    Systemerr = 3,
}

impl StdStream {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for StdStream {
    type Error = io::Error;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(StdStream::Stdout),
            2 => Ok(StdStream::Stderr),
            3 => Ok(StdStream::Systemerr),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognized stream tag {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StdStream,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream: StdStream, payload: impl Into<Bytes>) -> Self {
        Self {
            stream,
            payload: payload.into(),
        }
    }
}

/// Frame codec. Encoding accepts any payload that fits the u32 length field;
/// decoding rejects headers announcing more than `max_frame_length` bytes
/// before buffering any of the payload.
#[derive(Debug, Clone, Copy)]
pub struct StdFrameCodec {
    max_frame_length: usize,
}

impl StdFrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for StdFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Frame> for StdFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u32::try_from(frame.payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame payload of {} bytes is too large", frame.payload.len()),
            )
        })?;
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.stream.tag());
        dst.put_bytes(0, 3);
        dst.put_u32(len);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for StdFrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let stream = StdStream::try_from(src[0])?;
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    len, self.max_frame_length
                ),
            ));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { stream, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "multiplexed stream ended inside a frame",
            )),
        }
    }
}

/// Encodes a single frame.
pub fn encode_frame(stream: StdStream, payload: &[u8]) -> io::Result<BytesMut> {
    let mut buf = BytesMut::new();
    StdFrameCodec::new().encode(Frame::new(stream, Bytes::copy_from_slice(payload)), &mut buf)?;
    Ok(buf)
}

/// Per-lane byte sequences rebuilt from a multiplexed stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Demultiplexed {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub systemerr: Vec<u8>,
}

/// Reads a multiplexed stream to its end and splits it back into lanes.
pub async fn demultiplex<R>(reader: R) -> io::Result<Demultiplexed>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, StdFrameCodec::new());
    let mut out = Demultiplexed::default();
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let lane = match frame.stream {
            StdStream::Stdout => &mut out.stdout,
            StdStream::Stderr => &mut out.stderr,
            StdStream::Systemerr => &mut out.systemerr,
        };
        lane.extend_from_slice(&frame.payload);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let buf = encode_frame(StdStream::Stderr, b"hello").unwrap();
        assert_eq!(&buf[..HEADER_LEN], &[2, 0, 0, 0, 0, 0, 0, 5]);
        assert_eq!(&buf[HEADER_LEN..], b"hello");
    }

    #[test]
    fn test_length_is_big_endian() {
        let payload = vec![b'x'; 0x0102];
        let buf = encode_frame(StdStream::Systemerr, &payload).unwrap();
        assert_eq!(&buf[..HEADER_LEN], &[3, 0, 0, 0, 0, 0, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let full = encode_frame(StdStream::Stdout, b"partial").unwrap();
        let mut codec = StdFrameCodec::new();

        let mut src = BytesMut::from(&full[..5]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);

        src.extend_from_slice(&full[5..10]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);

        src.extend_from_slice(&full[10..]);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame, Frame::new(StdStream::Stdout, &b"partial"[..]));
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let mut src = BytesMut::from(&[9u8, 0, 0, 0, 0, 0, 0, 0][..]);
        let err = StdFrameCodec::new().decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_rejects_oversized_length_without_buffering() {
        let mut src = BytesMut::from(&[1u8, 0, 0, 0, 0xff, 0xff, 0xff, 0xff][..]);
        let err = StdFrameCodec::new().decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(src.capacity() < DEFAULT_MAX_FRAME_LENGTH);
    }

    #[test]
    fn test_decode_honors_configured_limit() {
        let mut codec = StdFrameCodec::with_max_frame_length(4);

        let mut src = BytesMut::from(&encode_frame(StdStream::Stdout, b"four").unwrap()[..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::new(StdStream::Stdout, &b"four"[..]))
        );

        let mut src = BytesMut::from(&encode_frame(StdStream::Stdout, b"five!").unwrap()[..]);
        assert_eq!(codec.decode(&mut src).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_demultiplex_lanes() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&encode_frame(StdStream::Stdout, b"out 1\n").unwrap());
        stream.extend_from_slice(&encode_frame(StdStream::Stderr, b"err 1\n").unwrap());
        stream.extend_from_slice(&encode_frame(StdStream::Stdout, b"out 2\n").unwrap());
        stream.extend_from_slice(&encode_frame(StdStream::Systemerr, b"oops\n").unwrap());

        let lanes = demultiplex(&stream[..]).await.unwrap();
        assert_eq!(lanes.stdout, b"out 1\nout 2\n");
        assert_eq!(lanes.stderr, b"err 1\n");
        assert_eq!(lanes.systemerr, b"oops\n");
    }

    #[tokio::test]
    async fn test_demultiplex_truncated_stream() {
        let frame = encode_frame(StdStream::Stdout, b"truncated").unwrap();
        let err = demultiplex(&frame[..frame.len() - 2]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
