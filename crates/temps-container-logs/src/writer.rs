//! Multiplexing writer: renders delivered log messages onto a single sink.
//!
//! Records go to the stdout or stderr lane of their source and a terminal
//! message becomes one line on the system-error lane. With multiplexing on,
//! every lane write is wrapped in a [`stdcopy`](crate::stdcopy) frame;
//! otherwise all lanes write straight through. The sink is flushed after
//! every write (and once up front, so clients see the stream is alive before
//! the first record) and is shut down on every return path.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::WriteConfig;
use crate::details::encode_details;
use crate::message::LogMessage;
use crate::stdcopy::{Frame, StdFrameCodec, StdStream};
use crate::timestamps::format_timestamp;

/// Consumes `messages` until the channel closes, a terminal message arrives,
/// `ctx` is cancelled or the sink fails.
///
/// Dropping the receiver on return is what stops a producer still blocked on
/// a send.
pub async fn write_log_stream<W>(
    ctx: CancellationToken,
    sink: W,
    mut messages: mpsc::Receiver<LogMessage>,
    config: WriteConfig,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = LaneWriter::new(sink, config.multiplex);
    let result = copy_messages(&ctx, &mut out, &mut messages, &config).await;
    let shutdown = out.sink.shutdown().await;
    result.and(shutdown)
}

async fn copy_messages<W>(
    ctx: &CancellationToken,
    out: &mut LaneWriter<W>,
    messages: &mut mpsc::Receiver<LogMessage>,
    config: &WriteConfig,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.sink.flush().await?;

    loop {
        let msg = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!("log writer cancelled");
                return Ok(());
            }
            msg = messages.recv() => match msg {
                Some(msg) => msg,
                None => return Ok(()),
            },
        };

        if let Some(err) = &msg.err {
            let line = format!("Error grabbing logs: {}\n", err);
            return out.write_lane(StdStream::Systemerr, Bytes::from(line)).await;
        }

        let line = render_line(&msg, config);
        out.write_lane(msg.source.lane(), line).await?;
    }
}

/// Applies the configured prefixes: `[timestamp ][details ]line`.
pub fn render_line(msg: &LogMessage, config: &WriteConfig) -> Bytes {
    if !config.timestamps && !config.details {
        return msg.line.clone();
    }

    let mut buf = BytesMut::with_capacity(msg.line.len() + 64);
    if config.timestamps {
        buf.put_slice(format_timestamp(&msg.timestamp).as_bytes());
        buf.put_u8(b' ');
    }
    if config.details {
        buf.put_slice(encode_details(&msg.attrs).as_bytes());
        buf.put_u8(b' ');
    }
    buf.put_slice(&msg.line);
    buf.freeze()
}

struct LaneWriter<W> {
    sink: W,
    multiplex: bool,
    codec: StdFrameCodec,
    frame: BytesMut,
}

impl<W> LaneWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn new(sink: W, multiplex: bool) -> Self {
        Self {
            sink,
            multiplex,
            codec: StdFrameCodec::new(),
            frame: BytesMut::new(),
        }
    }

    /// Writes one lane payload as a whole frame, then flushes.
    async fn write_lane(&mut self, lane: StdStream, payload: Bytes) -> io::Result<()> {
        if self.multiplex {
            self.frame.clear();
            self.codec.encode(Frame::new(lane, payload), &mut self.frame)?;
            self.sink.write_all(&self.frame).await?;
        } else {
            self.sink.write_all(&payload).await?;
        }
        self.sink.flush().await
    }
}
