use futures_core::Stream;
use futures_util::StreamExt;
use std::pin::Pin;
use tokio_util::bytes::Bytes;
use tracing::debug;

use super::{DecodeError, FrameDecoder};
use crate::frame::Frame;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, DecodeError>> + Send>>;

/// Exclusive hold on the upstream byte reader.
///
/// The reader is dropped (and the connection with it) the first time
/// `release` runs, or when the lease itself is dropped because the consumer
/// abandoned the frame stream. Later calls are no-ops.
struct ReaderLease<S> {
    reader: Option<Pin<Box<S>>>,
}

impl<S> ReaderLease<S> {
    fn new(reader: S) -> Self {
        Self {
            reader: Some(Box::pin(reader)),
        }
    }

    fn reader(&mut self) -> Option<&mut Pin<Box<S>>> {
        self.reader.as_mut()
    }

    fn release(&mut self, reason: &'static str) {
        if let Some(reader) = self.reader.take() {
            drop(reader);
            debug!(target: "chatwire::decoder", reason, "Released upstream reader");
        }
    }
}

impl<S> Drop for ReaderLease<S> {
    fn drop(&mut self) {
        self.release("frame stream dropped");
    }
}

/// Lazily decode a connection body into frames.
///
/// Frames come out in arrival order. Upstream read errors surface once as
/// [`DecodeError::Transport`] and end the stream; malformed records are
/// skipped inside the decoder. The stream ends when the body does.
pub fn decode_frames<S, E>(byte_stream: S, max_record_bytes: usize) -> FrameStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut lease = ReaderLease::new(byte_stream);
        let mut decoder = FrameDecoder::with_max_record_bytes(max_record_bytes);
        let mut frames = Vec::new();

        while let Some(reader) = lease.reader() {
            match reader.next().await {
                Some(Ok(chunk)) => {
                    let outcome = decoder.decode_into(&chunk, &mut frames);
                    for frame in std::mem::take(&mut frames) {
                        yield Ok(frame);
                    }
                    if let Err(e) = outcome {
                        lease.release("decoder failure");
                        yield Err(e);
                    }
                }
                Some(Err(e)) => {
                    lease.release("transport failure");
                    yield Err(DecodeError::transport(e.to_string()));
                }
                None => {
                    lease.release("end of stream");
                    decoder.finish_into(&mut frames);
                    for frame in std::mem::take(&mut frames) {
                        yield Ok(frame);
                    }
                }
            }
        }

        let stats = decoder.stats();
        debug!(
            target: "chatwire::decoder",
            records = stats.records,
            frames = stats.frames,
            malformed = stats.malformed_lines,
            "Frame stream finished"
        );
    };

    Box::pin(stream)
}
