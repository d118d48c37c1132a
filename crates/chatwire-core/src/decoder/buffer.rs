use tracing::{debug, warn};

use super::DecodeError;
use crate::frame::Frame;

/// Upper bound on a single pending record.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1_048_576; // 1 MB

const RECORD_DELIMITER: &[u8] = b"\n\n";
const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Counters describing what the decoder has seen so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecoderStats {
    pub records: u64,
    pub frames: u64,
    /// `data:` lines whose payload did not parse. Each line of a record is
    /// judged on its own.
    pub malformed_lines: u64,
    pub ignored_lines: u64,
}

/// Push-based decoder turning arbitrarily chunked bytes into frames.
///
/// Bytes are buffered raw and only converted to text once a record is
/// complete, so a multi-byte character split across two reads is decoded
/// correctly.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Offset at which the next delimiter search starts. Everything before
    /// it is known not to contain a delimiter.
    scan_from: usize,
    max_record_bytes: usize,
    stats: DecoderStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_record_bytes(DEFAULT_MAX_RECORD_BYTES)
    }

    pub fn with_max_record_bytes(max_record_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scan_from: 0,
            max_record_bytes,
            stats: DecoderStats::default(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Bytes currently held back waiting for a record terminator.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        self.decode_into(chunk, &mut frames)?;
        Ok(frames)
    }

    /// Feed one chunk, appending completed frames to `out`.
    ///
    /// Frames completed by this chunk are appended even when the call fails
    /// because the remaining partial record is over the size bound.
    pub fn decode_into(&mut self, chunk: &[u8], out: &mut Vec<Frame>) -> Result<(), DecodeError> {
        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(end) = find_delimiter(&self.buffer, self.scan_from.max(consumed)) {
            let record = &self.buffer[consumed..end];
            parse_record(record, &mut self.stats, out);
            consumed = end + RECORD_DELIMITER.len();
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        // A delimiter may straddle the boundary between this chunk and the next.
        self.scan_from = self.buffer.len().saturating_sub(RECORD_DELIMITER.len() - 1);

        if self.buffer.len() > self.max_record_bytes {
            let buffered = self.buffer.len();
            self.buffer.clear();
            self.scan_from = 0;
            return Err(DecodeError::RecordTooLarge {
                limit: self.max_record_bytes,
                buffered,
            });
        }

        Ok(())
    }

    /// Flush whatever is left once the connection has ended.
    ///
    /// A final record that arrived without its blank-line terminator is still
    /// parsed; anything unparseable is logged and dropped like any other
    /// malformed record.
    pub fn finish_into(&mut self, out: &mut Vec<Frame>) {
        let rest = std::mem::take(&mut self.buffer);
        self.scan_from = 0;
        if rest.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        debug!(
            target: "chatwire::decoder",
            bytes = rest.len(),
            "Flushing unterminated trailing record"
        );
        parse_record(&rest, &mut self.stats, out);
    }

    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        self.finish_into(&mut frames);
        frames
    }
}

fn find_delimiter(buffer: &[u8], from: usize) -> Option<usize> {
    if from >= buffer.len() {
        return None;
    }
    buffer[from..]
        .windows(RECORD_DELIMITER.len())
        .position(|window| window == RECORD_DELIMITER)
        .map(|pos| pos + from)
}

fn parse_record(record: &[u8], stats: &mut DecoderStats, out: &mut Vec<Frame>) {
    stats.records += 1;
    let text = String::from_utf8_lossy(record);

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            if !line.is_empty() {
                stats.ignored_lines += 1;
            }
            continue;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload).trim_end();
        if payload.is_empty() || payload == DONE_SENTINEL {
            stats.ignored_lines += 1;
            continue;
        }

        match Frame::parse(payload) {
            Ok(frame) => {
                stats.frames += 1;
                out.push(frame);
            }
            Err(e) => {
                stats.malformed_lines += 1;
                warn!(
                    target: "chatwire::decoder",
                    error = %e,
                    payload_len = payload.len(),
                    "Skipping malformed frame line"
                );
            }
        }
    }
}
