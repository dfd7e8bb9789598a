//! Extraction of whole top-level JSON values from a noisy byte stream.
//!
//! Agent processes routinely interleave diagnostic text with protocol frames
//! on the same channel, so the framer cannot assume one JSON value per line.
//! It balances braces and brackets (honoring strings and escapes) and drops
//! anything that cannot open a JSON value, one line at a time. It never
//! interprets JSON semantics beyond balancing; decoding is the codec's job.

use tracing::warn;

/// Longest non-JSON prefix tolerated while waiting for a newline. Past this
/// the stream is considered hopelessly noisy and the buffer is discarded.
const MAX_NOISE_PREFIX: usize = 4096;

/// Buffer size at which an incomplete frame triggers a warning.
const FRAME_GROWTH_WARN_BYTES: usize = 200_000;

fn is_json_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n')
}

/// Append-only buffer that yields one complete top-level JSON value at a
/// time via [`FrameBuffer::pop_frame`].
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    warned_growth: bool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Removes and returns the next complete frame, or `None` if no full
    /// value has arrived yet. Noise (bytes that cannot begin a JSON value)
    /// is silently discarded line by line.
    ///
    /// After a frame is returned the buffer holds only bytes that were not
    /// part of it.
    pub fn pop_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(start) = self.buf.iter().position(|b| !is_json_whitespace(*b)) else {
                self.buf.clear();
                return None;
            };
            if start > 0 {
                self.buf.drain(..start);
            }

            if self.buf[0] != b'{' && self.buf[0] != b'[' {
                match self.buf.iter().position(|&b| b == b'\n') {
                    Some(newline) => {
                        self.buf.drain(..=newline);
                        continue;
                    }
                    None => {
                        if self.buf.len() > MAX_NOISE_PREFIX {
                            warn!(
                                dropped = self.buf.len(),
                                "discarding hopelessly noisy stream buffer"
                            );
                            self.buf.clear();
                        }
                        return None;
                    }
                }
            }

            if let Some(end) = scan_balanced(&self.buf) {
                let frame: Vec<u8> = self.buf.drain(..=end).collect();
                self.warned_growth = false;
                return Some(frame);
            }

            if self.buf.len() > FRAME_GROWTH_WARN_BYTES && !self.warned_growth {
                warn!(
                    buffered = self.buf.len(),
                    "frame buffer growing without producing a frame"
                );
                self.warned_growth = true;
            }
            return None;
        }
    }
}

/// Returns the index of the byte closing the value opened at `buf[0]`, or
/// `None` if the value is still incomplete.
fn scan_balanced(buf: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, &byte) in buf.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' | b'[' if !in_string => depth += 1,
            b'}' | b']' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}
