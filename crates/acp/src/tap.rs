//! Optional mirror of every frame crossing the endpoint.
//!
//! Records carry the raw bytes plus direction and wall-clock timestamp; the
//! method name is pulled out by a shallow byte scan so the tap never re-parses
//! payloads. The stream is bounded: a slow consumer lags and loses the oldest
//! records rather than ever stalling the data path.

use std::time::SystemTime;

/// Which way a frame travelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One mirrored frame.
#[derive(Clone, Debug)]
pub struct TapRecord {
    pub direction: Direction,
    pub timestamp: SystemTime,
    pub raw: Vec<u8>,
    pub method: Option<String>,
}

impl TapRecord {
    pub(crate) fn new(direction: Direction, raw: &[u8]) -> Self {
        Self {
            direction,
            timestamp: SystemTime::now(),
            raw: raw.to_vec(),
            method: extract_method(raw),
        }
    }
}

/// Finds the value of a top-level `"method"` key without parsing the frame.
pub(crate) fn extract_method(frame: &[u8]) -> Option<String> {
    let mut depth = 0usize;
    let mut i = 0;
    let n = frame.len();

    while i < n {
        match frame[i] {
            b'"' => {
                let (content, close) = read_string(frame, i)?;
                if depth == 1 {
                    let mut j = close + 1;
                    while j < n && frame[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if j < n && frame[j] == b':' {
                        if content == b"method" {
                            let mut k = j + 1;
                            while k < n && frame[k].is_ascii_whitespace() {
                                k += 1;
                            }
                            if k < n && frame[k] == b'"' {
                                let (value, _) = read_string(frame, k)?;
                                return String::from_utf8(value.to_vec()).ok();
                            }
                            return None;
                        }
                        i = j + 1;
                        continue;
                    }
                }
                i = close + 1;
            }
            b'{' | b'[' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

/// Returns the string content starting at the quote `frame[start]` and the
/// index of its closing quote.
fn read_string(frame: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let mut i = start + 1;
    let mut escaped = false;
    while i < frame.len() {
        let byte = frame[i];
        if escaped {
            escaped = false;
        } else if byte == b'\\' {
            escaped = true;
        } else if byte == b'"' {
            return Some((&frame[start + 1..i], i));
        }
        i += 1;
    }
    None
}
