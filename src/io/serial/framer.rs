// src/io/serial/framer.rs
//
// Newline framing for the serial read loop.
// Bytes are buffered until a `\n` arrives; a line that grows past the
// maximum length is split. Whatever is left can be taken with `flush` once
// the device has gone quiet.

const LINE_TERMINATOR: u8 = b'\n';

/// Reassembles newline-delimited lines from arbitrary read chunks.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_length: usize,
}

impl LineFramer {
    pub fn new(max_length: usize) -> Self {
        LineFramer {
            buffer: Vec::new(),
            max_length: max_length.max(1),
        }
    }

    /// Feed a chunk and return every line it completed, terminator stripped.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();

        for &byte in data {
            if byte == LINE_TERMINATOR {
                lines.push(std::mem::take(&mut self.buffer));
                continue;
            }

            self.buffer.push(byte);

            // Force split on max length, keeping a partial character for the next line
            if self.buffer.len() >= self.max_length {
                let cut = match incomplete_tail_start(&self.buffer) {
                    0 => self.buffer.len(),
                    start => start,
                };
                let tail = self.buffer.split_off(cut);
                lines.push(std::mem::replace(&mut self.buffer, tail));
            }
        }

        lines
    }

    /// Bytes received since the last complete line.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Take the unterminated remainder, if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Index where a trailing, not yet complete UTF-8 sequence starts,
/// or `buf.len()` when the buffer ends on a character boundary.
fn incomplete_tail_start(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(4) {
        let start = len - back;
        let byte = buf[start];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if back < width { start } else { len };
    }
    len
}
