// Byte stream -> newline-terminated lines

/// Accumulates raw serial bytes and yields complete lines.
///
/// Iterating drains every complete line currently buffered; once it returns
/// `None` more bytes can be pushed with [`LineFramer::extend`] and iteration
/// picks up where it left off. Lines come back without the terminator (and
/// without a trailing `\r`). Empty lines are skipped.
///
/// A partial line that grows beyond `max_len` is thrown away together with
/// everything up to the next `\n`, so a babbling device can't grow the buffer
/// without bound.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_len.min(4096)),
            max_len,
            discarding: false,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes of the current incomplete line
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Iterator for LineFramer {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > self.max_len {
                    self.buf.clear();
                    self.discarding = true;
                }
                return None;
            };

            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            // Tail of an oversized line
            if std::mem::take(&mut self.discarding) || line.len() > self.max_len {
                continue;
            }
            if !line.is_empty() {
                return Some(line);
            }
        }
    }
}
