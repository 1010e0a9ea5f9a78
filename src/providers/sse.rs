//! Incremental server-sent-events framing.
//!
//! HTTP chunks do not align with SSE frame boundaries, so adapters feed raw
//! bytes into a [`Framer`] and get back only complete frames (blocks
//! separated by a blank line). The tail left after the connection closes is
//! recoverable via [`Framer::finish`], since some vendors omit the final
//! blank line.

/// One parsed SSE frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    /// Value of the `event:` field, if present.
    pub event: Option<String>,
    /// Concatenated `data:` lines, joined with `\n`.
    pub data: String,
}

impl Frame {
    /// Parse one frame block. Returns `None` for comment-only or empty
    /// blocks.
    pub fn parse(block: &str) -> Option<Self> {
        let mut event = None;
        let mut data_lines = Vec::new();

        for line in block.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.strip_prefix(' ').unwrap_or(value));
            }
            // Other fields (id:, retry:, comments) are ignored.
        }

        if event.is_none() && data_lines.is_empty() {
            return None;
        }
        Some(Self {
            event,
            data: data_lines.join("\n"),
        })
    }
}

/// Splits an incoming byte stream into complete SSE frames.
///
/// Buffers raw bytes and decodes only complete blocks; a multi-byte UTF-8
/// character split across network chunks stays intact.
#[derive(Debug, Default)]
pub(crate) struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        // Some vendors terminate lines with \r\n; normalize up front so the
        // frame boundary is always a blank line.
        self.buffer.extend(chunk.iter().filter(|&&b| b != b'\r'));
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).take(pos).collect();
            if let Some(frame) = Frame::parse(&String::from_utf8_lossy(&block)) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Drain whatever remains after the connection closed.
    pub fn finish(self) -> Option<Frame> {
        let tail = String::from_utf8_lossy(&self.buffer);
        let tail = tail.trim();
        if tail.is_empty() {
            None
        } else {
            Frame::parse(tail)
        }
    }
}
