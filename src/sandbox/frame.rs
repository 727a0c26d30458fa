//! Incremental decoder for Docker's multiplexed exec output.
//!
//! Without a TTY the Engine interleaves stdout and stderr in a single byte
//! stream. Each frame is an 8-byte header (stream id, three reserved bytes,
//! big-endian payload length) followed by the payload. Transport chunks do
//! not respect frame boundaries, so partial headers and payloads are buffered
//! until complete.

use crate::error::{Error, Result};

const HEADER_LEN: usize = 8;

/// Accumulates demultiplexed output up to a per-stream byte limit.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    limit: usize,
}

impl FrameDecoder {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            limit,
        }
    }

    /// Feeds a transport chunk, decoding every complete frame it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);

        let mut consumed = 0;
        while self.buf.len() - consumed >= HEADER_LEN {
            let header = &self.buf[consumed..consumed + HEADER_LEN];
            let stream = header[0];
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

            let start = consumed + HEADER_LEN;

            let target = match stream {
                1 => Some((&mut self.stdout, "stdout")),
                // 3 is the Engine's own error channel; surface it with stderr.
                2 | 3 => Some((&mut self.stderr, "stderr")),
                _ => None,
            };
            // Checked on the header so an oversized frame is never buffered.
            if let Some((target, name)) = &target {
                if target.len().saturating_add(len) > self.limit {
                    return Err(Error::OutputLimit {
                        stream: *name,
                        limit: self.limit,
                    });
                }
            }

            if self.buf.len() - start < len {
                break;
            }
            if let Some((target, _)) = target {
                target.extend_from_slice(&self.buf[start..start + len]);
            }
            consumed = start + len;
        }

        self.buf.drain(..consumed);
        Ok(())
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Returns decoded (stdout, stderr). A trailing partial frame is dropped.
    pub fn finish(self) -> (String, String) {
        if !self.buf.is_empty() {
            tracing::warn!(bytes = self.buf.len(), "discarding incomplete output frame");
        }
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn sample() -> Vec<u8> {
        let mut bytes = frame(1, b"hello ");
        bytes.extend(frame(2, b"warning\n"));
        bytes.extend(frame(1, b"world\n"));
        bytes
    }

    #[test]
    fn decodes_interleaved_frames() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&sample()).unwrap();
        assert_eq!(decoder.pending(), 0);

        let (stdout, stderr) = decoder.finish();
        assert_eq!(stdout, "hello world\n");
        assert_eq!(stderr, "warning\n");
    }

    #[test]
    fn chunk_boundaries_do_not_change_the_result() {
        let bytes = sample();
        let whole = {
            let mut d = FrameDecoder::new(1024);
            d.push(&bytes).unwrap();
            d.finish()
        };

        // split mid-header, mid-payload, and byte by byte
        for split in [3, 11, 17] {
            let mut d = FrameDecoder::new(1024);
            d.push(&bytes[..split]).unwrap();
            d.push(&bytes[split..]).unwrap();
            assert_eq!(d.finish(), whole, "split at {}", split);
        }

        let mut d = FrameDecoder::new(1024);
        for b in &bytes {
            d.push(std::slice::from_ref(b)).unwrap();
        }
        assert_eq!(d.finish(), whole);
    }

    #[test]
    fn partial_header_is_buffered() {
        let bytes = frame(1, b"abc");
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&bytes[..5]).unwrap();
        assert_eq!(decoder.pending(), 5);
        decoder.push(&bytes[5..]).unwrap();
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.finish().0, "abc");
    }

    #[test]
    fn stdin_frames_are_ignored() {
        let mut bytes = frame(0, b"ignored");
        bytes.extend(frame(1, b"kept"));
        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&bytes).unwrap();
        assert_eq!(decoder.finish(), ("kept".to_string(), String::new()));
    }

    #[test]
    fn limit_is_per_stream() {
        let mut decoder = FrameDecoder::new(4);
        decoder.push(&frame(1, b"1234")).unwrap();
        decoder.push(&frame(2, b"5678")).unwrap();
        let err = decoder.push(&frame(1, b"9")).unwrap_err();
        assert!(matches!(err, Error::OutputLimit { stream: "stdout", limit: 4 }));
    }

    #[test]
    fn oversized_header_fails_before_payload_arrives() {
        let mut header = vec![2, 0, 0, 0];
        header.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut decoder = FrameDecoder::new(1024);
        let err = decoder.push(&header).unwrap_err();
        assert!(matches!(err, Error::OutputLimit { stream: "stderr", limit: 1024 }));
    }

    #[test]
    fn oversized_stdin_frame_is_not_limited() {
        let mut decoder = FrameDecoder::new(4);
        decoder.push(&frame(0, b"longer than four")).unwrap();
        assert_eq!(decoder.pending(), 0);
    }
}
