//! Batched compressed output.
//!
//! A [`StreamBuffer`] collects formatted lines and turns them into a single
//! compressed frame when it runs out of room or when its deadline passes.
//! The deadline is set by the first append into an empty buffer and is not
//! pushed back by later appends, so no line waits longer than one timeout.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{Codec, compress_bound};
use crate::error::BufferError;

/// Default input capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Default flush timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Receiver of flushed frames.
pub trait FrameSink {
    fn deliver(&mut self, frame: &[u8]);
}

#[derive(Debug)]
pub struct StreamBuffer {
    input: Vec<u8>,
    capacity: usize,
    output: Vec<u8>,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl StreamBuffer {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            input: Vec::with_capacity(capacity),
            capacity,
            output: vec![0; compress_bound(capacity)],
            timeout,
            deadline: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.input.len()
    }

    /// When the pending flush is due, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Append one complete unit of text.
    ///
    /// If the unit does not fit, whatever is buffered is flushed to `sink`
    /// first. A unit larger than the whole buffer is dropped and never split.
    pub fn append<S: FrameSink + ?Sized>(
        &mut self,
        text: &[u8],
        codec: &mut Codec,
        sink: &mut S,
    ) -> Result<(), BufferError> {
        if text.is_empty() {
            return Ok(());
        }

        if text.len() > self.remaining() {
            self.flush(codec, sink);
            if text.len() > self.capacity {
                let err = BufferError::TooLarge {
                    len: text.len(),
                    capacity: self.capacity,
                };
                warn!("{}", err);
                return Err(err);
            }
        }

        self.input.extend_from_slice(text);
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.timeout);
        }
        Ok(())
    }

    /// Compress everything buffered into one frame and hand it to `sink`.
    ///
    /// Returns whether a frame was delivered. A compression failure drops the
    /// buffered data. Either way the buffer ends up empty and disarmed.
    pub fn flush<S: FrameSink + ?Sized>(&mut self, codec: &mut Codec, sink: &mut S) -> bool {
        if self.input.is_empty() {
            return false;
        }

        let result = codec.compress_into(&mut self.output, &self.input);
        let len = self.input.len();
        self.input.clear();
        self.deadline = None;

        match result {
            Ok(n) => {
                debug!(input = len, frame = n, "flushed stream buffer");
                sink.deliver(&self.output[..n]);
                true
            }
            Err(e) => {
                warn!(error = %e, dropped = len, "stream compression error");
                false
            }
        }
    }

    /// Flush if the deadline is at or before `now`.
    pub fn poll_expired<S: FrameSink + ?Sized>(
        &mut self,
        now: Instant,
        codec: &mut Codec,
        sink: &mut S,
    ) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => self.flush(codec, sink),
            _ => false,
        }
    }

    /// Disarm the flush timer. Buffered bytes stay until the next flush.
    /// Safe to call when nothing is armed.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{DICT, decompress};

    #[derive(Default)]
    struct Frames(Vec<Vec<u8>>);

    impl FrameSink for Frames {
        fn deliver(&mut self, frame: &[u8]) {
            self.0.push(frame.to_vec());
        }
    }

    fn codec() -> Codec {
        Codec::new(3, Some(DICT)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn batches_until_timeout() {
        let mut codec = codec();
        let mut frames = Frames::default();
        let mut buf = StreamBuffer::new(64, Duration::from_millis(1000));

        buf.append(b"phy0;a\n", &mut codec, &mut frames).unwrap();
        buf.append(b"phy0;b\n", &mut codec, &mut frames).unwrap();
        buf.append(b"phy1;c\n", &mut codec, &mut frames).unwrap();
        assert!(frames.0.is_empty());
        assert_eq!(buf.len(), 21);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!buf.poll_expired(Instant::now(), &mut codec, &mut frames));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(buf.poll_expired(Instant::now(), &mut codec, &mut frames));
        assert_eq!(frames.0.len(), 1);
        assert_eq!(decompress(&frames.0[0]), b"phy0;a\nphy0;b\nphy1;c\n");
        assert!(buf.is_empty());
        assert!(!buf.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_not_pushed_back() {
        let mut codec = codec();
        let mut frames = Frames::default();
        let mut buf = StreamBuffer::new(64, Duration::from_millis(100));

        buf.append(b"one\n", &mut codec, &mut frames).unwrap();
        let first = buf.deadline().unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        buf.append(b"two\n", &mut codec, &mut frames).unwrap();
        assert_eq!(buf.deadline(), Some(first));

        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(buf.poll_expired(Instant::now(), &mut codec, &mut frames));
        assert!(!buf.poll_expired(Instant::now(), &mut codec, &mut frames));
        assert_eq!(frames.0.len(), 1);
        assert_eq!(decompress(&frames.0[0]), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn full_buffer_flushes_before_append() {
        let mut codec = codec();
        let mut frames = Frames::default();
        let mut buf = StreamBuffer::new(10, Duration::from_secs(60));

        buf.append(b"aaaaaa\n", &mut codec, &mut frames).unwrap();
        buf.append(b"bbbbbb\n", &mut codec, &mut frames).unwrap();

        assert_eq!(frames.0.len(), 1);
        assert_eq!(decompress(&frames.0[0]), b"aaaaaa\n");
        assert_eq!(buf.len(), 7);
        assert!(buf.is_armed());
    }

    #[tokio::test]
    async fn exact_fit_does_not_flush() {
        let mut codec = codec();
        let mut frames = Frames::default();
        let mut buf = StreamBuffer::new(8, Duration::from_secs(60));

        buf.append(b"1234567\n", &mut codec, &mut frames).unwrap();
        assert!(frames.0.is_empty());
        assert_eq!(buf.remaining(), 0);
    }

    #[tokio::test]
    async fn oversize_message_rejected() {
        let mut codec = codec();
        let mut frames = Frames::default();
        let mut buf = StreamBuffer::new(8, Duration::from_secs(60));

        let err = buf
            .append(b"123456789", &mut codec, &mut frames)
            .unwrap_err();
        assert!(matches!(
            err,
            BufferError::TooLarge {
                len: 9,
                capacity: 8
            }
        ));
        assert!(buf.is_empty());
        assert!(!buf.is_armed());
        assert!(frames.0.is_empty());
    }

    #[tokio::test]
    async fn oversize_message_flushes_pending_data() {
        let mut codec = codec();
        let mut frames = Frames::default();
        let mut buf = StreamBuffer::new(8, Duration::from_secs(60));

        buf.append(b"ab\n", &mut codec, &mut frames).unwrap();
        assert!(buf.append(&[b'x'; 20], &mut codec, &mut frames).is_err());

        assert_eq!(frames.0.len(), 1);
        assert_eq!(decompress(&frames.0[0]), b"ab\n");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn flush_of_empty_buffer_is_noop() {
        let mut codec = codec();
        let mut frames = Frames::default();
        let mut buf = StreamBuffer::new(8, Duration::from_secs(60));

        assert!(!buf.flush(&mut codec, &mut frames));
        assert!(frames.0.is_empty());
        assert!(!buf.is_armed());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let mut codec = codec();
        let mut frames = Frames::default();
        let mut buf = StreamBuffer::new(8, Duration::from_secs(60));

        buf.cancel();
        buf.append(b"x\n", &mut codec, &mut frames).unwrap();
        buf.cancel();
        buf.cancel();
        assert!(!buf.is_armed());
        assert_eq!(buf.len(), 2);

        assert!(buf.flush(&mut codec, &mut frames));
        assert_eq!(decompress(&frames.0[0]), b"x\n");
    }

    #[tokio::test]
    async fn empty_append_does_not_arm() {
        let mut codec = codec();
        let mut frames = Frames::default();
        let mut buf = StreamBuffer::new(8, Duration::from_secs(60));

        buf.append(b"", &mut codec, &mut frames).unwrap();
        assert!(!buf.is_armed());
    }

    #[test]
    fn output_region_covers_worst_case() {
        let buf = StreamBuffer::new(DEFAULT_CAPACITY, DEFAULT_TIMEOUT);
        assert!(buf.output.len() >= DEFAULT_CAPACITY);
        assert_eq!(buf.output.len(), compress_bound(DEFAULT_CAPACITY));
    }
}
