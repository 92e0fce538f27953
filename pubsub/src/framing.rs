//! Length-prefixed framing on top of the transport's byte streams: each logical pub/sub
//!  message travels as one frame, delimited by a big-endian length prefix (8 bytes by default,
//!  configurable down to 1).
//!
//! The decoder is a thin state machine between the stream transport and the node. It has to
//!  cope with arbitrary chunking: several frames in one chunk, one frame spread over many
//!  chunks, and a prefix split across chunk boundaries.

use std::net::SocketAddr;

/// Upcalls of the framing decoder. All callbacks are synchronous and fire inline from
///  [`LengthFramer::feed`].
pub trait FrameSink {
    /// a frame's length became known (its prefix is complete); payload bytes follow
    fn on_frame_start(&mut self, frame_len: u64, peer_addr: SocketAddr);

    /// a consumed slice of frame payload, with the number of bytes still missing after it
    fn on_recv_bytes(&mut self, chunk: &[u8], bytes_remaining: u64, peer_addr: SocketAddr);

    /// The current frame is complete. The return value primes the decoder for what follows:
    ///  the next frame's known length, or 0 to read another length prefix.
    fn on_recv_frame(&mut self, peer_addr: SocketAddr) -> u64;
}

pub struct LengthFramer {
    prefix_len: u8,
    prefix_buf: [u8; 8],
    prefix_filled: u8,
    /// bytes missing in the current frame; 0 means "reading a prefix"
    bytes_remaining: u64,
}

impl LengthFramer {
    pub fn new(prefix_len: u8) -> LengthFramer {
        assert!(matches!(prefix_len, 1 | 2 | 4 | 8), "prefix length must be 1, 2, 4 or 8");

        LengthFramer {
            prefix_len,
            prefix_buf: [0; 8],
            prefix_filled: 0,
            bytes_remaining: 0,
        }
    }

    /// prime the decoder: expect `next_len` payload bytes, or a fresh length prefix if 0
    pub fn reset(&mut self, next_len: u64) {
        self.prefix_filled = 0;
        self.bytes_remaining = next_len;
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining
    }

    pub fn feed(&mut self, mut chunk: &[u8], peer_addr: SocketAddr, sink: &mut impl FrameSink) {
        while !chunk.is_empty() {
            if self.bytes_remaining == 0 {
                chunk = self.consume_prefix_bytes(chunk, peer_addr, sink);
                continue;
            }

            let slice_len = std::cmp::min(self.bytes_remaining, chunk.len() as u64) as usize;
            self.bytes_remaining -= slice_len as u64;
            sink.on_recv_bytes(&chunk[..slice_len], self.bytes_remaining, peer_addr);
            chunk = &chunk[slice_len..];

            if self.bytes_remaining == 0 {
                let next_len = sink.on_recv_frame(peer_addr);
                self.reset(next_len);
            }
        }
    }

    fn consume_prefix_bytes<'a>(&mut self, chunk: &'a [u8], peer_addr: SocketAddr, sink: &mut impl FrameSink) -> &'a [u8] {
        let missing = (self.prefix_len - self.prefix_filled) as usize;
        let slice_len = std::cmp::min(missing, chunk.len());

        let filled = self.prefix_filled as usize;
        self.prefix_buf[filled..filled + slice_len].copy_from_slice(&chunk[..slice_len]);
        self.prefix_filled += slice_len as u8;

        if self.prefix_filled == self.prefix_len {
            let mut frame_len = 0u64;
            for &b in &self.prefix_buf[..self.prefix_len as usize] {
                frame_len = (frame_len << 8) | b as u64;
            }

            self.prefix_filled = 0;
            self.bytes_remaining = frame_len;
            sink.on_frame_start(frame_len, peer_addr);

            if frame_len == 0 {
                let next_len = sink.on_recv_frame(peer_addr);
                self.reset(next_len);
            }
        }

        &chunk[slice_len..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 168, 0, 1], 8000))
    }

    #[derive(Default)]
    struct RecordingSink {
        starts: Vec<u64>,
        bytes: Vec<(Vec<u8>, u64)>,
        frames: usize,
        /// lengths to return from on_recv_frame, consumed front to back; empty = prefix mode
        primed: Vec<u64>,
    }

    impl FrameSink for RecordingSink {
        fn on_frame_start(&mut self, frame_len: u64, peer_addr: SocketAddr) {
            assert_eq!(peer_addr, peer());
            self.starts.push(frame_len);
        }

        fn on_recv_bytes(&mut self, chunk: &[u8], bytes_remaining: u64, peer_addr: SocketAddr) {
            assert_eq!(peer_addr, peer());
            self.bytes.push((chunk.to_vec(), bytes_remaining));
        }

        fn on_recv_frame(&mut self, peer_addr: SocketAddr) -> u64 {
            assert_eq!(peer_addr, peer());
            self.frames += 1;
            if self.primed.is_empty() { 0 } else { self.primed.remove(0) }
        }
    }

    /// frames of externally announced lengths 1, 2, 3, 4, 5 - no prefixes on the wire
    #[test]
    fn test_primed_lengths_without_prefixes() {
        let mut framer = LengthFramer::new(8);
        framer.reset(1);

        let mut sink = RecordingSink {
            primed: vec![2, 3, 4, 5],
            ..Default::default()
        };
        framer.feed(b"abcdefghijklmno", peer(), &mut sink);

        assert_eq!(sink.frames, 5);
        assert_eq!(sink.bytes, vec![
            (b"a".to_vec(), 0),
            (b"bc".to_vec(), 0),
            (b"def".to_vec(), 0),
            (b"ghij".to_vec(), 0),
            (b"klmno".to_vec(), 0),
        ]);
        // the lengths were primed, never parsed from the wire
        assert!(sink.starts.is_empty());
    }

    #[rstest]
    #[case::one_chunk(vec![vec![0,0,0,0,0,0,0,3, 1,2,3]])]
    #[case::split_inside_payload(vec![vec![0,0,0,0,0,0,0,3, 1], vec![2,3]])]
    #[case::split_inside_prefix(vec![vec![0,0,0], vec![0,0,0,0,3, 1,2,3]])]
    #[case::byte_by_byte(vec![vec![0],vec![0],vec![0],vec![0],vec![0],vec![0],vec![0],vec![3],vec![1],vec![2],vec![3]])]
    fn test_single_frame_with_prefix(#[case] chunks: Vec<Vec<u8>>) {
        let mut framer = LengthFramer::new(8);
        let mut sink = RecordingSink::default();

        for chunk in chunks {
            framer.feed(&chunk, peer(), &mut sink);
        }

        assert_eq!(sink.starts, vec![3]);
        assert_eq!(sink.frames, 1);
        let reassembled: Vec<u8> = sink.bytes.iter().flat_map(|(b, _)| b.clone()).collect();
        assert_eq!(reassembled, vec![1, 2, 3]);
        assert_eq!(sink.bytes.last().unwrap().1, 0);
        assert_eq!(framer.bytes_remaining(), 0);
    }

    #[test]
    fn test_multiple_frames_per_chunk() {
        let mut framer = LengthFramer::new(2);
        let mut sink = RecordingSink::default();

        framer.feed(&[0,2, 10,11, 0,1, 12, 0,3, 13,14,15], peer(), &mut sink);

        assert_eq!(sink.starts, vec![2, 1, 3]);
        assert_eq!(sink.frames, 3);
        assert_eq!(sink.bytes, vec![
            (vec![10, 11], 0),
            (vec![12], 0),
            (vec![13, 14, 15], 0),
        ]);
    }

    #[test]
    fn test_bytes_remaining_is_reported_per_slice() {
        let mut framer = LengthFramer::new(1);
        let mut sink = RecordingSink::default();

        framer.feed(&[5, 1, 2], peer(), &mut sink);
        framer.feed(&[3], peer(), &mut sink);
        framer.feed(&[4, 5], peer(), &mut sink);

        assert_eq!(sink.bytes, vec![
            (vec![1, 2], 3),
            (vec![3], 2),
            (vec![4, 5], 0),
        ]);
        assert_eq!(sink.frames, 1);
    }

    #[test]
    fn test_empty_frame() {
        let mut framer = LengthFramer::new(2);
        let mut sink = RecordingSink::default();

        framer.feed(&[0,0, 0,1, 9], peer(), &mut sink);

        assert_eq!(sink.starts, vec![0, 1]);
        assert_eq!(sink.frames, 2);
        assert_eq!(sink.bytes, vec![(vec![9], 0)]);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    #[case(8)]
    fn test_prefix_lengths(#[case] prefix_len: u8) {
        let mut framer = LengthFramer::new(prefix_len);
        let mut sink = RecordingSink::default();

        let mut wire = vec![0u8; prefix_len as usize - 1];
        wire.push(2);
        wire.extend_from_slice(&[7, 8]);

        framer.feed(&wire, peer(), &mut sink);

        assert_eq!(sink.starts, vec![2]);
        assert_eq!(sink.bytes, vec![(vec![7, 8], 0)]);
        assert_eq!(sink.frames, 1);
    }

    #[test]
    #[should_panic]
    fn test_invalid_prefix_length() {
        LengthFramer::new(3);
    }
}
