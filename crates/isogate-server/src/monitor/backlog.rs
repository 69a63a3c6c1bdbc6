//! Bounded backlog of monitor blocks.
//!
//! Holds the newest reports not yet delivered so a monitor endpoint that
//! comes back receives recent state without the gateway buffering forever.
//! Eviction is per block, so whatever is delivered always starts at a block
//! boundary.

use std::collections::VecDeque;

/// Queue of whole blocks whose total size never exceeds `capacity` bytes.
#[derive(Debug)]
pub struct Backlog {
    blocks: VecDeque<Vec<u8>>,
    capacity: usize,
    len: usize,
    /// Bytes discarded because the queue was full.
    dropped: u64,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            capacity,
            len: 0,
            dropped: 0,
        }
    }

    /// Append one block, evicting the oldest blocks until it fits. A block
    /// larger than the whole capacity is dropped.
    pub fn push(&mut self, block: &[u8]) {
        if block.len() > self.capacity {
            self.dropped += block.len() as u64;
            return;
        }
        while self.len + block.len() > self.capacity {
            let Some(oldest) = self.blocks.pop_front() else {
                break;
            };
            self.len -= oldest.len();
            self.dropped += oldest.len() as u64;
        }
        self.len += block.len();
        self.blocks.push_back(block.to_vec());
    }

    /// Everything pending, oldest block first.
    pub fn peek(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out
    }

    /// Forget everything after a successful delivery.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_peek_clear() {
        let mut b = Backlog::new(10);
        b.push(b"hello");
        b.push(b"abc");
        assert_eq!(b.peek(), b"helloabc");
        assert_eq!(b.len(), 8);
        b.clear();
        assert!(b.is_empty());
        assert_eq!(b.peek(), Vec::<u8>::new());
    }

    #[test]
    fn overflow_evicts_whole_blocks() {
        let mut b = Backlog::new(10);
        b.push(b"B1-aaa\n");
        b.push(b"B2-b\n");
        assert_eq!(b.peek(), b"B2-b\n");
        assert_eq!(b.dropped(), 7);
        b.push(b"B3-c\n");
        assert_eq!(b.peek(), b"B2-b\nB3-c\n");
    }

    #[test]
    fn delivered_bytes_start_at_block_boundary() {
        let mut b = Backlog::new(64);
        for i in 0..50 {
            b.push(format!("BEGIN {i}\nEND\n").as_bytes());
        }
        let pending = String::from_utf8(b.peek()).unwrap();
        assert!(pending.starts_with("BEGIN "));
        assert!(pending.ends_with("BEGIN 49\nEND\n"));
        assert!(b.len() <= 64);
    }

    #[test]
    fn oversized_block_is_dropped() {
        let mut b = Backlog::new(4);
        b.push(b"ok");
        b.push(b"too long");
        assert_eq!(b.peek(), b"ok");
        assert_eq!(b.dropped(), 8);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut b = Backlog::new(0);
        b.push(b"test");
        assert!(b.is_empty());
        assert_eq!(b.dropped(), 4);
    }
}
