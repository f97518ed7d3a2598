//! Bounded upload queue: holds compressed batches awaiting HTTP delivery
//! (spec §4.5, C8). Capacity 20, reject-newest overflow policy, FIFO with
//! head-requeue on delivery failure so a batch is never dropped just
//! because one upload attempt failed.

use crate::compressor::CompressedBatch;
use std::collections::VecDeque;

pub const UPLOAD_QUEUE_CAPACITY: usize = 20;

#[derive(Debug, Default)]
pub struct UploadQueue {
    queue: VecDeque<CompressedBatch>,
    rejected_count: u64,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self { queue: VecDeque::with_capacity(UPLOAD_QUEUE_CAPACITY), rejected_count: 0 }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= UPLOAD_QUEUE_CAPACITY
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected_count
    }

    /// Enqueue a freshly compressed batch. Returns `false` without
    /// modifying the queue if it is already at capacity — the new batch is
    /// the one rejected, not an existing one (spec §4.5 "reject-newest").
    pub fn try_enqueue(&mut self, batch: CompressedBatch) -> bool {
        if self.is_full() {
            self.rejected_count += 1;
            return false;
        }
        self.queue.push_back(batch);
        true
    }

    /// Look at the oldest queued batch without removing it, to attempt
    /// delivery.
    pub fn peek_head(&self) -> Option<&CompressedBatch> {
        self.queue.front()
    }

    /// Remove the oldest batch after a confirmed successful upload.
    pub fn pop_head(&mut self) -> Option<CompressedBatch> {
        self.queue.pop_front()
    }

    /// Delivery of the head batch failed; it stays at the front of the
    /// queue for the next attempt. Present for symmetry with `pop_head` and
    /// to make the "never drop on failed attempt" invariant explicit at
    /// call sites — since peek never removed it, there is nothing to undo.
    pub fn requeue_head(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{BatchHeader, CompressionStats};
    use crate::codecs::MethodTag;

    fn dummy_batch(tag: u16) -> CompressedBatch {
        CompressedBatch {
            header: BatchHeader {
                register_ids: vec![0],
                sample_count: 1,
                method: MethodTag::BitPacked,
                encoded_timestamp_ms: tag as u64,
            },
            body: vec![0, 0, 0],
            stats: CompressionStats {
                original_bytes: 2,
                compressed_bytes: 3,
                compression_ratio: 0.6,
                elapsed_micros: 0,
                lossless_verified: true,
            },
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let mut q = UploadQueue::new();
        for i in 0..5 {
            assert!(q.try_enqueue(dummy_batch(i)));
        }
        for i in 0..5 {
            assert_eq!(q.peek_head().unwrap().header.encoded_timestamp_ms, i as u64);
            q.pop_head();
        }
        assert!(q.is_empty());
    }

    #[test]
    fn overflow_rejects_newest_not_oldest() {
        let mut q = UploadQueue::new();
        for i in 0..UPLOAD_QUEUE_CAPACITY {
            assert!(q.try_enqueue(dummy_batch(i as u16)));
        }
        assert!(q.is_full());
        assert!(!q.try_enqueue(dummy_batch(999)));
        assert_eq!(q.rejected_count(), 1);
        assert_eq!(q.peek_head().unwrap().header.encoded_timestamp_ms, 0);
        assert_eq!(q.len(), UPLOAD_QUEUE_CAPACITY);
    }

    #[test]
    fn failed_delivery_keeps_batch_at_head() {
        let mut q = UploadQueue::new();
        q.try_enqueue(dummy_batch(1));
        q.try_enqueue(dummy_batch(2));
        let head_ts = q.peek_head().unwrap().header.encoded_timestamp_ms;
        q.requeue_head();
        assert_eq!(q.peek_head().unwrap().header.encoded_timestamp_ms, head_ts);
        assert_eq!(q.len(), 2);
    }
}
