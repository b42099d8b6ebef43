//! Fixed-capacity sample ring shared between the network side (producer)
//! and the render thread (consumer).
//!
//! Properties the playout path relies on:
//!   - `write` never blocks. When the ring is full the oldest unread samples
//!     are evicted (the read cursor is pushed forward).
//!   - `read` never blocks. Slots with no data come back as 0.0.
//!   - No locks. Cursors are monotonically increasing atomics and samples are
//!     stored as `f32` bit patterns in `AtomicU32` slots, so a producer that
//!     laps a slow reader cannot cause a data race, only a retried read.
//!
//! Exactly one producer and one consumer may use a ring at a time.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// How often the consumer retries when the producer evicts underneath it
/// before giving up and serving silence for this block.
const MAX_READ_ATTEMPTS: usize = 4;

pub struct RingBuffer {
    slots: Box<[AtomicU32]>,
    capacity: usize,
    /// Total samples ever written. Only the producer stores it.
    write_pos: AtomicUsize,
    /// Total samples ever consumed or evicted.
    read_pos: AtomicUsize,
    overrun: AtomicU64,
    underrun: AtomicU64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        let slots = (0..capacity)
            .map(|_| AtomicU32::new(0f32.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            capacity,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            overrun: AtomicU64::new(0),
            underrun: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Unread samples currently held (0..=capacity).
    pub fn available(&self) -> usize {
        let r = self.read_pos.load(Ordering::Acquire);
        let w = self.write_pos.load(Ordering::Acquire);
        w.saturating_sub(r).min(self.capacity)
    }

    /// Append samples, evicting the oldest unread ones if there is no room.
    pub fn write(&self, samples: &[f32]) {
        // Anything older than the last `capacity` samples would be evicted by
        // this very call anyway.
        let skipped = samples.len().saturating_sub(self.capacity);
        let samples = &samples[skipped..];
        if samples.is_empty() {
            return;
        }

        let w = self.write_pos.load(Ordering::Relaxed);
        let new_w = w + samples.len();

        // Evict first, then overwrite. A reader that observes any of the new
        // slot values (Acquire) is guaranteed to also see the advanced read
        // cursor, so its commit CAS fails and it retries.
        if new_w > self.capacity {
            let min_read = new_w - self.capacity;
            let prev = self.read_pos.fetch_max(min_read, Ordering::AcqRel);
            if prev < min_read {
                let evicted = (min_read - prev).min(w.saturating_sub(prev));
                self.overrun
                    .fetch_add((evicted + skipped) as u64, Ordering::Relaxed);
            } else if skipped > 0 {
                self.overrun.fetch_add(skipped as u64, Ordering::Relaxed);
            }
        } else if skipped > 0 {
            self.overrun.fetch_add(skipped as u64, Ordering::Relaxed);
        }

        for (i, s) in samples.iter().enumerate() {
            self.slots[(w + i) % self.capacity].store(s.to_bits(), Ordering::Release);
        }

        self.write_pos.store(new_w, Ordering::Release);
    }

    /// Fill `out` from the ring. Returns how many slots carried real data;
    /// the rest of `out` is zeroed. Allocation-free, used on the render path.
    pub fn read_into(&self, out: &mut [f32]) -> usize {
        for _ in 0..MAX_READ_ATTEMPTS {
            let r = self.read_pos.load(Ordering::Acquire);
            let w = self.write_pos.load(Ordering::Acquire);
            let n = w.saturating_sub(r).min(out.len());

            for (i, o) in out[..n].iter_mut().enumerate() {
                *o = f32::from_bits(self.slots[(r + i) % self.capacity].load(Ordering::Acquire));
            }

            if self
                .read_pos
                .compare_exchange(r, r + n, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                out[n..].fill(0.0);
                if n < out.len() {
                    self.underrun
                        .fetch_add((out.len() - n) as u64, Ordering::Relaxed);
                }
                return n;
            }
            // Producer evicted what we were copying; start over from the new cursor.
        }

        out.fill(0.0);
        self.underrun.fetch_add(out.len() as u64, Ordering::Relaxed);
        0
    }

    /// Read up to `n` samples, padding with silence.
    pub fn read(&self, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; n];
        self.read_into(&mut out);
        out
    }

    /// Drop every unread sample. Safe to call from the producer side.
    pub fn clear(&self) {
        let w = self.write_pos.load(Ordering::Acquire);
        self.read_pos.fetch_max(w, Ordering::AcqRel);
    }

    /// Samples evicted because the writer outran the reader.
    pub fn overrun_samples(&self) -> u64 {
        self.overrun.load(Ordering::Relaxed)
    }

    /// Slots served as silence because the reader outran the writer.
    pub fn underrun_samples(&self) -> u64 {
        self.underrun.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|v| v as f32).collect()
    }

    #[test]
    fn empty_read_is_silence() {
        let rb = RingBuffer::new(8);
        assert_eq!(rb.read(4), vec![0.0; 4]);
        assert_eq!(rb.underrun_samples(), 4);
    }

    #[test]
    fn partial_read_pads_with_zero() {
        let rb = RingBuffer::new(8);
        rb.write(&[0.5, -0.5, 0.25]);
        let mut out = [9.0f32; 5];
        assert_eq!(rb.read_into(&mut out), 3);
        assert_eq!(out, [0.5, -0.5, 0.25, 0.0, 0.0]);
        assert_eq!(rb.available(), 0);
    }

    #[test]
    fn returned_count_is_min_of_requested_and_available() {
        let rb = RingBuffer::new(16);
        let mut produced = 0;
        for (w, r) in [(5, 3), (0, 4), (10, 2), (7, 20), (16, 16)] {
            rb.write(&ramp(produced, w));
            produced += w;
            let available = rb.available();
            let mut out = vec![1.0; r];
            let n = rb.read_into(&mut out);
            assert_eq!(n, r.min(available));
            assert!(out[n..].iter().all(|s| *s == 0.0));
            // Retained data comes out oldest first.
            for (i, s) in out[..n].iter().enumerate() {
                assert_eq!(*s, (produced - available + i) as f32);
            }
        }
    }

    #[test]
    fn overflow_keeps_latest_capacity_samples() {
        let cap = 4096;
        let k = 100;
        let rb = RingBuffer::new(cap);
        rb.write(&ramp(0, cap + k));
        assert_eq!(rb.available(), cap);
        assert_eq!(rb.read(cap), ramp(k, cap));
        assert_eq!(rb.overrun_samples(), k as u64);
    }

    #[test]
    fn overflow_across_separate_writes_evicts_oldest() {
        let rb = RingBuffer::new(8);
        rb.write(&ramp(0, 6));
        rb.write(&ramp(6, 5));
        assert_eq!(rb.available(), 8);
        assert_eq!(rb.read(8), ramp(3, 8));
        assert_eq!(rb.overrun_samples(), 3);
    }

    #[test]
    fn clear_discards_history() {
        let rb = RingBuffer::new(8);
        rb.write(&[1.0, 2.0, 3.0]);
        rb.clear();
        assert_eq!(rb.available(), 0);
        rb.write(&[4.0]);
        assert_eq!(rb.read(2), vec![4.0, 0.0]);
    }

    #[test]
    fn concurrent_producer_consumer_stays_ordered() {
        let rb = Arc::new(RingBuffer::new(256));
        let producer = {
            let rb = rb.clone();
            std::thread::spawn(move || {
                for chunk in 0..2000usize {
                    rb.write(&ramp(chunk * 32 + 1, 32));
                }
            })
        };

        let mut last = 0.0f32;
        let mut out = [0.0f32; 64];
        while !producer.is_finished() || rb.available() > 0 {
            let n = rb.read_into(&mut out);
            for s in &out[..n] {
                // Evictions may skip values but never reorder them.
                assert!(*s > last, "{s} after {last}");
                last = *s;
            }
        }
        producer.join().unwrap();
    }
}
