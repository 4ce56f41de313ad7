//! Bucket boundary arithmetic shared by all metric producers.
//!
//! Buckets are half-open `[start, end)` intervals aligned to multiples of
//! the bucket size relative to the producer's creation time. A forced split
//! (app upgrade, activation edge) cuts the current bucket at an arbitrary
//! millisecond-truncated timestamp; the partial bucket that follows ends at
//! the next regular boundary, after which alignment resumes.

use crate::time::truncate_to_ms;

/// Boundary state for one producer.
#[derive(Debug, Clone)]
pub struct BucketState {
    /// Alignment origin: the producer's creation timestamp.
    origin_ns: i64,
    bucket_size_ns: i64,
    min_bucket_size_ns: i64,
    current_start_ns: i64,
}

/// Outcome of a forced split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedSplit {
    pub start_ns: i64,
    pub end_ns: i64,
    /// The partial bucket was below the minimum size; its data must be
    /// dropped and recorded as a skipped interval.
    pub too_small: bool,
}

impl BucketState {
    pub fn new(origin_ns: i64, bucket_size_ns: i64, min_bucket_size_ns: i64) -> Self {
        debug_assert!(bucket_size_ns > 0);
        Self {
            origin_ns,
            bucket_size_ns,
            min_bucket_size_ns,
            current_start_ns: origin_ns,
        }
    }

    pub fn bucket_size_ns(&self) -> i64 {
        self.bucket_size_ns
    }

    pub fn current_start_ns(&self) -> i64 {
        self.current_start_ns
    }

    /// End of the current bucket: the next aligned boundary strictly after
    /// the current start. After a forced split the current bucket is
    /// partial, so this is closer than one full bucket size.
    pub fn current_end_ns(&self) -> i64 {
        let k = (self.current_start_ns - self.origin_ns).div_euclid(self.bucket_size_ns);
        self.origin_ns + (k + 1) * self.bucket_size_ns
    }

    /// Whether a mutation at `t` must finalize the current bucket first.
    pub fn needs_rollover(&self, t_ns: i64) -> bool {
        t_ns >= self.current_end_ns()
    }

    /// Finalizes the current bucket and begins the aligned bucket containing
    /// `t`. Returns the finalized bucket's `[start, end)`. Handles
    /// arbitrarily large jumps: intermediate empty buckets are skipped, not
    /// materialized.
    pub fn advance_to(&mut self, t_ns: i64) -> (i64, i64) {
        let finalized = (self.current_start_ns, self.current_end_ns());
        let k = (t_ns - self.origin_ns).div_euclid(self.bucket_size_ns);
        self.current_start_ns = self.origin_ns + k * self.bucket_size_ns;
        finalized
    }

    /// Cuts the current bucket at `t` (millisecond-truncated). Returns None
    /// when the truncated timestamp does not fall inside the current bucket.
    pub fn force_split(&mut self, t_ns: i64) -> Option<ForcedSplit> {
        let end = truncate_to_ms(t_ns);
        if end <= self.current_start_ns {
            return None;
        }

        let split = ForcedSplit {
            start_ns: self.current_start_ns,
            end_ns: end,
            too_small: end - self.current_start_ns < self.min_bucket_size_ns,
        };
        self.current_start_ns = end;
        Some(split)
    }

    /// Restarts bucketing at `t` without finalizing anything; used when a
    /// dump erases history.
    pub fn restart_at(&mut self, t_ns: i64) {
        self.current_start_ns = t_ns;
    }
}
