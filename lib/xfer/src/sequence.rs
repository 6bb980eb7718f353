// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Monotone accumulator of contiguous byte ranges.
//!
//! A [`SequenceAssembler`] answers two questions about a stream of byte spans
//! that may arrive out of order:
//! - "how many bytes starting at offset X are known-present?"
//! - "by how much did this span extend the contiguous prefix?"
//!
//! The contiguous prefix is tracked in a single atomic word so that the common
//! in-order case never takes a lock. Out-of-order spans go into a
//! mutex-guarded ordered map and are absorbed into the prefix once the stream
//! catches up.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const NO_NONCONTIG: usize = usize::MAX;

/// Lock-optimistic contiguous-prefix accumulator.
///
/// The low bit of `contig_amount_x2` flags the presence of out-of-order
/// spans; the rest is the contiguous byte count. Packing both into one word
/// keeps the fast paths free of torn reads.
pub struct SequenceAssembler {
    contig_amount_x2: AtomicUsize,
    first_noncontig: AtomicUsize,
    spans: Mutex<BTreeMap<usize, usize>>,
}

impl Default for SequenceAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceAssembler {
    pub fn new() -> Self {
        Self {
            contig_amount_x2: AtomicUsize::new(0),
            first_noncontig: AtomicUsize::new(NO_NONCONTIG),
            spans: Mutex::new(BTreeMap::new()),
        }
    }

    /// Current contiguous prefix length.
    pub fn contig_amount(&self) -> usize {
        self.contig_amount_x2.load(Ordering::Acquire) >> 1
    }

    /// Move the other assembler's state into this one. Not thread-safe;
    /// used only when merging pending updates into a freshly registered
    /// descriptor.
    pub fn swap(&self, other: &SequenceAssembler) {
        let my_contig = self.contig_amount_x2.load(Ordering::Acquire);
        let my_noncontig = self.first_noncontig.load(Ordering::Acquire);
        self.contig_amount_x2.store(
            other.contig_amount_x2.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.first_noncontig.store(
            other.first_noncontig.load(Ordering::Acquire),
            Ordering::Release,
        );
        other.contig_amount_x2.store(my_contig, Ordering::Release);
        other.first_noncontig.store(my_noncontig, Ordering::Release);
        std::mem::swap(
            &mut *self.spans.lock().unwrap(),
            &mut *other.spans.lock().unwrap(),
        );
    }

    /// Asks if a span exists - the return value is the number of bytes from
    /// `start` that do (clamped to `count`). May under-report while spans are
    /// in flight, never over-reports.
    pub fn span_exists(&self, start: usize, count: usize) -> usize {
        // lock-free case 1: start < contig_amount
        let contig_sample_x2 = self.contig_amount_x2.load(Ordering::Acquire);
        if start < (contig_sample_x2 >> 1) {
            let max_avail = (contig_sample_x2 >> 1) - start;
            return count.min(max_avail);
        }

        // lock-free case 2a: no noncontig ranges known
        if (contig_sample_x2 & 1) == 0 {
            return 0;
        }

        // lock-free case 2b: contig_amount <= start < first_noncontig
        let noncontig_sample = self.first_noncontig.load(Ordering::Acquire);
        if start < noncontig_sample {
            return 0;
        }

        // general case 3: take the lock and look through the spans
        let spans = self.spans.lock().unwrap();

        // recheck the contig amount, in case both it and the noncontig
        // counters were bumped in between looking at the two of them
        let contig_sample = self.contig_amount_x2.load(Ordering::Acquire) >> 1;
        if start < contig_sample {
            let max_avail = contig_sample - start;
            return count.min(max_avail);
        }

        // recheck noncontig as well
        if start < self.first_noncontig.load(Ordering::Acquire) {
            return 0;
        }

        // find the span that might contain `start` and walk forward while
        // adjacent
        let Some((&ofs, &len)) = spans.range(..=start).next_back() else {
            return 0;
        };
        if ofs + len <= start {
            return 0;
        }
        let mut max_avail = ofs + len - start;
        let mut walk = spans.range((std::ops::Bound::Excluded(ofs), std::ops::Bound::Unbounded));
        while max_avail < count {
            match walk.next() {
                Some((&next_ofs, &next_len)) if next_ofs <= start + max_avail => {
                    max_avail += next_len;
                }
                _ => return max_avail,
            }
        }
        count
    }

    /// Records `[pos, pos+count)` as present. Returns the amount by which the
    /// contiguous prefix grew (i.e. the prefix now covers `[pos, pos+retval)`).
    pub fn add_span(&self, pos: usize, count: usize) -> usize {
        // fastest case - try to bump the contig amount without a lock,
        // assuming there are no noncontig spans
        let prev_x2 = pos << 1;
        let next_x2 = (pos + count) << 1;
        let observed = match self.contig_amount_x2.compare_exchange(
            prev_x2,
            next_x2,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return count,
            Err(observed) => observed,
        };

        // second best case - the CAS failed, but only because there are
        // noncontig spans: take the mutex and pick up any spans we connect
        // with
        if (observed >> 1) == pos {
            let mut spans = self.spans.lock().unwrap();

            let mut span_end = pos + count;
            let mut new_noncontig = NO_NONCONTIG;
            while let Some((&ofs, &len)) = spans.first_key_value() {
                if ofs == span_end {
                    span_end += len;
                    spans.remove(&ofs);
                } else {
                    // stop here - this is the new first noncontig
                    new_noncontig = ofs;
                    break;
                }
            }

            // update the contig amount before bumping first_noncontig so that
            // a reader holding the old first_noncontig still succeeds
            let next_x2 = (span_end << 1) | usize::from(!spans.is_empty());
            let ok = self
                .contig_amount_x2
                .compare_exchange(observed, next_x2, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            assert!(ok, "contig advanced by a second writer at the same offset");
            self.first_noncontig.store(new_noncontig, Ordering::Release);

            return span_end - pos;
        }

        // worst case - our span is not contiguous, so take the mutex and add
        // it to the noncontig list (we may end up contiguous anyway if the
        // prefix caught up in the meantime)
        let mut spans = self.spans.lock().unwrap();
        if count > 0 {
            spans.insert(pos, count);
        }

        if pos > self.first_noncontig.load(Ordering::Acquire) {
            // somebody else has already set the noncontig bit
            return 0;
        }

        // set the noncontig bit and re-check the contig amount in one atomic
        // OR
        let prev_x2 = self.contig_amount_x2.fetch_or(1, Ordering::AcqRel);
        if (prev_x2 >> 1) != pos {
            // not caught, so no forward progress to report
            return 0;
        }

        // the prefix caught us - gather up spans and do another bump
        let mut span_end = pos;
        let mut new_noncontig = NO_NONCONTIG;
        while let Some((&ofs, &len)) = spans.first_key_value() {
            if ofs == span_end {
                span_end += len;
                spans.remove(&ofs);
            } else {
                new_noncontig = ofs;
                break;
            }
        }
        assert!(span_end > pos || count == 0);

        // contig first, then noncontig (same reasoning as above)
        let next_x2 = (span_end << 1) | usize::from(!spans.is_empty());
        let ok = self
            .contig_amount_x2
            .compare_exchange(prev_x2 | 1, next_x2, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        assert!(ok, "contig advanced by a second writer at the same offset");
        self.first_noncontig.store(new_noncontig, Ordering::Release);

        span_end - pos
    }
}

impl std::fmt::Debug for SequenceAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceAssembler")
            .field("contig", &self.contig_amount())
            .finish()
    }
}
