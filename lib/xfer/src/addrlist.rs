// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compact ring encoding of multi-dimensional address rectangles and its
//! partially-consuming reader.
//!
//! An entry is `2*D` words: word 0 packs `(byte_count_dim0 << 4) | D`, word 1
//! is the base offset, then `(count_i, stride_i)` pairs for each outer
//! dimension. A zero in the first word of an entry means "skip to the ring
//! start" and is written by the producer when an entry would straddle the end
//! of the ring.

/// Maximum dimensionality of a single entry.
pub const MAX_DIM: usize = 4;

/// Ring capacity in words.
const MAX_ENTRIES: usize = 256;

/// Fixed-capacity ring buffer of address tuples.
pub struct AddressList {
    data: [usize; MAX_ENTRIES],
    write_pointer: usize,
    read_pointer: usize,
    total_bytes: usize,
}

impl Default for AddressList {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressList {
    pub fn new() -> Self {
        Self {
            data: [0; MAX_ENTRIES],
            write_pointer: 0,
            read_pointer: 0,
            total_bytes: 0,
        }
    }

    /// Reserve space for an entry of up to `max_dim` dimensions. Returns the
    /// writable words, or `None` if the ring is too full (the producer should
    /// try again after the consumer advances).
    pub fn begin_nd_entry(&mut self, max_dim: usize) -> Option<&mut [usize]> {
        debug_assert!(max_dim >= 1 && max_dim <= MAX_DIM);
        let entries_needed = max_dim * 2;

        let new_wp = self.write_pointer + entries_needed;
        if new_wp > MAX_ENTRIES {
            // have to wrap around
            if self.read_pointer <= entries_needed {
                return None;
            }

            // fill remaining words with 0's so the reader skips over them
            while self.write_pointer < MAX_ENTRIES {
                self.data[self.write_pointer] = 0;
                self.write_pointer += 1;
            }
            self.write_pointer = 0;
        } else {
            // if the write pointer would cross over the read pointer, we have
            // to wait
            if (self.write_pointer < self.read_pointer) && (new_wp >= self.read_pointer) {
                return None;
            }

            // special case: a write that lands exactly on the end collides
            // with a reader parked at 0
            if (new_wp == MAX_ENTRIES) && (self.read_pointer == 0) {
                return None;
            }
        }

        let wp = self.write_pointer;
        Some(&mut self.data[wp..wp + entries_needed])
    }

    /// Commit a previously reserved entry with its actual dimensionality and
    /// total byte count.
    pub fn commit_nd_entry(&mut self, act_dim: usize, bytes: usize) {
        debug_assert!(act_dim >= 1 && act_dim <= MAX_DIM);
        let entries_used = act_dim * 2;

        self.write_pointer += entries_used;
        if self.write_pointer >= MAX_ENTRIES {
            debug_assert_eq!(self.write_pointer, MAX_ENTRIES);
            self.write_pointer = 0;
        }

        self.total_bytes += bytes;
    }

    /// Unconsumed bytes across all committed entries.
    pub fn bytes_pending(&self) -> usize {
        self.total_bytes
    }

    /// Normalize the read pointer (wrap, skip zero fill) and return the index
    /// of the next active entry.
    fn read_entry_pos(&mut self) -> usize {
        debug_assert!(self.total_bytes > 0);
        if self.read_pointer >= MAX_ENTRIES {
            debug_assert_eq!(self.read_pointer, MAX_ENTRIES);
            self.read_pointer = 0;
        }
        // skip trailing zero fill
        if self.data[self.read_pointer] == 0 {
            self.read_pointer = 0;
        }
        self.read_pointer
    }

    fn entry(&mut self) -> &[usize] {
        let pos = self.read_entry_pos();
        &self.data[pos..]
    }

    fn consume_entry(&mut self, act_dim: usize) {
        self.read_pointer += 2 * act_dim;
    }

    fn debit_bytes(&mut self, bytes: usize) {
        debug_assert!(self.total_bytes >= bytes);
        self.total_bytes -= bytes;
    }
}

/// Convenience producer: append a 1D run of `bytes` at `base_offset`.
/// Returns false if the ring had no room.
pub fn append_1d(list: &mut AddressList, base_offset: usize, bytes: usize) -> bool {
    let Some(entry) = list.begin_nd_entry(1) else {
        return false;
    };
    entry[0] = (bytes << 4) | 1;
    entry[1] = base_offset;
    list.commit_nd_entry(1, bytes);
    true
}

/// Reader over an [`AddressList`] that can stop mid-entry.
///
/// `pos` tracks progress within the current entry: `pos[0]` in bytes, outer
/// dimensions in counts. Advancing at dimension `d` requires `pos[i] == 0`
/// for all `i < d`.
pub struct AddressListCursor {
    partial: bool,
    partial_dim: usize,
    pos: [usize; MAX_DIM],
}

impl Default for AddressListCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressListCursor {
    pub fn new() -> Self {
        Self {
            partial: false,
            partial_dim: 0,
            pos: [0; MAX_DIM],
        }
    }

    /// Dimensionality of the next consumable rectangle. With partial
    /// progress, this is restricted to the rest of the partially consumed
    /// dimension and below.
    pub fn get_dim(&self, list: &mut AddressList) -> usize {
        if self.partial {
            self.partial_dim + 1
        } else {
            let entry = list.entry();
            entry[0] & 15
        }
    }

    /// Byte offset of the next unconsumed element.
    pub fn get_offset(&self, list: &mut AddressList) -> usize {
        let entry = list.entry();
        let act_dim = entry[0] & 15;
        let mut ofs = entry[1];
        if self.partial {
            for i in self.partial_dim..act_dim {
                if i == 0 {
                    // dim 0 is counted in bytes
                    ofs += self.pos[0];
                } else {
                    // the rest use the strides from the address list
                    ofs += self.pos[i] * entry[1 + 2 * i];
                }
            }
        }
        ofs
    }

    /// Stride of an outer dimension.
    pub fn get_stride(&self, list: &mut AddressList, dim: usize) -> usize {
        let entry = list.entry();
        let act_dim = entry[0] & 15;
        debug_assert!(dim > 0 && dim < act_dim);
        entry[2 * dim + 1]
    }

    /// Remaining extent of a dimension, accounting for partial progress
    /// (bytes for dim 0, counts for outer dims).
    pub fn remaining(&self, list: &mut AddressList, dim: usize) -> usize {
        let entry = list.entry();
        let act_dim = entry[0] & 15;
        debug_assert!(dim < act_dim);
        let mut r = entry[2 * dim];
        if dim == 0 {
            r >>= 4;
        }
        if self.partial {
            if dim > self.partial_dim {
                r = 1;
            }
            if dim == self.partial_dim {
                debug_assert!(r > self.pos[dim]);
                r -= self.pos[dim];
            }
        }
        r
    }

    /// Consume `amount` units at dimension `dim` (bytes for dim 0, rows or
    /// planes otherwise), carrying into outer dimensions when an inner one
    /// saturates.
    pub fn advance(&mut self, list: &mut AddressList, dim: usize, amount: usize) {
        let (act_dim, mut r, chunk0, counts): (usize, usize, usize, [usize; MAX_DIM]) = {
            let entry = list.entry();
            let act_dim = entry[0] & 15;
            debug_assert!(dim < act_dim);
            let mut r = entry[2 * dim];
            if dim == 0 {
                r >>= 4;
            }
            let mut counts = [1usize; MAX_DIM];
            counts[0] = entry[0] >> 4;
            for i in 1..act_dim {
                counts[i] = entry[2 * i];
            }
            (act_dim, r, entry[0] >> 4, counts)
        };

        // bytes consumed: dim 0 advances in bytes, outer dims in whole inner
        // volumes
        let mut bytes = amount;
        if dim > 0 {
            debug_assert!(self.pos[..dim].iter().all(|&p| p == 0));
            bytes *= chunk0;
            for i in 1..dim {
                bytes *= counts[i];
            }
        }
        list.debit_bytes(bytes);

        if !self.partial {
            if (dim == act_dim - 1) && (amount == r) {
                // simple case - we consumed the whole entry
                list.consume_entry(act_dim);
                return;
            }
            // record partial consumption
            self.partial = true;
            self.partial_dim = dim;
            self.pos[self.partial_dim] = amount;
        } else {
            // update a partial consumption in progress
            debug_assert!(dim <= self.partial_dim);
            self.partial_dim = dim;
            self.pos[self.partial_dim] += amount;
        }

        while self.pos[self.partial_dim] == r {
            self.pos[self.partial_dim] = 0;
            self.partial_dim += 1;
            if self.partial_dim == act_dim {
                // all done
                self.partial = false;
                list.consume_entry(act_dim);
                break;
            }
            // carry into the next dimension
            self.pos[self.partial_dim] += 1;
            r = counts[self.partial_dim];
        }
    }

    /// Advance without transferring - used when one side of a gather/scatter
    /// is absent.
    pub fn skip_bytes(&mut self, list: &mut AddressList, mut bytes: usize) {
        while bytes > 0 {
            let act_dim = self.get_dim(list);
            debug_assert!(act_dim > 0);

            let contig = self.remaining(list, 0);
            if bytes < contig {
                self.advance(list, 0, bytes);
                return;
            }

            // batch whole rows when we're sitting on a row boundary
            if act_dim > 1 && !(self.partial && self.partial_dim == 0) {
                let rows = (bytes / contig).min(self.remaining(list, 1));
                if rows > 1 {
                    self.advance(list, 1, rows);
                    bytes -= rows * contig;
                    continue;
                }
            }

            self.advance(list, 0, contig);
            bytes -= contig;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_entry(list: &mut AddressList, dims: &[(usize, usize)], base: usize) -> usize {
        // dims: (count, stride) pairs, dims[0].0 in bytes
        let entry = list.begin_nd_entry(dims.len()).expect("ring full");
        entry[0] = (dims[0].0 << 4) | dims.len();
        entry[1] = base;
        let mut bytes = dims[0].0;
        for (i, &(count, stride)) in dims.iter().enumerate().skip(1) {
            entry[2 * i] = count;
            entry[2 * i + 1] = stride;
            bytes *= count;
        }
        let act_dim = dims.len();
        list.commit_nd_entry(act_dim, bytes);
        bytes
    }

    #[test]
    fn test_1d_entry_roundtrip() {
        let mut list = AddressList::new();
        assert!(append_1d(&mut list, 0x1000, 256));
        assert_eq!(list.bytes_pending(), 256);

        let mut cursor = AddressListCursor::new();
        assert_eq!(cursor.get_dim(&mut list), 1);
        assert_eq!(cursor.get_offset(&mut list), 0x1000);
        assert_eq!(cursor.remaining(&mut list, 0), 256);
        cursor.advance(&mut list, 0, 256);
        assert_eq!(list.bytes_pending(), 0);
    }

    #[test]
    fn test_partial_consumption_1d() {
        let mut list = AddressList::new();
        append_1d(&mut list, 0, 100);
        let mut cursor = AddressListCursor::new();
        cursor.advance(&mut list, 0, 30);
        assert_eq!(cursor.get_dim(&mut list), 1);
        assert_eq!(cursor.get_offset(&mut list), 30);
        assert_eq!(cursor.remaining(&mut list, 0), 70);
        assert_eq!(list.bytes_pending(), 70);
        cursor.advance(&mut list, 0, 70);
        assert_eq!(list.bytes_pending(), 0);
    }

    #[test]
    fn test_2d_partial_and_carry() {
        let mut list = AddressList::new();
        // 4 lines of 64 bytes, stride 256
        push_entry(&mut list, &[(64, 0), (4, 256)], 0x8000);
        assert_eq!(list.bytes_pending(), 256);

        let mut cursor = AddressListCursor::new();
        assert_eq!(cursor.get_dim(&mut list), 2);
        assert_eq!(cursor.remaining(&mut list, 1), 4);

        // consume one full line at dim 1
        cursor.advance(&mut list, 1, 1);
        assert_eq!(list.bytes_pending(), 192);
        assert_eq!(cursor.get_offset(&mut list), 0x8000 + 256);

        // consume half a line; reported dim shrinks to 1
        cursor.advance(&mut list, 0, 32);
        assert_eq!(cursor.get_dim(&mut list), 1);
        assert_eq!(cursor.remaining(&mut list, 0), 32);
        assert_eq!(cursor.get_offset(&mut list), 0x8000 + 256 + 32);

        // finish the line - carry back to dim 1
        cursor.advance(&mut list, 0, 32);
        assert_eq!(cursor.get_dim(&mut list), 2);
        assert_eq!(cursor.remaining(&mut list, 1), 2);
        assert_eq!(cursor.get_offset(&mut list), 0x8000 + 2 * 256);

        // consume the remaining two lines
        cursor.advance(&mut list, 1, 2);
        assert_eq!(list.bytes_pending(), 0);
    }

    #[test]
    fn test_3d_full_consumption() {
        let mut list = AddressList::new();
        // 2 planes of 3 lines of 16 bytes
        push_entry(&mut list, &[(16, 0), (3, 64), (2, 4096)], 0);
        assert_eq!(list.bytes_pending(), 96);
        let mut cursor = AddressListCursor::new();
        assert_eq!(cursor.get_dim(&mut list), 3);
        cursor.advance(&mut list, 2, 2);
        assert_eq!(list.bytes_pending(), 0);
    }

    #[test]
    fn test_skip_bytes_through_2d() {
        let mut list = AddressList::new();
        push_entry(&mut list, &[(64, 0), (4, 256)], 0);
        let mut cursor = AddressListCursor::new();
        // skip 1.5 lines
        cursor.skip_bytes(&mut list, 96);
        assert_eq!(list.bytes_pending(), 160);
        assert_eq!(cursor.get_offset(&mut list), 256 + 32);
        // skip the rest
        cursor.skip_bytes(&mut list, 160);
        assert_eq!(list.bytes_pending(), 0);
    }

    #[test]
    fn test_skip_bytes_across_entries() {
        let mut list = AddressList::new();
        append_1d(&mut list, 0, 32);
        append_1d(&mut list, 100, 32);
        append_1d(&mut list, 200, 32);
        let mut cursor = AddressListCursor::new();
        cursor.skip_bytes(&mut list, 48);
        assert_eq!(list.bytes_pending(), 48);
        assert_eq!(cursor.get_offset(&mut list), 116);
    }

    #[test]
    fn test_ring_wraparound() {
        let mut list = AddressList::new();
        let mut cursor = AddressListCursor::new();
        // cycle enough entries through the ring to force several wraps
        for i in 0..1000usize {
            while !append_1d(&mut list, i * 64, 64) {
                // drain one entry to make room
                cursor.advance(&mut list, 0, 64);
            }
        }
        let mut seen = 0;
        while list.bytes_pending() > 0 {
            seen += 1;
            cursor.advance(&mut list, 0, 64);
        }
        let _ = seen;
    }

    #[test]
    fn test_producer_blocked_when_full() {
        let mut list = AddressList::new();
        let mut pushed = 0usize;
        while append_1d(&mut list, pushed * 8, 8) {
            pushed += 1;
        }
        assert!(pushed > 0);
        // one consumed entry frees exactly one slot
        let mut cursor = AddressListCursor::new();
        cursor.advance(&mut list, 0, 8);
        assert!(append_1d(&mut list, 0xffff, 8));
    }
}
