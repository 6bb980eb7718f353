// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! User-supplied codecs that transform fixed-size typed elements into
//! variable-length bytes inside the data stream.
//!
//! The engine treats these as opaque vtables: it sizes buffers by
//! `max_serialized_size`, invokes the codec on runs of elements, and trusts
//! the returned byte counts. A serializer that writes more than
//! `max_serialized_size` bytes for one element is a programming error.

/// Variable-length codec over elements of one fixed field type.
///
/// # Safety
///
/// Implementations read/write through raw pointers. The engine guarantees
/// `src`/`dst` point to at least `num_elems * sizeof_field_type` (typed side)
/// or the number of bytes the codec reports (serialized side, bounded by
/// `num_elems * max_serialized_size`).
pub trait SerdezOp: Send + Sync {
    /// Size of one element of the field type.
    fn sizeof_field_type(&self) -> usize;

    /// Upper bound on the serialized size of one element.
    fn max_serialized_size(&self) -> usize;

    /// Serialize `num_elems` elements from `src` into `dst`. Returns bytes
    /// written.
    unsafe fn serialize(&self, src: *const u8, num_elems: usize, dst: *mut u8) -> usize;

    /// Serialize a single element. Returns bytes written
    /// (`<= max_serialized_size`).
    unsafe fn serialize_one(&self, src: *const u8, dst: *mut u8) -> usize;

    /// Deserialize `num_elems` elements from `src` into `dst`. Returns bytes
    /// read.
    unsafe fn deserialize(&self, dst: *mut u8, num_elems: usize, src: *const u8) -> usize;

    /// Deserialize a single element. Returns bytes read.
    unsafe fn deserialize_one(&self, dst: *mut u8, src: *const u8) -> usize;
}

/// Run-length trimming codec used by tests and demos: an `N`-byte element is
/// encoded as one length byte followed by the element's bytes with trailing
/// zeros dropped. Worst case is `N + 1` bytes per element.
pub struct TrimZerosSerdez<const N: usize>;

impl<const N: usize> TrimZerosSerdez<N> {
    pub fn new() -> Self {
        assert!(N <= u8::MAX as usize);
        Self
    }
}

impl<const N: usize> Default for TrimZerosSerdez<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SerdezOp for TrimZerosSerdez<N> {
    fn sizeof_field_type(&self) -> usize {
        N
    }

    fn max_serialized_size(&self) -> usize {
        N + 1
    }

    unsafe fn serialize(&self, src: *const u8, num_elems: usize, dst: *mut u8) -> usize {
        let mut written = 0;
        for i in 0..num_elems {
            written += unsafe { self.serialize_one(src.add(i * N), dst.add(written)) };
        }
        written
    }

    unsafe fn serialize_one(&self, src: *const u8, dst: *mut u8) -> usize {
        let elem = unsafe { std::slice::from_raw_parts(src, N) };
        let keep = N - elem.iter().rev().take_while(|&&b| b == 0).count();
        unsafe {
            *dst = keep as u8;
            std::ptr::copy_nonoverlapping(src, dst.add(1), keep);
        }
        keep + 1
    }

    unsafe fn deserialize(&self, dst: *mut u8, num_elems: usize, src: *const u8) -> usize {
        let mut consumed = 0;
        for i in 0..num_elems {
            consumed += unsafe { self.deserialize_one(dst.add(i * N), src.add(consumed)) };
        }
        consumed
    }

    unsafe fn deserialize_one(&self, dst: *mut u8, src: *const u8) -> usize {
        unsafe {
            let keep = (*src) as usize;
            debug_assert!(keep <= N);
            std::ptr::write_bytes(dst, 0, N);
            std::ptr::copy_nonoverlapping(src.add(1), dst, keep);
            keep + 1
        }
    }
}

/// Checks a codec's claim against its declared worst case. Overrunning the
/// bound corrupts IB flow control, which is unrecoverable, so this aborts.
pub fn check_serialized_size(op: &dyn SerdezOp, bytes: usize, num_elems: usize) {
    assert!(
        bytes <= num_elems * op.max_serialized_size(),
        "serdez overran max_serialized_size: {} bytes for {} elems (max {})",
        bytes,
        num_elems,
        op.max_serialized_size()
    );
}
