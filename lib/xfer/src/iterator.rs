// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transfer iterators: the producers of address tuples that describe the next
//! chunk of a logical transfer.
//!
//! Index-space and sparsity computation live outside the engine; what arrives
//! here is a [`TransferIterator`] that can step through byte addresses,
//! optionally tentatively (so a channel can negotiate chunk sizes between two
//! iterators before committing either).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::addrlist::{AddressList, append_1d};
use crate::bgwork::ReadyEvent;

/// Per-side dimension allowances for a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepFlags {
    pub lines_ok: bool,
    pub planes_ok: bool,
}

impl StepFlags {
    pub const LINEAR: StepFlags = StepFlags {
        lines_ok: false,
        planes_ok: false,
    };
    pub const PLANAR: StepFlags = StepFlags {
        lines_ok: true,
        planes_ok: false,
    };
    pub const FULL: StepFlags = StepFlags {
        lines_ok: true,
        planes_ok: true,
    };
}

/// Up-to-3D description of one stepped chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressInfo {
    pub base_offset: usize,
    pub bytes_per_chunk: usize,
    pub num_lines: usize,
    pub line_stride: usize,
    pub num_planes: usize,
    pub plane_stride: usize,
}

impl AddressInfo {
    pub fn total_bytes(&self) -> usize {
        self.bytes_per_chunk * self.num_lines * self.num_planes
    }
}

/// HDF5-flavored step result: a hyperslab of one dataset.
#[derive(Debug, Clone, Default)]
pub struct AddressInfoHdf5 {
    pub field_id: u32,
    pub filename: Arc<str>,
    pub dsetname: Arc<str>,
    /// Hyperslab origin, outermost dimension first.
    pub offset: Vec<u64>,
    /// Hyperslab extent, outermost dimension first.
    pub extent: Vec<u64>,
    /// Bounds of the whole dataset.
    pub dset_bounds: Vec<u64>,
}

/// Iterator over the byte addresses of one logical transfer endpoint.
pub trait TransferIterator: Send {
    /// True once every address has been produced (and confirmed).
    fn done(&self) -> bool;

    /// Produce the next chunk of up to `max_bytes`. Returns the number of
    /// bytes stepped (0 if nothing fits, e.g. `max_bytes` is smaller than one
    /// element). A `tentative` step must be followed by `confirm_step` or
    /// `cancel_step` before the next step.
    fn step(
        &mut self,
        max_bytes: usize,
        info: &mut AddressInfo,
        flags: StepFlags,
        tentative: bool,
    ) -> usize;

    /// HDF5-flavored step; only implemented by HDF5 iterators.
    fn step_hdf5(
        &mut self,
        _max_bytes: usize,
        _info: &mut AddressInfoHdf5,
        _tentative: bool,
    ) -> usize {
        0
    }

    fn confirm_step(&mut self);

    /// Roll back the most recent tentative step. Iterators must support this
    /// after any tentative step.
    fn cancel_step(&mut self);

    /// Append address entries to `addrlist`. Returns true if the caller
    /// should flush - transfer what is pending rather than wait for a larger
    /// chunk - which in particular happens once the iterator is exhausted.
    fn get_addresses(&mut self, addrlist: &mut AddressList) -> bool;

    /// Readiness event for any metadata this iterator depends on; `None`
    /// means ready now.
    fn request_metadata(&mut self) -> Option<ReadyEvent> {
        None
    }

    /// Hook for iterators that draw their addresses from another port.
    fn set_indirect_input_port(&mut self, _port_idx: usize) {}
}

/// Serializable iterator description, used by cross-node descriptor creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IteratorDesc {
    Linear {
        base: usize,
        bytes: usize,
    },
    Spans {
        spans: Vec<(usize, usize)>,
    },
    Rect {
        base: usize,
        bytes_per_line: usize,
        lines: usize,
        line_stride: usize,
        planes: usize,
        plane_stride: usize,
    },
    WrappingFifo {
        ib_offset: usize,
        ib_size: usize,
    },
}

impl IteratorDesc {
    pub fn instantiate(&self) -> Box<dyn TransferIterator> {
        match *self {
            IteratorDesc::Linear { base, bytes } => Box::new(LinearIterator::new(base, bytes)),
            IteratorDesc::Spans { ref spans } => Box::new(SpanIterator::new(spans.clone())),
            IteratorDesc::Rect {
                base,
                bytes_per_line,
                lines,
                line_stride,
                planes,
                plane_stride,
            } => Box::new(RectIterator::new(
                base,
                bytes_per_line,
                lines,
                line_stride,
                planes,
                plane_stride,
            )),
            IteratorDesc::WrappingFifo { ib_offset, ib_size } => {
                Box::new(WrappingFifoIterator::new(ib_offset, ib_size))
            }
        }
    }
}

/// 1D iterator over a contiguous byte range.
///
/// `step` and `get_addresses` share one position: a port is driven through
/// exactly one of the two interfaces, depending on its channel.
pub struct LinearIterator {
    base: usize,
    total: usize,
    pos: usize,
    saved_pos: Option<usize>,
}

impl LinearIterator {
    pub fn new(base: usize, total: usize) -> Self {
        Self {
            base,
            total,
            pos: 0,
            saved_pos: None,
        }
    }
}

impl TransferIterator for LinearIterator {
    fn done(&self) -> bool {
        self.pos >= self.total
    }

    fn step(
        &mut self,
        max_bytes: usize,
        info: &mut AddressInfo,
        _flags: StepFlags,
        tentative: bool,
    ) -> usize {
        debug_assert!(self.saved_pos.is_none());
        let bytes = max_bytes.min(self.total - self.pos);
        if bytes == 0 {
            return 0;
        }
        *info = AddressInfo {
            base_offset: self.base + self.pos,
            bytes_per_chunk: bytes,
            num_lines: 1,
            line_stride: 0,
            num_planes: 1,
            plane_stride: 0,
        };
        if tentative {
            self.saved_pos = Some(self.pos);
        }
        self.pos += bytes;
        bytes
    }

    fn confirm_step(&mut self) {
        self.saved_pos = None;
    }

    fn cancel_step(&mut self) {
        self.pos = self.saved_pos.take().expect("no tentative step to cancel");
    }

    fn get_addresses(&mut self, addrlist: &mut AddressList) -> bool {
        while self.pos < self.total {
            let bytes = self.total - self.pos;
            if !append_1d(addrlist, self.base + self.pos, bytes) {
                break;
            }
            self.pos += bytes;
        }
        self.done()
    }
}

/// 1D iterator over an explicit list of (offset, length) spans, visited in
/// order.
pub struct SpanIterator {
    spans: Vec<(usize, usize)>,
    idx: usize,
    pos_in_span: usize,
    saved: Option<(usize, usize)>,
}

impl SpanIterator {
    pub fn new(spans: Vec<(usize, usize)>) -> Self {
        Self {
            spans,
            idx: 0,
            pos_in_span: 0,
            saved: None,
        }
    }
}

impl TransferIterator for SpanIterator {
    fn done(&self) -> bool {
        self.idx >= self.spans.len()
    }

    fn step(
        &mut self,
        max_bytes: usize,
        info: &mut AddressInfo,
        _flags: StepFlags,
        tentative: bool,
    ) -> usize {
        debug_assert!(self.saved.is_none());
        let Some(&(ofs, len)) = self.spans.get(self.idx) else {
            return 0;
        };
        let bytes = max_bytes.min(len - self.pos_in_span);
        if bytes == 0 {
            return 0;
        }
        *info = AddressInfo {
            base_offset: ofs + self.pos_in_span,
            bytes_per_chunk: bytes,
            num_lines: 1,
            line_stride: 0,
            num_planes: 1,
            plane_stride: 0,
        };
        if tentative {
            self.saved = Some((self.idx, self.pos_in_span));
        }
        self.pos_in_span += bytes;
        if self.pos_in_span == len {
            self.idx += 1;
            self.pos_in_span = 0;
        }
        bytes
    }

    fn confirm_step(&mut self) {
        self.saved = None;
    }

    fn cancel_step(&mut self) {
        let (idx, pos) = self.saved.take().expect("no tentative step to cancel");
        self.idx = idx;
        self.pos_in_span = pos;
    }

    fn get_addresses(&mut self, addrlist: &mut AddressList) -> bool {
        while let Some(&(ofs, len)) = self.spans.get(self.idx) {
            let bytes = len - self.pos_in_span;
            if !append_1d(addrlist, ofs + self.pos_in_span, bytes) {
                break;
            }
            self.idx += 1;
            self.pos_in_span = 0;
        }
        self.done()
    }
}

/// Dense up-to-3D rectangle iterator: `lines` rows of `bytes_per_line`
/// bytes, `planes` planes.
pub struct RectIterator {
    base: usize,
    bytes_per_line: usize,
    lines: usize,
    line_stride: usize,
    planes: usize,
    plane_stride: usize,
    // position: byte within line, line within plane, plane
    pos: [usize; 3],
    saved: Option<[usize; 3]>,
}

impl RectIterator {
    pub fn new(
        base: usize,
        bytes_per_line: usize,
        lines: usize,
        line_stride: usize,
        planes: usize,
        plane_stride: usize,
    ) -> Self {
        Self {
            base,
            bytes_per_line,
            lines,
            line_stride,
            planes,
            plane_stride,
            pos: [0; 3],
            saved: None,
        }
    }

    fn offset_of(&self, pos: &[usize; 3]) -> usize {
        self.base + pos[2] * self.plane_stride + pos[1] * self.line_stride + pos[0]
    }

    fn exhausted(pos: &[usize; 3], planes: usize) -> bool {
        pos[2] >= planes
    }

    fn advance_bytes(&mut self, bytes: usize) {
        self.pos[0] += bytes;
        if self.pos[0] < self.bytes_per_line {
            return;
        }
        debug_assert_eq!(self.pos[0], self.bytes_per_line);
        self.pos[0] = 0;
        self.pos[1] += 1;
        if self.pos[1] == self.lines {
            self.pos[1] = 0;
            self.pos[2] += 1;
        }
    }
}

impl TransferIterator for RectIterator {
    fn done(&self) -> bool {
        Self::exhausted(&self.pos, self.planes)
    }

    fn step(
        &mut self,
        max_bytes: usize,
        info: &mut AddressInfo,
        flags: StepFlags,
        tentative: bool,
    ) -> usize {
        debug_assert!(self.saved.is_none());
        if Self::exhausted(&self.pos, self.planes) {
            return 0;
        }

        let contig_avail = self.bytes_per_line - self.pos[0];
        let contig = max_bytes.min(contig_avail);
        if contig == 0 {
            return 0;
        }

        let mut out = AddressInfo {
            base_offset: self.offset_of(&self.pos),
            bytes_per_chunk: contig,
            num_lines: 1,
            line_stride: self.line_stride,
            num_planes: 1,
            plane_stride: self.plane_stride,
        };
        let mut amount = [contig, 0, 0];

        // grow to 2D/3D only from a line start over whole lines
        if flags.lines_ok && self.pos[0] == 0 && contig == self.bytes_per_line {
            let lines_avail = self.lines - self.pos[1];
            let lines = (max_bytes / self.bytes_per_line).min(lines_avail);
            if lines > 1 {
                out.num_lines = lines;
                amount = [0, lines, 0];
                // pos[0] consumed in full lines; express as byte advance of 0
                // with line advance handled below
                if flags.planes_ok && self.pos[1] == 0 && lines == self.lines {
                    let planes_avail = self.planes - self.pos[2];
                    let planes =
                        (max_bytes / (self.bytes_per_line * self.lines)).min(planes_avail);
                    if planes > 1 {
                        out.num_planes = planes;
                        amount = [0, 0, planes];
                    }
                }
            }
        }

        if tentative {
            self.saved = Some(self.pos);
        }

        // apply the advance
        match amount {
            [b, 0, 0] => self.advance_bytes(b),
            [0, l, 0] => {
                self.pos[1] += l;
                if self.pos[1] == self.lines {
                    self.pos[1] = 0;
                    self.pos[2] += 1;
                }
            }
            [0, 0, p] => {
                self.pos[2] += p;
            }
            _ => unreachable!(),
        }

        *info = out;
        out.total_bytes()
    }

    fn confirm_step(&mut self) {
        self.saved = None;
    }

    fn cancel_step(&mut self) {
        self.pos = self.saved.take().expect("no tentative step to cancel");
    }

    fn get_addresses(&mut self, addrlist: &mut AddressList) -> bool {
        while !Self::exhausted(&self.pos, self.planes) {
            if self.pos[0] > 0 {
                // finish the current line as a 1D run
                let bytes = self.bytes_per_line - self.pos[0];
                if !append_1d(addrlist, self.offset_of(&self.pos), bytes) {
                    break;
                }
                self.advance_bytes(bytes);
            } else if self.pos[1] > 0 || self.planes - self.pos[2] == 1 {
                // remaining lines of this plane as a 2D entry
                let lines = self.lines - self.pos[1];
                let Some(entry) = addrlist.begin_nd_entry(2) else {
                    break;
                };
                entry[0] = (self.bytes_per_line << 4) | 2;
                entry[1] = self.offset_of(&self.pos);
                entry[2] = lines;
                entry[3] = self.line_stride;
                addrlist.commit_nd_entry(2, self.bytes_per_line * lines);
                self.pos[1] = 0;
                self.pos[2] += 1;
            } else {
                // remaining whole planes as a 3D entry
                let planes = self.planes - self.pos[2];
                let Some(entry) = addrlist.begin_nd_entry(3) else {
                    break;
                };
                entry[0] = (self.bytes_per_line << 4) | 3;
                entry[1] = self.offset_of(&self.pos);
                entry[2] = self.lines;
                entry[3] = self.line_stride;
                entry[4] = planes;
                entry[5] = self.plane_stride;
                addrlist.commit_nd_entry(3, self.bytes_per_line * self.lines * planes);
                self.pos[2] = self.planes;
            }
        }
        self.done()
    }
}

/// Iterator over the circular window of an intermediate buffer. Steps are
/// clamped at the wrap boundary so every produced chunk is contiguous; the
/// stream position itself grows without bound. Never reports done - IB
/// streams terminate through `pre_bytes_total`.
pub struct WrappingFifoIterator {
    ib_offset: usize,
    ib_size: usize,
    pos: usize,
    saved_pos: Option<usize>,
}

impl WrappingFifoIterator {
    pub fn new(ib_offset: usize, ib_size: usize) -> Self {
        debug_assert!(ib_size > 0);
        Self {
            ib_offset,
            ib_size,
            pos: 0,
            saved_pos: None,
        }
    }
}

impl TransferIterator for WrappingFifoIterator {
    fn done(&self) -> bool {
        false
    }

    fn step(
        &mut self,
        max_bytes: usize,
        info: &mut AddressInfo,
        _flags: StepFlags,
        tentative: bool,
    ) -> usize {
        debug_assert!(self.saved_pos.is_none());
        let in_window = self.pos % self.ib_size;
        let bytes = max_bytes.min(self.ib_size - in_window);
        if bytes == 0 {
            return 0;
        }
        *info = AddressInfo {
            base_offset: self.ib_offset + in_window,
            bytes_per_chunk: bytes,
            num_lines: 1,
            line_stride: 0,
            num_planes: 1,
            plane_stride: 0,
        };
        if tentative {
            self.saved_pos = Some(self.pos);
        }
        self.pos += bytes;
        bytes
    }

    fn confirm_step(&mut self) {
        self.saved_pos = None;
    }

    fn cancel_step(&mut self) {
        self.pos = self.saved_pos.take().expect("no tentative step to cancel");
    }

    fn get_addresses(&mut self, addrlist: &mut AddressList) -> bool {
        // stay at most one window ahead; flow control can never use more
        while addrlist.bytes_pending() < self.ib_size {
            let in_window = self.pos % self.ib_size;
            let run = (self.ib_size - in_window).min(self.ib_size - addrlist.bytes_pending());
            if !append_1d(addrlist, self.ib_offset + in_window, run) {
                break;
            }
            self.pos += run;
        }
        false
    }
}

/// Wraps another iterator behind a metadata-readiness gate; used for
/// endpoints whose addressing metadata arrives asynchronously.
pub struct GatedIterator {
    inner: Box<dyn TransferIterator>,
    ready: ReadyEvent,
}

impl GatedIterator {
    pub fn new(inner: Box<dyn TransferIterator>, ready: ReadyEvent) -> Self {
        Self { inner, ready }
    }
}

impl TransferIterator for GatedIterator {
    fn done(&self) -> bool {
        self.inner.done()
    }

    fn step(
        &mut self,
        max_bytes: usize,
        info: &mut AddressInfo,
        flags: StepFlags,
        tentative: bool,
    ) -> usize {
        self.inner.step(max_bytes, info, flags, tentative)
    }

    fn confirm_step(&mut self) {
        self.inner.confirm_step()
    }

    fn cancel_step(&mut self) {
        self.inner.cancel_step()
    }

    fn get_addresses(&mut self, addrlist: &mut AddressList) -> bool {
        self.inner.get_addresses(addrlist)
    }

    fn request_metadata(&mut self) -> Option<ReadyEvent> {
        if self.ready.has_triggered() {
            None
        } else {
            Some(self.ready.clone())
        }
    }
}

/// Hyperslab iterator over one HDF5 dataset region.
///
/// Walks the region row-major, emitting rectangular hyperslabs whose
/// innermost extent is whole rows whenever the byte budget allows.
pub struct Hdf5Iterator {
    field_id: u32,
    filename: Arc<str>,
    dsetname: Arc<str>,
    dset_bounds: Vec<u64>,
    /// Region origin within the dataset.
    lo: Vec<u64>,
    /// Region extent.
    ext: Vec<u64>,
    elem_size: usize,
    pos: Vec<u64>,
    finished: bool,
    saved: Option<(Vec<u64>, bool)>,
}

impl Hdf5Iterator {
    pub fn new(
        field_id: u32,
        filename: impl Into<Arc<str>>,
        dsetname: impl Into<Arc<str>>,
        dset_bounds: Vec<u64>,
        lo: Vec<u64>,
        ext: Vec<u64>,
        elem_size: usize,
    ) -> Self {
        debug_assert_eq!(dset_bounds.len(), lo.len());
        debug_assert_eq!(lo.len(), ext.len());
        let ndims = lo.len();
        Self {
            field_id,
            filename: filename.into(),
            dsetname: dsetname.into(),
            dset_bounds,
            lo,
            ext,
            elem_size,
            pos: vec![0; ndims],
            finished: false,
            saved: None,
        }
    }
}

impl TransferIterator for Hdf5Iterator {
    fn done(&self) -> bool {
        self.finished
    }

    fn step(
        &mut self,
        _max_bytes: usize,
        _info: &mut AddressInfo,
        _flags: StepFlags,
        _tentative: bool,
    ) -> usize {
        // linear stepping does not apply to dataset space
        0
    }

    fn step_hdf5(&mut self, max_bytes: usize, info: &mut AddressInfoHdf5, tentative: bool) -> usize {
        debug_assert!(self.saved.is_none());
        if self.finished {
            return 0;
        }
        let max_elems = max_bytes / self.elem_size;
        if max_elems == 0 {
            return 0;
        }

        let ndims = self.pos.len();
        let mut extent = vec![1u64; ndims];
        let inner = ndims - 1;

        // take as much of the innermost row as fits
        extent[inner] = (self.ext[inner] - self.pos[inner]).min(max_elems as u64);
        let mut elems = extent[inner];

        // widen outward over whole rows while aligned at a row start
        if extent[inner] == self.ext[inner] && self.pos[inner] == 0 {
            for d in (0..inner).rev() {
                let per = elems;
                let avail = self.ext[d] - self.pos[d];
                let rows = ((max_elems as u64) / per).min(avail);
                if rows == 0 {
                    break;
                }
                extent[d] = rows;
                elems = per * rows;
                if rows != self.ext[d] || self.pos[d] != 0 {
                    break;
                }
            }
        }

        if tentative {
            self.saved = Some((self.pos.clone(), self.finished));
        }

        info.field_id = self.field_id;
        info.filename = self.filename.clone();
        info.dsetname = self.dsetname.clone();
        info.dset_bounds = self.dset_bounds.clone();
        info.offset = self
            .lo
            .iter()
            .zip(self.pos.iter())
            .map(|(l, p)| l + p)
            .collect();
        info.extent = extent.clone();

        // advance at the outermost dimension the hyperslab covered more than
        // one row of; everything inside it was consumed in full
        let adv_dim = (0..ndims).find(|&d| extent[d] > 1).unwrap_or(inner);
        for p in self.pos.iter_mut().skip(adv_dim + 1) {
            *p = 0;
        }
        self.pos[adv_dim] += extent[adv_dim];
        let mut d = adv_dim;
        while self.pos[d] >= self.ext[d] {
            debug_assert_eq!(self.pos[d], self.ext[d]);
            self.pos[d] = 0;
            if d == 0 {
                self.finished = true;
                break;
            }
            d -= 1;
            self.pos[d] += 1;
        }

        (elems as usize) * self.elem_size
    }

    fn confirm_step(&mut self) {
        self.saved = None;
    }

    fn cancel_step(&mut self) {
        let (pos, finished) = self.saved.take().expect("no tentative step to cancel");
        self.pos = pos;
        self.finished = finished;
    }

    fn get_addresses(&mut self, _addrlist: &mut AddressList) -> bool {
        // dataset space has no flat addresses
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_step_and_cancel() {
        let mut it = LinearIterator::new(0x100, 64);
        let mut info = AddressInfo::default();
        assert_eq!(it.step(16, &mut info, StepFlags::LINEAR, true), 16);
        assert_eq!(info.base_offset, 0x100);
        it.cancel_step();
        assert_eq!(it.step(64, &mut info, StepFlags::LINEAR, false), 64);
        assert_eq!(info.base_offset, 0x100);
        assert_eq!(it.step(1, &mut info, StepFlags::LINEAR, false), 0);
    }

    #[test]
    fn test_span_iterator_walks_in_order() {
        let mut it = SpanIterator::new(vec![(0, 8), (100, 8)]);
        let mut info = AddressInfo::default();
        assert_eq!(it.step(16, &mut info, StepFlags::LINEAR, false), 8);
        assert_eq!(info.base_offset, 0);
        assert_eq!(it.step(16, &mut info, StepFlags::LINEAR, false), 8);
        assert_eq!(info.base_offset, 100);
        assert_eq!(it.step(16, &mut info, StepFlags::LINEAR, false), 0);
    }

    #[test]
    fn test_rect_step_2d_3d() {
        // 2 planes x 3 lines x 32 bytes
        let mut it = RectIterator::new(0, 32, 3, 64, 2, 1024);
        let mut info = AddressInfo::default();

        // full 3D in one step
        let n = it.step(32 * 3 * 2, &mut info, StepFlags::FULL, false);
        assert_eq!(n, 192);
        assert_eq!(info.num_lines, 3);
        assert_eq!(info.num_planes, 2);
        assert!(it.step(32, &mut info, StepFlags::FULL, false) == 0);
    }

    #[test]
    fn test_rect_step_respects_flags() {
        let mut it = RectIterator::new(0, 32, 3, 64, 1, 0);
        let mut info = AddressInfo::default();
        // without lines_ok the step stops at one line
        assert_eq!(it.step(96, &mut info, StepFlags::LINEAR, false), 32);
        assert_eq!(info.num_lines, 1);
        // with lines_ok the rest comes as a 2D chunk
        assert_eq!(it.step(96, &mut info, StepFlags::PLANAR, false), 64);
        assert_eq!(info.num_lines, 2);
        assert_eq!(info.base_offset, 64);
    }

    #[test]
    fn test_rect_get_addresses_emits_planes() {
        let mut it = RectIterator::new(0, 16, 4, 32, 2, 256);
        let mut list = AddressList::new();
        assert!(!it.get_addresses(&mut list));
        assert_eq!(list.bytes_pending(), 16 * 4 * 2);
    }

    #[test]
    fn test_wrapping_fifo_clamps_at_boundary() {
        let mut it = WrappingFifoIterator::new(0x1000, 64);
        let mut info = AddressInfo::default();
        assert_eq!(it.step(48, &mut info, StepFlags::LINEAR, false), 48);
        assert_eq!(info.base_offset, 0x1000);
        // next step stops at the wrap
        assert_eq!(it.step(48, &mut info, StepFlags::LINEAR, false), 16);
        assert_eq!(info.base_offset, 0x1000 + 48);
        // and resumes at the window start
        assert_eq!(it.step(48, &mut info, StepFlags::LINEAR, false), 48);
        assert_eq!(info.base_offset, 0x1000);
        assert!(!it.done());
    }

    #[test]
    fn test_wrapping_fifo_address_lookahead_bounded() {
        let mut it = WrappingFifoIterator::new(0, 64);
        let mut list = AddressList::new();
        it.get_addresses(&mut list);
        assert_eq!(list.bytes_pending(), 64);
    }

    #[test]
    fn test_hdf5_iterator_rows() {
        // 4x6 dataset region, 8-byte elements
        let mut it = Hdf5Iterator::new(
            0,
            "f.h5",
            "dset",
            vec![4, 6],
            vec![0, 0],
            vec![4, 6],
            8,
        );
        let mut info = AddressInfoHdf5::default();
        // budget of 2 rows
        let n = it.step_hdf5(2 * 6 * 8, &mut info, false);
        assert_eq!(n, 96);
        assert_eq!(info.offset, vec![0, 0]);
        assert_eq!(info.extent, vec![2, 6]);
        // partial row next
        let n = it.step_hdf5(4 * 8, &mut info, false);
        assert_eq!(n, 32);
        assert_eq!(info.offset, vec![2, 0]);
        assert_eq!(info.extent, vec![1, 4]);
        // tail of that row
        let n = it.step_hdf5(1 << 20, &mut info, false);
        assert_eq!(n, 16);
        assert_eq!(info.offset, vec![2, 4]);
        // final row
        let n = it.step_hdf5(1 << 20, &mut info, false);
        assert_eq!(n, 48);
        assert_eq!(info.offset, vec![3, 0]);
        assert!(it.done());
    }

    #[test]
    fn test_hdf5_cancel_restores_position() {
        let mut it = Hdf5Iterator::new(0, "f.h5", "d", vec![8], vec![2], vec![4], 4);
        let mut info = AddressInfoHdf5::default();
        let n = it.step_hdf5(8, &mut info, true);
        assert_eq!(n, 8);
        it.cancel_step();
        let n = it.step_hdf5(16, &mut info, false);
        assert_eq!(n, 16);
        assert_eq!(info.offset, vec![2]);
        assert!(it.done());
    }
}
