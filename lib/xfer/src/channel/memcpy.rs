// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process channel for host-to-host copies.
//!
//! The fast path walks both address cursors directly, carving the largest
//! 1D/2D/3D rectangle that fits both endpoints and dispatching to
//! alignment-typed copy loops. Descriptors with a serdez op fall back to the
//! request path, where encode/decode runs per element with a staging buffer
//! for chunks that straddle the IB wrap boundary.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::bgwork::{BackgroundWorkManager, TimeLimit};
use crate::iterator::{AddressInfo, StepFlags, TransferIterator};
use crate::memory::{MemoryKind, NodeId};
use crate::port::PortProgress;
use crate::request::{Request, RequestFlags};
use crate::serdez::SerdezOp;
use crate::xferdes::{SequenceCache, XdProgress, XferDes};

use super::{Channel, ChannelBase, PathEndpoint, XferDesKind};

const CPU_MEM_KINDS: [MemoryKind; 4] = [
    MemoryKind::System,
    MemoryKind::RegDma,
    MemoryKind::ZeroCopy,
    MemoryKind::Socket,
];

// memcpys don't need to be huge to hit peak efficiency; keep chunks small
// enough to stay responsive to the time limit
const MAX_CHUNK: usize = 256 << 10;

const MIN_XFER_SIZE: usize = 4096;

// flush acknowledgements after this many buffered bytes
const SEQ_CACHE_FLUSH: usize = 2 << 20;

pub struct MemcpyChannel {
    base: ChannelBase,
}

impl MemcpyChannel {
    pub fn new(node: NodeId, bgwork: Arc<BackgroundWorkManager>) -> Self {
        let mut base = ChannelBase::new(node, XferDesKind::MemCpy, "memcpy channel", bgwork);
        // any combination of host-mapped kinds
        for src in CPU_MEM_KINDS {
            for dst in CPU_MEM_KINDS {
                base.add_path(
                    PathEndpoint::LocalKind(src),
                    PathEndpoint::LocalKind(dst),
                    0,
                    0,
                    false,
                    true,
                    XferDesKind::MemCpy,
                );
            }
        }
        Self { base }
    }

    fn progress_serdez(&self, xd: &Arc<XferDes>, prog: &mut XdProgress, work_until: TimeLimit) -> bool {
        let mut did_work = false;
        loop {
            let reqs = xd.default_get_requests(prog, 1, RequestFlags::LINEAR);
            if reqs.is_empty() {
                break;
            }
            for req in reqs {
                submit_local(xd, prog, req);
                did_work = true;
            }
            if work_until.is_expired() {
                break;
            }
        }
        did_work
    }

    fn progress_fast(&self, xd: &Arc<XferDes>, prog: &mut XdProgress, work_until: TimeLimit) -> bool {
        let mut did_work = false;
        let mut rseqcache = SequenceCache::read(SEQ_CACHE_FLUSH);
        let mut wseqcache = SequenceCache::write(SEQ_CACHE_FLUSH);

        loop {
            let max_bytes = xd.get_addresses(prog, MIN_XFER_SIZE, &mut rseqcache);
            if max_bytes == 0 {
                break;
            }

            let in_idx = prog.input_control.current_io_port;
            let out_idx = prog.output_control.current_io_port;
            let in_span_start = in_idx
                .map(|i| xd.input_ports[i].local_bytes_total.load(Ordering::Acquire))
                .unwrap_or(0);
            let out_span_start = out_idx
                .map(|i| xd.output_ports[i].local_bytes_total.load(Ordering::Acquire))
                .unwrap_or(0);

            let mut total_bytes = 0usize;
            match (in_idx, out_idx) {
                (Some(ii), Some(oi)) => {
                    // input and output both exist - transfer what we can
                    tracing::trace!(xd = ?xd.guid(), max_bytes, "memcpy chunk");
                    let in_base = xd.input_ports[ii]
                        .mem
                        .as_ref()
                        .and_then(|m| m.get_direct_ptr(0, 0))
                        .expect("memcpy source must be host-mapped")
                        as usize;
                    let out_base = xd.output_ports[oi]
                        .mem
                        .as_ref()
                        .and_then(|m| m.get_direct_ptr(0, 0))
                        .expect("memcpy destination must be host-mapped")
                        as usize;

                    let (in_prog, out_prog) = (&mut prog.inputs[ii], &mut prog.outputs[oi]);
                    while total_bytes < max_bytes {
                        let bytes_left = (max_bytes - total_bytes).min(MAX_CHUNK);
                        let bytes = copy_rectangle(in_base, out_base, in_prog, out_prog, bytes_left);
                        debug_assert!(bytes > 0 && bytes <= bytes_left);
                        total_bytes += bytes;
                        // stop if it's been too long, but always move the
                        // minimum chunk
                        if total_bytes >= MIN_XFER_SIZE && work_until.is_expired() {
                            break;
                        }
                    }
                }
                (Some(ii), None) => {
                    // input but no output: skip input bytes
                    total_bytes = max_bytes;
                    let p = &mut prog.inputs[ii];
                    let PortProgress {
                        addrlist, addrcursor, ..
                    } = p;
                    addrcursor.skip_bytes(addrlist, total_bytes);
                }
                (None, Some(oi)) => {
                    // output but no input: skip output bytes
                    total_bytes = max_bytes;
                    let p = &mut prog.outputs[oi];
                    let PortProgress {
                        addrlist, addrcursor, ..
                    } = p;
                    addrcursor.skip_bytes(addrlist, total_bytes);
                }
                (None, None) => {
                    // simultaneous gather+scatter skip
                    total_bytes = max_bytes;
                }
            }

            // memcpy is immediate: skips and copies acknowledge the same way
            rseqcache.add_span(xd, in_idx, in_span_start, total_bytes);
            wseqcache.add_span(xd, out_idx, out_span_start, total_bytes);

            let done = xd.record_address_consumption(prog, total_bytes);
            did_work = true;

            if done || work_until.is_expired() {
                break;
            }
        }

        rseqcache.flush(xd);
        wseqcache.flush(xd);

        did_work
    }
}

impl Channel for MemcpyChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn progress_xd(&self, xd: &Arc<XferDes>, work_until: TimeLimit) -> bool {
        if xd.transfer_completed() {
            return false;
        }
        let mut prog = xd.lock_progress();
        let has_serdez = xd.input_ports.iter().any(|p| p.serdez_op.is_some())
            || xd.output_ports.iter().any(|p| p.serdez_op.is_some());
        if has_serdez {
            self.progress_serdez(xd, &mut prog, work_until)
        } else {
            self.progress_fast(xd, &mut prog, work_until)
        }
    }
}

/// Carve the largest rectangle both cursors agree on and copy it. Returns
/// bytes moved.
fn copy_rectangle(
    in_base: usize,
    out_base: usize,
    in_prog: &mut PortProgress,
    out_prog: &mut PortProgress,
    bytes_left: usize,
) -> usize {
    let PortProgress {
        addrlist: in_list,
        addrcursor: in_alc,
        ..
    } = in_prog;
    let PortProgress {
        addrlist: out_list,
        addrcursor: out_alc,
        ..
    } = out_prog;

    let in_offset = in_alc.get_offset(in_list);
    let out_offset = out_alc.get_offset(out_list);

    // reported dims shrink over partially consumed entries, so whatever we
    // see here is regular
    let mut in_dim = in_alc.get_dim(in_list);
    let mut out_dim = out_alc.get_dim(out_list);
    assert!(in_dim > 0 && out_dim > 0, "address-list gather/scatter not supported here");

    let mut icount = in_alc.remaining(in_list, 0);
    let mut ocount = out_alc.remaining(out_list, 0);

    // contig bytes is always the min of the first dimensions
    let contig_bytes = icount.min(ocount).min(bytes_left);

    // simple 1D case first
    if contig_bytes == bytes_left
        || (contig_bytes == icount && in_dim == 1)
        || (contig_bytes == ocount && out_dim == 1)
    {
        unsafe {
            memcpy_1d(
                (out_base + out_offset) as *mut u8,
                (in_base + in_offset) as *const u8,
                contig_bytes,
            );
        }
        in_alc.advance(in_list, 0, contig_bytes);
        out_alc.advance(out_list, 0, contig_bytes);
        return contig_bytes;
    }

    // grow to a 2D copy
    let (id, iscale, in_lstride) = if contig_bytes < icount {
        // second input dim comes from splitting the first
        let ilines = icount / contig_bytes;
        if ilines * contig_bytes != icount {
            in_dim = 1; // leftover blocks any deeper growth
        }
        icount = ilines;
        (0usize, contig_bytes, contig_bytes)
    } else {
        assert!(in_dim > 1);
        icount = in_alc.remaining(in_list, 1);
        (1usize, 1usize, in_alc.get_stride(in_list, 1))
    };

    let (od, oscale, out_lstride) = if contig_bytes < ocount {
        let olines = ocount / contig_bytes;
        if olines * contig_bytes != ocount {
            out_dim = 1;
        }
        ocount = olines;
        (0usize, contig_bytes, contig_bytes)
    } else {
        assert!(out_dim > 1);
        ocount = out_alc.remaining(out_list, 1);
        (1usize, 1usize, out_alc.get_stride(out_list, 1))
    };

    let lines = icount.min(ocount).min(bytes_left / contig_bytes);

    // stop at 2D?
    if contig_bytes * lines == bytes_left
        || (lines == icount && id == in_dim - 1)
        || (lines == ocount && od == out_dim - 1)
    {
        let bytes = contig_bytes * lines;
        unsafe {
            memcpy_2d(
                (out_base + out_offset) as *mut u8,
                out_lstride,
                (in_base + in_offset) as *const u8,
                in_lstride,
                contig_bytes,
                lines,
            );
        }
        in_alc.advance(in_list, id, lines * iscale);
        out_alc.advance(out_list, od, lines * oscale);
        return bytes;
    }

    // grow to 3D
    let (id, iscale, in_pstride) = if lines < icount {
        // third input dim comes from splitting the current one
        let iplanes = icount / lines;
        icount = iplanes;
        (id, iscale * lines, in_lstride * lines)
    } else {
        let id = id + 1;
        assert!(in_dim > id);
        icount = in_alc.remaining(in_list, id);
        (id, 1usize, in_alc.get_stride(in_list, id))
    };

    let (od, oscale, out_pstride) = if lines < ocount {
        let oplanes = ocount / lines;
        ocount = oplanes;
        (od, oscale * lines, out_lstride * lines)
    } else {
        let od = od + 1;
        assert!(out_dim > od);
        ocount = out_alc.remaining(out_list, od);
        (od, 1usize, out_alc.get_stride(out_list, od))
    };

    let planes = icount.min(ocount).min(bytes_left / (contig_bytes * lines));
    let bytes = contig_bytes * lines * planes;

    // favor destination linearity: if the destination's plane stride is the
    // tighter one, iterate it as lines (both sides swap, same rectangle)
    let (c_lines, c_planes, c_in_l, c_in_p, c_out_l, c_out_p) = if out_pstride < out_lstride {
        (planes, lines, in_pstride, in_lstride, out_pstride, out_lstride)
    } else {
        (lines, planes, in_lstride, in_pstride, out_lstride, out_pstride)
    };
    unsafe {
        memcpy_3d(
            (out_base + out_offset) as *mut u8,
            c_out_l,
            c_out_p,
            (in_base + in_offset) as *const u8,
            c_in_l,
            c_in_p,
            contig_bytes,
            c_lines,
            c_planes,
        );
    }
    in_alc.advance(in_list, id, planes * iscale);
    out_alc.advance(out_list, od, planes * oscale);
    bytes
}

// ----------------------------------------------------------------------
// alignment-typed copy helpers

unsafe fn copy_typed<T: Copy>(dst: *mut u8, src: *const u8, bytes: usize) {
    let count = bytes / std::mem::size_of::<T>();
    debug_assert_eq!(count * std::mem::size_of::<T>(), bytes);
    unsafe {
        std::ptr::copy_nonoverlapping(src as *const T, dst as *mut T, count);
    }
}

/// 1D copy dispatched by the common alignment of bases and byte count.
pub(crate) unsafe fn memcpy_1d(dst: *mut u8, src: *const u8, bytes: usize) {
    let align = (dst as usize | src as usize | bytes).trailing_zeros();
    unsafe {
        match align {
            0 => copy_typed::<u8>(dst, src, bytes),
            1 => copy_typed::<u16>(dst, src, bytes),
            2 => copy_typed::<u32>(dst, src, bytes),
            3 => copy_typed::<u64>(dst, src, bytes),
            _ => copy_typed::<u128>(dst, src, bytes),
        }
    }
}

pub(crate) unsafe fn memcpy_2d(
    dst: *mut u8,
    dst_stride: usize,
    src: *const u8,
    src_stride: usize,
    bytes: usize,
    lines: usize,
) {
    let mut d = dst;
    let mut s = src;
    for _ in 0..lines {
        unsafe { memcpy_1d(d, s, bytes) };
        d = d.wrapping_add(dst_stride);
        s = s.wrapping_add(src_stride);
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn memcpy_3d(
    dst: *mut u8,
    dst_stride: usize,
    dst_pstride: usize,
    src: *const u8,
    src_stride: usize,
    src_pstride: usize,
    bytes: usize,
    lines: usize,
    planes: usize,
) {
    let mut d = dst;
    let mut s = src;
    for _ in 0..planes {
        unsafe { memcpy_2d(d, dst_stride, s, src_stride, bytes, lines) };
        d = d.wrapping_add(dst_pstride);
        s = s.wrapping_add(src_pstride);
    }
}

// ----------------------------------------------------------------------
// serdez execution

/// Execute one request inline: plain copy, serialize into an IB, or
/// deserialize out of one. Completion callbacks fire before returning.
pub(crate) fn submit_local(xd: &Arc<XferDes>, prog: &mut XdProgress, mut req: Request) {
    let in_port = &xd.input_ports[req.src_port_idx];
    let out_port = &xd.output_ports[req.dst_port_idx];
    let src_op = in_port.serdez_op.clone();
    let dst_op = out_port.serdez_op.clone();
    assert!(!(src_op.is_some() && dst_op.is_some()));

    let mut rewind_src = 0usize;
    let mut rewind_dst = 0usize;

    if let Some(op) = src_op.as_ref() {
        // serializing: the write side's positions are only known now
        req.write_seq_pos = out_port.local_bytes_total.load(Ordering::Acquire);

        let src_base = in_port
            .mem
            .as_ref()
            .and_then(|m| m.get_direct_ptr(0, 0))
            .expect("serialize source must be host-mapped") as usize;
        let out_prog = &mut prog.outputs[req.dst_port_idx];

        let mut src_line = src_base + req.src_off;
        let mut src_plane = src_line;
        for j in 0..req.nplanes {
            for i in 0..req.nlines {
                let written = serialize_line(
                    xd,
                    op.as_ref(),
                    out_prog,
                    req.dst_port_idx,
                    src_line as *const u8,
                    req.nbytes,
                );
                let num_elems = req.nbytes / op.sizeof_field_type();
                crate::serdez::check_serialized_size(op.as_ref(), written, num_elems);
                rewind_dst += num_elems * op.max_serialized_size() - written;
                if i + 1 < req.nlines {
                    src_line += req.src_str;
                }
            }
            if j + 1 < req.nplanes {
                src_plane += req.src_pstr;
                src_line = src_plane;
            }
        }
        req.write_seq_count =
            out_port.local_bytes_total.load(Ordering::Acquire) - req.write_seq_pos;
        if rewind_dst > 0 {
            // return the unused worst-case slack
            out_port.local_bytes_cons.fetch_sub(rewind_dst, Ordering::AcqRel);
        }
    } else if let Some(op) = dst_op.as_ref() {
        // deserializing: the read side's positions are only known now
        req.read_seq_pos = in_port.local_bytes_total.load(Ordering::Acquire);

        let dst_base = out_port
            .mem
            .as_ref()
            .and_then(|m| m.get_direct_ptr(0, 0))
            .expect("deserialize destination must be host-mapped") as usize;
        let in_prog = &mut prog.inputs[req.src_port_idx];

        let mut dst_line = dst_base + req.dst_off;
        let mut dst_plane = dst_line;
        for j in 0..req.nplanes {
            for i in 0..req.nlines {
                let consumed = deserialize_line(
                    xd,
                    op.as_ref(),
                    in_prog,
                    req.src_port_idx,
                    dst_line as *mut u8,
                    req.nbytes,
                );
                let num_elems = req.nbytes / op.sizeof_field_type();
                crate::serdez::check_serialized_size(op.as_ref(), consumed, num_elems);
                rewind_src += num_elems * op.max_serialized_size() - consumed;
                if i + 1 < req.nlines {
                    dst_line += req.dst_str;
                }
            }
            if j + 1 < req.nplanes {
                dst_plane += req.dst_pstr;
                dst_line = dst_plane;
            }
        }
        req.read_seq_count = in_port.local_bytes_total.load(Ordering::Acquire) - req.read_seq_pos;
        if rewind_src > 0 {
            in_port.local_bytes_cons.fetch_sub(rewind_src, Ordering::AcqRel);
        }
    } else {
        // plain copy
        let src_base = in_port
            .mem
            .as_ref()
            .and_then(|m| m.get_direct_ptr(0, 0))
            .expect("memcpy source must be host-mapped") as usize;
        let dst_base = out_port
            .mem
            .as_ref()
            .and_then(|m| m.get_direct_ptr(0, 0))
            .expect("memcpy destination must be host-mapped") as usize;
        unsafe {
            memcpy_3d(
                (dst_base + req.dst_off) as *mut u8,
                req.dst_str,
                req.dst_pstr,
                (src_base + req.src_off) as *const u8,
                req.src_str,
                req.src_pstr,
                req.nbytes,
                req.nlines,
                req.nplanes,
            );
        }
    }

    xd.default_notify_request_read_done(&req);
    xd.default_notify_request_write_done(&req);
}

/// Serialize one line of `line_bytes / field` elements into the output IB.
///
/// The IB is a circular window, so the writer works in window coordinates
/// directly: runs of elements go straight into the contiguous span before
/// the wrap, and an element that would straddle the boundary is encoded into
/// a scratch buffer of `max_serialized_size` bytes and written as two
/// halves. The port iterator is advanced once, by the actual byte count.
/// Returns bytes written; advances the output's `local_bytes_total`.
fn serialize_line(
    xd: &Arc<XferDes>,
    op: &dyn SerdezOp,
    out_prog: &mut PortProgress,
    dst_port_idx: usize,
    src: *const u8,
    line_bytes: usize,
) -> usize {
    let out_port = &xd.output_ports[dst_port_idx];
    let out_mem = out_port.mem.as_ref().expect("serialize target must have memory");
    let field_size = op.sizeof_field_type();
    let maxser = op.max_serialized_size();
    let num_elems = line_bytes / field_size;
    debug_assert_eq!(num_elems * field_size, line_bytes);
    let size = out_port.ib_size;
    assert!(size >= maxser, "IB smaller than one worst-case element");
    let ib_base = out_mem
        .get_direct_ptr(out_port.ib_offset, size)
        .expect("IB must be host-mapped");

    let lbt = out_port.local_bytes_total.load(Ordering::Acquire);
    let mut w = lbt % size;
    let mut bytes_used = 0usize;
    let mut scratch: Option<Vec<u8>> = None;
    let mut done = 0usize;
    while done < num_elems {
        let contig = size - w;
        if contig >= maxser {
            // whole elements fit before the wrap
            let batch = (contig / maxser).min(num_elems - done);
            let amt = unsafe {
                op.serialize(src.add(done * field_size), batch, ib_base.add(w))
            };
            debug_assert!(amt <= contig);
            w = (w + amt) % size;
            bytes_used += amt;
            done += batch;
        } else {
            // stage one element across the boundary
            let buf = scratch.get_or_insert_with(|| vec![0u8; maxser]);
            let amt = unsafe {
                op.serialize_one(src.add(done * field_size), buf.as_mut_ptr())
            };
            debug_assert!(amt <= maxser);
            let first = amt.min(contig);
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), ib_base.add(w), first);
                std::ptr::copy_nonoverlapping(buf.as_ptr().add(first), ib_base, amt - first);
            }
            w = (w + amt) % size;
            bytes_used += amt;
            done += 1;
        }
    }

    advance_stream(out_prog.iter.as_mut(), bytes_used);
    out_port
        .local_bytes_total
        .store(lbt + bytes_used, Ordering::Release);
    bytes_used
}

/// Deserialize one line of `line_bytes / field` elements from the input IB.
///
/// Mirror of [`serialize_line`]: reads runs directly from the window and
/// stages boundary-straddling elements through a scratch buffer. The scratch
/// may pick up bytes past the valid stream; they stay inside the IB
/// allocation and the decoder never uses them.
/// Returns bytes consumed; advances the input's `local_bytes_total`.
fn deserialize_line(
    xd: &Arc<XferDes>,
    op: &dyn SerdezOp,
    in_prog: &mut PortProgress,
    src_port_idx: usize,
    dst: *mut u8,
    line_bytes: usize,
) -> usize {
    let in_port = &xd.input_ports[src_port_idx];
    let in_mem = in_port.mem.as_ref().expect("deserialize source must have memory");
    let field_size = op.sizeof_field_type();
    let maxser = op.max_serialized_size();
    let num_elems = line_bytes / field_size;
    debug_assert_eq!(num_elems * field_size, line_bytes);
    let size = in_port.ib_size;
    assert!(size >= maxser, "IB smaller than one worst-case element");
    let ib_base = in_mem
        .get_direct_ptr(in_port.ib_offset, size)
        .expect("IB must be host-mapped");

    let lbt = in_port.local_bytes_total.load(Ordering::Acquire);
    let mut w = lbt % size;
    let mut bytes_used = 0usize;
    let mut scratch: Option<Vec<u8>> = None;
    let mut done = 0usize;
    while done < num_elems {
        let contig = size - w;
        if contig >= maxser {
            let batch = (contig / maxser).min(num_elems - done);
            let amt = unsafe {
                op.deserialize(dst.add(done * field_size), batch, ib_base.add(w))
            };
            debug_assert!(amt <= contig);
            w = (w + amt) % size;
            bytes_used += amt;
            done += batch;
        } else {
            let buf = scratch.get_or_insert_with(|| vec![0u8; maxser]);
            unsafe {
                std::ptr::copy_nonoverlapping(ib_base.add(w), buf.as_mut_ptr(), contig);
                std::ptr::copy_nonoverlapping(
                    ib_base,
                    buf.as_mut_ptr().add(contig),
                    maxser - contig,
                );
            }
            let amt = unsafe { op.deserialize_one(dst.add(done * field_size), buf.as_ptr()) };
            debug_assert!(amt <= maxser);
            w = (w + amt) % size;
            bytes_used += amt;
            done += 1;
        }
    }

    advance_stream(in_prog.iter.as_mut(), bytes_used);
    in_port
        .local_bytes_total
        .store(lbt + bytes_used, Ordering::Release);
    bytes_used
}

/// Step a wrapping stream iterator forward by exactly `bytes`, tolerating
/// the per-step wrap clamping.
fn advance_stream(iter: &mut dyn TransferIterator, bytes: usize) {
    let mut remaining = bytes;
    let mut dummy = AddressInfo::default();
    while remaining > 0 {
        let n = iter.step(remaining, &mut dummy, StepFlags::LINEAR, false);
        assert!(n > 0);
        remaining -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memcpy_1d_alignments() {
        for align_off in 0..4usize {
            let src: Vec<u8> = (0..128u8).collect();
            let mut dst = vec![0u8; 200];
            let n = 100 - align_off;
            unsafe {
                memcpy_1d(
                    dst.as_mut_ptr().add(align_off),
                    src.as_ptr().add(align_off),
                    n,
                );
            }
            assert_eq!(&dst[align_off..align_off + n], &src[align_off..align_off + n]);
        }
    }

    #[test]
    fn test_memcpy_2d_strided() {
        let src: Vec<u8> = (0..64u8).collect();
        let mut dst = vec![0u8; 64];
        // 4 lines of 8 bytes: src stride 16, dst stride 8 (pack)
        unsafe {
            memcpy_2d(dst.as_mut_ptr(), 8, src.as_ptr(), 16, 8, 4);
        }
        for line in 0..4 {
            assert_eq!(&dst[line * 8..line * 8 + 8], &src[line * 16..line * 16 + 8]);
        }
    }

    #[test]
    fn test_memcpy_3d() {
        let src: Vec<u8> = (0..255u8).collect();
        let mut dst = vec![0u8; 255];
        // 2 planes of 3 lines of 4 bytes; unpack into wider strides
        unsafe {
            memcpy_3d(
                dst.as_mut_ptr(),
                8,
                32,
                src.as_ptr(),
                4,
                12,
                4,
                3,
                2,
            );
        }
        for p in 0..2 {
            for l in 0..3 {
                assert_eq!(
                    &dst[p * 32 + l * 8..p * 32 + l * 8 + 4],
                    &src[p * 12 + l * 4..p * 12 + l * 4 + 4]
                );
            }
        }
    }
}
