// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Remote-write channel: pushes bytes to RDMA-visible memories of peer
//! nodes.
//!
//! Each chunk goes out as one data message that fuses the payload with the
//! downstream `pre_bytes_write` (and, at end-of-stream, the folded
//! `pre_bytes_total`). Three transport modes per chunk: contiguous 1D
//! source, 2D source flattened line by line, or gather assembly of many
//! small pieces into a single payload. The destination side is always
//! contiguous. Reads acknowledge at local completion (the payload has been
//! copied out); writes acknowledge when the target's ack message returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bgwork::{BackgroundWorkManager, TimeLimit};
use crate::memory::NodeId;
use crate::message::{RemoteWriteMessage, XferMessage};
use crate::port::PortProgress;
use crate::xferdes::{SequenceCache, XferDes, XFERDES_NO_GUID};

use super::memcpy::{memcpy_1d, memcpy_2d, memcpy_3d};
use super::{Channel, ChannelBase, PathEndpoint, PathInfo, PathQuery, XferDesKind};

// above this, the network prefers several messages over one giant one
const RECOMMENDED_MAX_PAYLOAD: usize = 256 << 10;

// gather assembly buys one message (and one ack) at the cost of a copy;
// worth it whenever the pieces are small relative to the chunk
const MAX_ASSEMBLY_SIZE: usize = 64 << 10;
const MAX_PIECE_FOR_ASSEMBLY: usize = 4096;

const MIN_XFER_SIZE: usize = 4096;

struct PendingWrite {
    xd: Arc<XferDes>,
    dst_port_idx: usize,
    span_start: usize,
    bytes: usize,
}

pub struct RemoteWriteChannel {
    base: ChannelBase,
    pending: Mutex<HashMap<u64, PendingWrite>>,
    next_request_id: AtomicU64,
}

impl RemoteWriteChannel {
    pub fn new(node: NodeId, bgwork: Arc<BackgroundWorkManager>) -> Self {
        let mut base = ChannelBase::new(node, XferDesKind::RemoteWrite, "remote write channel", bgwork);
        base.add_path(
            PathEndpoint::LocalRdma,
            PathEndpoint::RemoteRdma,
            0,
            0,
            false,
            false,
            XferDesKind::RemoteWrite,
        );
        Self {
            base,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Remote ack arrived: the write landed on the target node.
    pub fn handle_ack(&self, request_id: u64) {
        let Some(pw) = self.pending.lock().unwrap().remove(&request_id) else {
            tracing::warn!(request_id, "ack for unknown remote write");
            return;
        };
        pw.xd.update_bytes_write(pw.dst_port_idx, pw.span_start, pw.bytes);
    }

    #[allow(clippy::too_many_arguments)]
    fn send_chunk(
        &self,
        xd: &Arc<XferDes>,
        out_idx: usize,
        out_span_start: usize,
        data: Vec<u8>,
        target: crate::memory::RemoteAddress,
    ) {
        let out_port = &xd.output_ports[out_idx];
        let bytes = data.len();

        // fold the end-of-stream total in when it's already known
        let pre_bytes_total = if out_port.needs_pbt_update.load(Ordering::Acquire)
            && xd.iteration_completed()
            && out_port.needs_pbt_update.swap(false, Ordering::AcqRel)
        {
            Some(out_port.local_bytes_total.load(Ordering::Acquire))
        } else {
            None
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().unwrap().insert(
            request_id,
            PendingWrite {
                xd: xd.clone(),
                dst_port_idx: out_idx,
                span_start: out_span_start,
                bytes,
            },
        );

        let msg = XferMessage::RemoteWrite(RemoteWriteMessage {
            target,
            next_xd_guid: out_port.peer_guid,
            next_port_idx: out_port.peer_port_idx,
            span_start: out_span_start,
            pre_bytes_total,
            request_id,
            data,
        });
        let target_node = target.mem.owner_node();
        if let Err(err) = xd.queue().transport().send(self.node(), target_node, msg) {
            tracing::warn!(%err, xd = ?xd.guid(), "remote write send failed");
            xd.mark_failed();
            // complete the write locally so the descriptor can drain
            self.handle_ack(request_id);
        }
    }
}

impl Channel for RemoteWriteChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn supports_path(&self, q: &PathQuery) -> Option<PathInfo> {
        // simultaneous serialization+deserialization is never allowed over
        // the wire
        if q.src_serdez && q.dst_serdez {
            return None;
        }
        super::scan_paths(self.paths(), self.node(), q)
    }

    fn progress_xd(&self, xd: &Arc<XferDes>, work_until: TimeLimit) -> bool {
        if xd.transfer_completed() {
            return false;
        }
        let mut guard = xd.lock_progress();
        let prog = &mut *guard;
        let mut did_work = false;
        // reads ack when assembly or skip copies the data out; writes only
        // when the target acks
        let mut rseqcache = SequenceCache::read(0);
        let mut wseqcache = SequenceCache::write(0);

        loop {
            let max_bytes = xd.get_addresses(prog, MIN_XFER_SIZE, &mut rseqcache);
            if max_bytes == 0 {
                break;
            }

            let in_idx = prog.input_control.current_io_port;
            let out_idx = prog.output_control.current_io_port;
            let mut in_span_start = in_idx
                .map(|i| xd.input_ports[i].local_bytes_total.load(Ordering::Acquire))
                .unwrap_or(0);
            let mut out_span_start = out_idx
                .map(|i| xd.output_ports[i].local_bytes_total.load(Ordering::Acquire))
                .unwrap_or(0);

            let mut total_bytes = 0usize;
            match (in_idx, out_idx) {
                (Some(ii), Some(oi)) => {
                    tracing::trace!(xd = ?xd.guid(), max_bytes, "remote write chunk");
                    let in_mem = xd.input_ports[ii].mem.clone().expect("source must be local");
                    let in_base = in_mem
                        .get_direct_ptr(0, 0)
                        .expect("remote write source must be host-mapped")
                        as usize;
                    let out_mem = xd.output_ports[oi].mem.clone().expect("target must be known");

                    while total_bytes < max_bytes {
                        let bytes_left = max_bytes - total_bytes;
                        let (in_prog, out_prog) = (&mut prog.inputs[ii], &mut prog.outputs[oi]);
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

                        let in_dim = in_alc.get_dim(in_list);
                        let out_dim = out_alc.get_dim(out_list);
                        assert!(out_dim > 0, "scatter target not supported by remote writes");
                        let icount = in_alc.remaining(in_list, 0);
                        let ocount = out_alc.remaining(out_list, 0);

                        // the destination controls the message size and must
                        // stay contiguous
                        let dst_1d_maxbytes = bytes_left.min(ocount);
                        let target = out_mem
                            .get_remote_addr(out_alc.get_offset(out_list))
                            .expect("remote write target must be RDMA-visible");

                        let src_1d_maxbytes = if in_dim > 0 {
                            dst_1d_maxbytes.min(icount).min(RECOMMENDED_MAX_PAYLOAD)
                        } else {
                            0
                        };
                        let src_2d_maxbytes = if in_dim > 1 {
                            let lines = in_alc.remaining(in_list, 1);
                            let mut rec = RECOMMENDED_MAX_PAYLOAD;
                            rec -= rec % icount;
                            dst_1d_maxbytes.min(icount * lines).min(rec)
                        } else {
                            0
                        };
                        // assembly only pays off for small pieces
                        let src_ga_maxbytes = if icount <= MAX_PIECE_FOR_ASSEMBLY {
                            dst_1d_maxbytes.min(bytes_left).min(MAX_ASSEMBLY_SIZE)
                        } else {
                            0
                        };

                        // favor 1d >> 2d >> gather
                        let bytes;
                        if src_1d_maxbytes >= src_2d_maxbytes
                            && src_1d_maxbytes >= src_ga_maxbytes
                        {
                            bytes = src_1d_maxbytes;
                            let src = (in_base + in_alc.get_offset(in_list)) as *const u8;
                            let mut data = vec![0u8; bytes];
                            unsafe { memcpy_1d(data.as_mut_ptr(), src, bytes) };
                            in_alc.advance(in_list, 0, bytes);
                            out_alc.advance(out_list, 0, bytes);
                            self.send_chunk(xd, oi, out_span_start, data, target);
                        } else if src_2d_maxbytes >= src_ga_maxbytes {
                            let bytes_per_line = icount;
                            let lines = src_2d_maxbytes / bytes_per_line;
                            bytes = bytes_per_line * lines;
                            let src = (in_base + in_alc.get_offset(in_list)) as *const u8;
                            let src_stride = in_alc.get_stride(in_list, 1);
                            let mut data = vec![0u8; bytes];
                            unsafe {
                                memcpy_2d(
                                    data.as_mut_ptr(),
                                    bytes_per_line,
                                    src,
                                    src_stride,
                                    bytes_per_line,
                                    lines,
                                )
                            };
                            in_alc.advance(in_list, 1, lines);
                            out_alc.advance(out_list, 0, bytes);
                            self.send_chunk(xd, oi, out_span_start, data, target);
                        } else {
                            // gather: assemble small pieces into one payload
                            bytes = src_ga_maxbytes;
                            let mut data = vec![0u8; bytes];
                            let mut filled = 0usize;
                            let mut todo = bytes;
                            let mut in_dim = in_dim;
                            let mut icount = icount;
                            while todo > 0 {
                                assert!(in_dim > 0, "gather source address list required");
                                if icount >= todo / 2 || in_dim == 1 {
                                    let chunk = todo.min(icount);
                                    let src =
                                        (in_base + in_alc.get_offset(in_list)) as *const u8;
                                    unsafe {
                                        memcpy_1d(data.as_mut_ptr().add(filled), src, chunk)
                                    };
                                    in_alc.advance(in_list, 0, chunk);
                                    filled += chunk;
                                    todo -= chunk;
                                } else {
                                    let lines = (todo / icount).min(in_alc.remaining(in_list, 1));
                                    if icount * lines >= todo / 2 || in_dim == 2 {
                                        let src =
                                            (in_base + in_alc.get_offset(in_list)) as *const u8;
                                        unsafe {
                                            memcpy_2d(
                                                data.as_mut_ptr().add(filled),
                                                icount,
                                                src,
                                                in_alc.get_stride(in_list, 1),
                                                icount,
                                                lines,
                                            )
                                        };
                                        in_alc.advance(in_list, 1, lines);
                                        filled += icount * lines;
                                        todo -= icount * lines;
                                    } else {
                                        let planes = (todo / (icount * lines))
                                            .min(in_alc.remaining(in_list, 2));
                                        let src =
                                            (in_base + in_alc.get_offset(in_list)) as *const u8;
                                        unsafe {
                                            memcpy_3d(
                                                data.as_mut_ptr().add(filled),
                                                icount,
                                                icount * lines,
                                                src,
                                                in_alc.get_stride(in_list, 1),
                                                in_alc.get_stride(in_list, 2),
                                                icount,
                                                lines,
                                                planes,
                                            )
                                        };
                                        in_alc.advance(in_list, 2, planes);
                                        filled += icount * lines * planes;
                                        todo -= icount * lines * planes;
                                    }
                                }
                                if todo == 0 {
                                    break;
                                }
                                // read the next entry
                                in_dim = in_alc.get_dim(in_list);
                                icount = in_alc.remaining(in_list, 0);
                            }
                            debug_assert_eq!(filled, bytes);
                            out_alc.advance(out_list, 0, bytes);
                            self.send_chunk(xd, oi, out_span_start, data, target);
                        }

                        // the payload was copied out of the source, so the
                        // read completes locally
                        rseqcache.add_span(xd, Some(ii), in_span_start, bytes);
                        in_span_start += bytes;
                        out_span_start += bytes;

                        debug_assert!(bytes > 0 && bytes <= bytes_left);
                        total_bytes += bytes;

                        if total_bytes >= MIN_XFER_SIZE && work_until.is_expired() {
                            break;
                        }
                    }
                }
                (Some(ii), None) => {
                    // input but no output: skip input bytes
                    total_bytes = max_bytes;
                    let PortProgress {
                        addrlist, addrcursor, ..
                    } = &mut prog.inputs[ii];
                    addrcursor.skip_bytes(addrlist, total_bytes);
                    rseqcache.add_span(xd, Some(ii), in_span_start, total_bytes);
                }
                (None, Some(oi)) => {
                    // output but no input: skip output bytes
                    total_bytes = max_bytes;
                    let PortProgress {
                        addrlist, addrcursor, ..
                    } = &mut prog.outputs[oi];
                    addrcursor.skip_bytes(addrlist, total_bytes);
                    wseqcache.add_span(xd, Some(oi), out_span_start, total_bytes);
                }
                (None, None) => {
                    total_bytes = max_bytes;
                }
            }

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

/// Target-side delivery of a remote-write message: land the payload, notify
/// the downstream descriptor, and ack (except for empty messages).
pub fn handle_remote_write(
    queue: &Arc<crate::queue::XferDesQueue>,
    sender: NodeId,
    msg: RemoteWriteMessage,
) {
    tracing::trace!(next = ?msg.next_xd_guid, start = msg.span_start,
                    size = msg.data.len(), pbt = ?msg.pre_bytes_total,
                    "remote write received");

    if !msg.data.is_empty() {
        let mem = queue
            .memories()
            .lookup(msg.target.mem)
            .expect("remote write target not registered");
        match mem.get_direct_ptr(msg.target.offset as usize, msg.data.len()) {
            Some(dst) => unsafe {
                std::ptr::copy_nonoverlapping(msg.data.as_ptr(), dst, msg.data.len());
            },
            None => {
                mem.put_bytes(msg.target.offset as usize, &msg.data)
                    .expect("remote write target rejected bytes");
            }
        }
    }

    // notify the (probably local) next descriptor
    if msg.next_xd_guid != XFERDES_NO_GUID {
        if let Some(pbt) = msg.pre_bytes_total {
            queue.update_pre_bytes_total(msg.next_xd_guid, msg.next_port_idx, pbt);
        }
        queue.update_pre_bytes_write(
            msg.next_xd_guid,
            msg.next_port_idx,
            msg.span_start,
            msg.data.len(),
        );
    }

    // don't ack empty messages
    if !msg.data.is_empty() {
        let _ = queue.transport().send(
            queue.node_id(),
            sender,
            XferMessage::RemoteWriteAck {
                request_id: msg.request_id,
            },
        );
    }
}
