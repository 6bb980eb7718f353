// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transfer descriptors: the per-hop state machines of the transfer DAG.
//!
//! Each descriptor owns input and output ports, pulls addresses from its
//! iterators, plans channel requests under flow control, and advances the
//! byte counters its neighbors observe. A descriptor is progressed by at
//! most one worker at a time; cross-node updates arrive concurrently and
//! touch only the atomic counters and sequence assemblers on the ports.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::channel::{Channel, XferDesKind};
use crate::iterator::AddressInfo;
use crate::memory::NodeId;
use crate::port::{ControlState, ControlWord, IbInfo, PortInit, PortProgress, PortType, XferPort};
use crate::queue::XferDesQueue;
use crate::request::{Request, RequestDim, RequestFlags};

/// Descriptor GUID: owner node in the top 16 bits, per-node index below.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct XferDesId(pub u64);

pub const NODE_SHIFT: u32 = 48;

/// "No neighbor" sentinel for terminal ports.
pub const XFERDES_NO_GUID: XferDesId = XferDesId(0);

impl XferDesId {
    pub fn new(node: NodeId, index: u64) -> Self {
        debug_assert!(index != 0 || node != 0);
        debug_assert!(index < (1u64 << NODE_SHIFT));
        Self(((node as u64) << NODE_SHIFT) | index)
    }

    pub fn owner_node(&self) -> NodeId {
        (self.0 >> NODE_SHIFT) as NodeId
    }
}

impl std::fmt::Debug for XferDesId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xd[{:x}]", self.0)
    }
}

/// Where to report this descriptor's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceHandle {
    pub launch_node: NodeId,
    pub fence_id: u64,
}

/// Construction-time description of a descriptor.
pub struct XferDesCreateArgs {
    pub guid: XferDesId,
    pub launch_node: NodeId,
    pub inputs: Vec<PortInit>,
    pub outputs: Vec<PortInit>,
    pub priority: i32,
    pub max_req_size: usize,
    pub max_reqs: usize,
    pub fence: FenceHandle,
}

impl XferDesCreateArgs {
    pub fn new(
        guid: XferDesId,
        launch_node: NodeId,
        inputs: Vec<PortInit>,
        outputs: Vec<PortInit>,
        fence: FenceHandle,
    ) -> Self {
        Self {
            guid,
            launch_node,
            inputs,
            outputs,
            priority: 0,
            max_req_size: 256 << 10,
            max_reqs: 16,
            fence,
        }
    }
}

// scheduling states of a descriptor
const SCHED_IDLE: u8 = 0;
const SCHED_QUEUED: u8 = 1;
const SCHED_RUNNING: u8 = 2;
const SCHED_RUNNING_DIRTY: u8 = 3;

/// Progress-owned state: everything only the single progressing worker
/// touches.
pub struct XdProgress {
    pub inputs: Vec<PortProgress>,
    pub outputs: Vec<PortProgress>,
    pub input_control: ControlState,
    pub output_control: ControlState,
}

/// The state machine for one logical transfer hop.
pub struct XferDes {
    guid: XferDesId,
    launch_node: NodeId,
    kind: XferDesKind,
    priority: i32,
    max_req_size: usize,
    max_reqs: usize,
    pub input_ports: Vec<XferPort>,
    pub output_ports: Vec<XferPort>,
    progress: Mutex<XdProgress>,
    iteration_completed: AtomicBool,
    transfer_completed: AtomicBool,
    transfer_failed: AtomicBool,
    completion_done: AtomicBool,
    sched_state: AtomicU8,
    progress_counter: AtomicU64,
    available_reqs: AtomicUsize,
    /// Pre-bytes-write updates are folded into this channel's own data
    /// messages, so the generic write path must not send them again.
    inline_pre_bytes_write: bool,
    fence: FenceHandle,
    input_ibs: Vec<IbInfo>,
    queue: Arc<XferDesQueue>,
    channel: Arc<dyn Channel>,
}

impl XferDes {
    pub fn new(
        args: XferDesCreateArgs,
        kind: XferDesKind,
        channel: Arc<dyn Channel>,
        queue: Arc<XferDesQueue>,
    ) -> Arc<Self> {
        let mut input_ports = Vec::with_capacity(args.inputs.len());
        let mut inputs = Vec::with_capacity(args.inputs.len());
        let mut gather_control_port = None;
        let mut scatter_control_port = None;
        let mut input_ibs = Vec::new();
        for (i, init) in args.inputs.iter().enumerate() {
            let mem = init.mem.and_then(|id| queue.memories().lookup(id));
            debug_assert!(
                init.mem.is_none() || mem.is_some(),
                "input memory not registered on this node"
            );
            input_ports.push(XferPort::from_init(init, mem, true));
            match init.port_type {
                PortType::GatherControl => gather_control_port = Some(i),
                PortType::ScatterControl => scatter_control_port = Some(i),
                PortType::Data => {}
            }
            if init.ib_size > 0 {
                input_ibs.push(IbInfo {
                    memory: init.mem.expect("IB port without a memory"),
                    offset: init.ib_offset,
                    size: init.ib_size,
                });
            }
        }

        let mut output_ports = Vec::with_capacity(args.outputs.len());
        let mut outputs = Vec::with_capacity(args.outputs.len());
        for init in &args.outputs {
            let mem = init.mem.and_then(|id| queue.memories().lookup(id));
            debug_assert!(init.mem.is_none() || mem.is_some());
            output_ports.push(XferPort::from_init(init, mem, false));
        }

        // wire up indirection in a second pass
        let mut args = args;
        for i in 0..args.inputs.len() {
            if let Some(ind) = args.inputs[i].indirect_port_idx {
                args.inputs[i].iter.set_indirect_input_port(ind);
                input_ports[ind].is_indirect_port = true;
            }
        }
        for o in args.outputs.iter_mut() {
            if let Some(ind) = o.indirect_port_idx {
                o.iter.set_indirect_input_port(ind);
                input_ports[ind].is_indirect_port = true;
            }
        }

        for init in args.inputs {
            inputs.push(PortProgress {
                iter: init.iter,
                addrlist: Default::default(),
                addrcursor: Default::default(),
            });
        }
        for init in args.outputs {
            outputs.push(PortProgress {
                iter: init.iter,
                addrlist: Default::default(),
                addrcursor: Default::default(),
            });
        }

        let input_control = match gather_control_port {
            Some(i) => ControlState::controlled(i),
            None => ControlState::uncontrolled(),
        };
        let output_control = match scatter_control_port {
            Some(i) => ControlState::controlled(i),
            None => ControlState::uncontrolled(),
        };

        let inline_pre_bytes_write = kind == XferDesKind::RemoteWrite;

        Arc::new(Self {
            guid: args.guid,
            launch_node: args.launch_node,
            kind,
            priority: args.priority,
            max_req_size: args.max_req_size,
            max_reqs: args.max_reqs,
            input_ports,
            output_ports,
            progress: Mutex::new(XdProgress {
                inputs,
                outputs,
                input_control,
                output_control,
            }),
            iteration_completed: AtomicBool::new(false),
            transfer_completed: AtomicBool::new(false),
            transfer_failed: AtomicBool::new(false),
            completion_done: AtomicBool::new(false),
            sched_state: AtomicU8::new(SCHED_IDLE),
            progress_counter: AtomicU64::new(0),
            available_reqs: AtomicUsize::new(args.max_reqs),
            inline_pre_bytes_write,
            fence: args.fence,
            input_ibs,
            queue,
            channel,
        })
    }

    pub fn guid(&self) -> XferDesId {
        self.guid
    }

    pub fn kind(&self) -> XferDesKind {
        self.kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn max_req_size(&self) -> usize {
        self.max_req_size
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn queue(&self) -> &Arc<XferDesQueue> {
        &self.queue
    }

    pub fn iteration_completed(&self) -> bool {
        self.iteration_completed.load(Ordering::Acquire)
    }

    pub fn transfer_completed(&self) -> bool {
        self.transfer_completed.load(Ordering::Acquire)
    }

    pub fn mark_failed(&self) {
        self.transfer_failed.store(true, Ordering::Release);
    }

    pub fn lock_progress(&self) -> MutexGuard<'_, XdProgress> {
        self.progress.lock().unwrap()
    }

    // ------------------------------------------------------------------
    // scheduling

    /// Re-arm this descriptor after any counter changed. Safe to call from
    /// update handlers and completion callbacks.
    pub fn update_progress(self: &Arc<Self>) {
        self.progress_counter.fetch_add(1, Ordering::Relaxed);
        if self.transfer_completed.load(Ordering::Acquire) {
            return;
        }
        loop {
            let cur = self.sched_state.load(Ordering::Acquire);
            let (next, push) = match cur {
                SCHED_IDLE => (SCHED_QUEUED, true),
                SCHED_RUNNING => (SCHED_RUNNING_DIRTY, false),
                _ => return,
            };
            if self
                .sched_state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if push {
                    self.channel.enqueue_ready_xd(self.clone());
                }
                return;
            }
        }
    }

    /// Worker-side: claim the descriptor for progress. False if it raced
    /// with completion.
    pub(crate) fn sched_begin_progress(&self) -> bool {
        if self.transfer_completed.load(Ordering::Acquire) {
            return false;
        }
        self.sched_state.store(SCHED_RUNNING, Ordering::Release);
        true
    }

    /// Worker-side: release the descriptor. True means it should be
    /// re-queued immediately.
    pub(crate) fn sched_finish_progress(&self, did_work: bool) -> bool {
        if did_work {
            self.sched_state.store(SCHED_QUEUED, Ordering::Release);
            return true;
        }
        match self.sched_state.compare_exchange(
            SCHED_RUNNING,
            SCHED_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(_) => {
                // an update arrived mid-progress
                self.sched_state.store(SCHED_QUEUED, Ordering::Release);
                true
            }
        }
    }

    /// Collect metadata-readiness events from every iterator; an empty
    /// result means everything is ready now.
    pub fn request_metadata(&self) -> Vec<crate::bgwork::ReadyEvent> {
        let mut prog = self.lock_progress();
        let mut pending = Vec::new();
        let prog = &mut *prog;
        for p in prog.inputs.iter_mut().chain(prog.outputs.iter_mut()) {
            if let Some(ev) = p.iter.request_metadata() {
                if !ev.has_triggered() {
                    pending.push(ev);
                }
            }
        }
        pending
    }

    // ------------------------------------------------------------------
    // request pool

    pub fn request_available(&self) -> bool {
        self.available_reqs.load(Ordering::Acquire) > 0
    }

    fn take_request_slot(&self) -> bool {
        let mut cur = self.available_reqs.load(Ordering::Acquire);
        while cur > 0 {
            match self.available_reqs.compare_exchange(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(now) => cur = now,
            }
        }
        false
    }

    /// Return a request slot to the pool (called when a request fully
    /// completes).
    pub fn enqueue_request_slot(&self) {
        let prev = self.available_reqs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev < self.max_reqs);
    }

    // ------------------------------------------------------------------
    // byte-counter updates

    /// Input-side completion: bytes `[offset, offset+size)` of port
    /// `port_idx` have been fully read.
    pub fn update_bytes_read(self: &Arc<Self>, port_idx: usize, offset: usize, size: usize) {
        let in_port = &self.input_ports[port_idx];
        let inc_amt = in_port.seq_local.add_span(offset, size);
        tracing::trace!(xd = ?self.guid, port = port_idx, offset, size, inc_amt, "bytes_read");
        if in_port.peer_guid != XFERDES_NO_GUID && inc_amt > 0 {
            // we're telling the previous descriptor which offsets are ok to
            // overwrite, so shift by our circular IB size
            self.queue.update_next_bytes_read(
                in_port.peer_guid,
                in_port.peer_port_idx,
                offset + in_port.ib_size,
                inc_amt,
            );
        }
    }

    /// Output-side completion: bytes `[offset, offset+size)` of port
    /// `port_idx` have been fully written.
    pub fn update_bytes_write(self: &Arc<Self>, port_idx: usize, offset: usize, size: usize) {
        let out_port = &self.output_ports[port_idx];
        let inc_amt = out_port.seq_local.add_span(offset, size);
        tracing::trace!(xd = ?self.guid, port = port_idx, offset, size, inc_amt, "bytes_write");
        // if our oldest write was just ack'd, the descriptor may only be
        // waiting for writes to drain
        if inc_amt > 0 {
            self.update_progress();
        }
        if out_port.peer_guid != XFERDES_NO_GUID {
            // reveal the total if it's known and not yet sent
            if out_port.needs_pbt_update.load(Ordering::Acquire)
                && self.iteration_completed.load(Ordering::Acquire)
                && out_port.needs_pbt_update.swap(false, Ordering::AcqRel)
            {
                self.queue.update_pre_bytes_total(
                    out_port.peer_guid,
                    out_port.peer_port_idx,
                    out_port.local_bytes_total.load(Ordering::Acquire),
                );
            }
            if inc_amt > 0 && !self.inline_pre_bytes_write {
                self.queue.update_pre_bytes_write(
                    out_port.peer_guid,
                    out_port.peer_port_idx,
                    offset,
                    inc_amt,
                );
            }
        }
    }

    /// Producer reported new bytes available on input port `port_idx`.
    pub fn update_pre_bytes_write(self: &Arc<Self>, port_idx: usize, offset: usize, size: usize) {
        let in_port = &self.input_ports[port_idx];
        let inc_amt = in_port.seq_remote.add_span(offset, size);
        tracing::trace!(xd = ?self.guid, port = port_idx, offset, size, inc_amt, "pre_write");
        if inc_amt > 0 {
            self.update_progress();
        }
    }

    /// Producer revealed the final byte count of input port `port_idx`.
    pub fn update_pre_bytes_total(self: &Arc<Self>, port_idx: usize, pre_bytes_total: usize) {
        let in_port = &self.input_ports[port_idx];
        let oldval = in_port
            .remote_bytes_total
            .swap(pre_bytes_total, Ordering::AcqRel);
        debug_assert!(oldval == XferPort::TOTAL_UNKNOWN && pre_bytes_total != XferPort::TOTAL_UNKNOWN);
        tracing::trace!(xd = ?self.guid, port = port_idx, pre_bytes_total, "pre_total");
        // this may unblock a descriptor that consumed all input but didn't
        // know there was no more
        self.update_progress();
    }

    /// Consumer reported IB slots freed on output port `port_idx`.
    pub fn update_next_bytes_read(self: &Arc<Self>, port_idx: usize, offset: usize, size: usize) {
        let out_port = &self.output_ports[port_idx];
        let inc_amt = out_port.seq_remote.add_span(offset, size);
        tracing::trace!(xd = ?self.guid, port = port_idx, offset, size, inc_amt, "next_read");
        if inc_amt > 0 {
            self.update_progress();
        }
    }

    /// Default read-side completion callback for request channels.
    pub fn default_notify_request_read_done(self: &Arc<Self>, req: &Request) {
        self.update_bytes_read(req.src_port_idx, req.read_seq_pos, req.read_seq_count);
    }

    /// Default write-side completion callback for request channels. Returns
    /// the request slot to the pool.
    pub fn default_notify_request_write_done(self: &Arc<Self>, req: &Request) {
        self.update_bytes_write(req.dst_port_idx, req.write_seq_pos, req.write_seq_count);
        self.enqueue_request_slot();
        self.update_progress();
    }

    // ------------------------------------------------------------------
    // control streams

    /// Pull control words if either control state ran out. Returns the
    /// number of bytes the controls allow right now (0 = no work / done).
    pub fn update_control_info(
        self: &Arc<Self>,
        prog: &mut XdProgress,
        rseqcache: &mut SequenceCache,
    ) -> usize {
        if prog.input_control.remaining_count == 0 {
            let idx = prog
                .input_control
                .control_port_idx
                .expect("count exhausted without a control port");
            let Some(word) = self.read_control_word(prog, idx, rseqcache) else {
                return 0;
            };
            prog.input_control.remaining_count = word.count();
            prog.input_control.current_io_port = word.port();
            prog.input_control.eos_received = word.eos();
            tracing::debug!(xd = ?self.guid, port = ?word.port(), count = word.count(),
                            eos = word.eos(), "input control");
            if prog.input_control.remaining_count == 0 {
                assert!(prog.input_control.eos_received);
                self.iteration_completed.store(true, Ordering::Release);
                return 0;
            }
        }

        if prog.output_control.remaining_count == 0 {
            // the port that controls the output is still an input port
            let idx = prog
                .output_control
                .control_port_idx
                .expect("count exhausted without a control port");
            let Some(word) = self.read_control_word(prog, idx, rseqcache) else {
                return 0;
            };
            assert!(word.0 != 0);
            prog.output_control.remaining_count = word.count();
            prog.output_control.current_io_port = word.port();
            prog.output_control.eos_received = word.eos();
            tracing::debug!(xd = ?self.guid, port = ?word.port(), count = word.count(),
                            eos = word.eos(), "output control");
            if prog.output_control.remaining_count == 0 {
                assert!(prog.output_control.eos_received);
                self.iteration_completed.store(true, Ordering::Release);
                // give every output a chance to signal completion downstream
                self.notify_all_outputs(None);
                return 0;
            }
        }

        prog.input_control
            .remaining_count
            .min(prog.output_control.remaining_count)
    }

    fn read_control_word(
        self: &Arc<Self>,
        prog: &mut XdProgress,
        port_idx: usize,
        rseqcache: &mut SequenceCache,
    ) -> Option<ControlWord> {
        let cp = &self.input_ports[port_idx];
        let lbt = cp.local_bytes_total.load(Ordering::Acquire);
        let avail = cp.seq_remote.span_exists(lbt, ControlWord::BYTES);
        if avail < ControlWord::BYTES {
            return None;
        }
        let mut info = AddressInfo::default();
        let amt = prog.inputs[port_idx].iter.step(
            ControlWord::BYTES,
            &mut info,
            crate::iterator::StepFlags::LINEAR,
            false,
        );
        assert_eq!(amt, ControlWord::BYTES, "control word split by IB wrap");
        let mem = cp.mem.as_ref().expect("control port without memory");
        let src = mem
            .get_direct_ptr(info.base_offset, amt)
            .expect("control IB must be host-mapped");
        let mut raw = [0u8; ControlWord::BYTES];
        unsafe { std::ptr::copy_nonoverlapping(src, raw.as_mut_ptr(), ControlWord::BYTES) };
        rseqcache.add_span(self, Some(port_idx), lbt, ControlWord::BYTES);
        cp.local_bytes_total
            .store(lbt + ControlWord::BYTES, Ordering::Release);
        Some(ControlWord(u32::from_le_bytes(raw)))
    }

    /// Finish the iteration from a channel-specific request path and tell
    /// every successor.
    pub fn set_iteration_completed_and_notify(self: &Arc<Self>) {
        self.iteration_completed.store(true, Ordering::Release);
        self.notify_all_outputs(None);
    }

    /// Zero-sized write notification to all output ports (except `skip`) so
    /// successors learn about completion.
    fn notify_all_outputs(self: &Arc<Self>, skip: Option<usize>) {
        for i in 0..self.output_ports.len() {
            if Some(i) == skip {
                continue;
            }
            let lbt = self.output_ports[i].local_bytes_total.load(Ordering::Acquire);
            self.update_bytes_write(i, lbt, 0);
        }
    }

    // ------------------------------------------------------------------
    // address planning (cursor path)

    /// Refill address lists and compute how many bytes can move right now,
    /// honoring flow control on both sides. Returns 0 when nothing can be
    /// done yet (or the iteration just completed).
    pub fn get_addresses(
        self: &Arc<Self>,
        prog: &mut XdProgress,
        mut min_xfer_size: usize,
        rseqcache: &mut SequenceCache,
    ) -> usize {
        let control_count = self.update_control_info(prog, rseqcache);
        if control_count == 0 {
            return 0;
        }
        min_xfer_size = min_xfer_size.min(control_count);
        let mut max_bytes = control_count;

        // addresses for the input, if it exists
        if let Some(idx) = prog.input_control.current_io_port {
            let in_port = &self.input_ports[idx];
            let in_prog = &mut prog.inputs[idx];

            let mut read_bytes_avail = in_prog.addrlist.bytes_pending();
            if read_bytes_avail < min_xfer_size {
                if in_prog.iter.get_addresses(&mut in_prog.addrlist) {
                    // iterator asked for a flush
                    min_xfer_size = min_xfer_size.min(in_prog.addrlist.bytes_pending());
                }
                read_bytes_avail = in_prog.addrlist.bytes_pending();
            }

            // if we're not the first in the chain, respect flow control too
            if in_port.peer_guid != XFERDES_NO_GUID {
                let lbt = in_port.local_bytes_total.load(Ordering::Acquire);
                read_bytes_avail = in_port.seq_remote.span_exists(lbt, read_bytes_avail);
                let pbt = in_port.remote_bytes_total.load(Ordering::Acquire);
                let pbt_limit = pbt.saturating_sub(lbt);
                min_xfer_size = min_xfer_size.min(pbt_limit);
            }

            // we'd like min_xfer_size bytes, but fork-join gathers can't
            // guarantee that much will ever arrive at once - move what we
            // have
            if read_bytes_avail > 0 && read_bytes_avail < min_xfer_size {
                min_xfer_size = read_bytes_avail;
            }

            max_bytes = max_bytes.min(read_bytes_avail);
        }

        // addresses for the output, if it exists
        if let Some(idx) = prog.output_control.current_io_port {
            let out_port = &self.output_ports[idx];
            let out_prog = &mut prog.outputs[idx];

            let mut write_bytes_avail = out_prog.addrlist.bytes_pending();
            if write_bytes_avail < min_xfer_size {
                if out_prog.iter.get_addresses(&mut out_prog.addrlist) {
                    min_xfer_size = min_xfer_size.min(out_prog.addrlist.bytes_pending());
                }
                write_bytes_avail = out_prog.addrlist.bytes_pending();
            }

            // if we're not the last in the chain, respect flow control too
            if out_port.peer_guid != XFERDES_NO_GUID {
                let lbt = out_port.local_bytes_total.load(Ordering::Acquire);
                write_bytes_avail = out_port.seq_remote.span_exists(lbt, write_bytes_avail);
            }

            max_bytes = max_bytes.min(write_bytes_avail);
        }

        if min_xfer_size == 0 {
            // only possible in the absence of control ports
            assert!(
                prog.input_control.control_port_idx.is_none()
                    && prog.output_control.control_port_idx.is_none()
            );
            self.iteration_completed.store(true, Ordering::Release);
            return 0;
        }

        // if we don't have a big enough chunk, wait for more to show up
        if max_bytes < min_xfer_size {
            return 0;
        }

        max_bytes
    }

    /// Account for bytes just consumed on the current i/o ports; decides
    /// whether the iteration completed. Notifies outputs on completion.
    pub fn record_address_consumption(
        self: &Arc<Self>,
        prog: &mut XdProgress,
        total_bytes: usize,
    ) -> bool {
        let mut in_done = false;
        if let Some(idx) = prog.input_control.current_io_port {
            let in_port = &self.input_ports[idx];
            let in_prog = &prog.inputs[idx];

            let lbt = in_port.local_bytes_total.load(Ordering::Acquire) + total_bytes;
            in_port.local_bytes_total.store(lbt, Ordering::Release);
            in_port.local_bytes_cons.fetch_add(total_bytes, Ordering::AcqRel);

            in_done = if in_port.peer_guid == XFERDES_NO_GUID {
                in_prog.addrlist.bytes_pending() == 0 && in_prog.iter.done()
            } else {
                lbt == in_port.remote_bytes_total.load(Ordering::Acquire)
            };
        }

        let mut out_done = false;
        if let Some(idx) = prog.output_control.current_io_port {
            let out_port = &self.output_ports[idx];
            let out_prog = &prog.outputs[idx];

            let lbt = out_port.local_bytes_total.load(Ordering::Acquire) + total_bytes;
            out_port.local_bytes_total.store(lbt, Ordering::Release);
            out_port.local_bytes_cons.fetch_add(total_bytes, Ordering::AcqRel);

            if out_port.peer_guid == XFERDES_NO_GUID {
                out_done = out_prog.addrlist.bytes_pending() == 0 && out_prog.iter.done();
            }
        }

        prog.input_control.remaining_count =
            prog.input_control.remaining_count.saturating_sub(total_bytes);
        prog.output_control.remaining_count =
            prog.output_control.remaining_count.saturating_sub(total_bytes);

        // control ports override our notion of done-ness
        if prog.input_control.control_port_idx.is_some() {
            in_done = prog.input_control.remaining_count == 0 && prog.input_control.eos_received;
        }
        if prog.output_control.control_port_idx.is_some() {
            out_done = prog.output_control.remaining_count == 0 && prog.output_control.eos_received;
        }

        if in_done || out_done {
            self.iteration_completed.store(true, Ordering::Release);
            self.notify_all_outputs(None);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // request generation (request path)

    /// Generate up to `max_requests` channel requests, handling control
    /// streams, gather/scatter skips, serdez planning, flow control, and
    /// dimension reconciliation.
    pub fn default_get_requests(
        self: &Arc<Self>,
        prog: &mut XdProgress,
        max_requests: usize,
        flags: RequestFlags,
    ) -> Vec<Request> {
        let mut reqs = Vec::new();
        let mut scratch_cache = SequenceCache::read(0);

        'next_req: while reqs.len() < max_requests && self.request_available() {
            if self.iteration_completed.load(Ordering::Acquire) {
                break;
            }

            // pull control information if we need it
            if prog.input_control.remaining_count == 0 || prog.output_control.remaining_count == 0 {
                let avail = self.update_control_info(prog, &mut scratch_cache);
                scratch_cache.flush(self);
                if avail == 0 {
                    break;
                }
            }

            let in_idx = prog.input_control.current_io_port;
            let out_idx = prog.output_control.current_io_port;

            // special cases for out-of-range scatter/gather
            let (in_idx, out_idx) = match (in_idx, out_idx) {
                (None, None) => {
                    let skipped = prog
                        .input_control
                        .remaining_count
                        .min(prog.output_control.remaining_count);
                    if self.consume_skip_counts(prog, skipped) {
                        break;
                    }
                    continue;
                }
                (None, Some(oi)) => {
                    // no valid input: step the output iterator without
                    // writing. only legal for a real (non-IB, non-serdez)
                    // target
                    let out_port = &self.output_ports[oi];
                    assert!(
                        out_port.peer_guid == XFERDES_NO_GUID && out_port.serdez_op.is_none(),
                        "gather skip into an IB or serdez output"
                    );
                    let max_skip = prog
                        .input_control
                        .remaining_count
                        .min(prog.output_control.remaining_count);
                    let mut dummy = AddressInfo::default();
                    let skip_bytes =
                        prog.outputs[oi]
                            .iter
                            .step(max_skip, &mut dummy, flags.dst, false);
                    tracing::debug!(xd = ?self.guid, skip_bytes, "skipping output bytes");
                    assert!(skip_bytes > 0);
                    if self.consume_skip_counts(prog, skip_bytes) {
                        break;
                    }
                    continue;
                }
                (Some(ii), None) => {
                    // valid input we must throw away. we still wait for the
                    // data to exist to avoid write-after-write races on the
                    // producer side
                    let in_port = &self.input_ports[ii];
                    assert!(in_port.serdez_op.is_none());
                    let mut skip_bytes = prog
                        .input_control
                        .remaining_count
                        .min(prog.output_control.remaining_count);
                    if in_port.peer_guid != XFERDES_NO_GUID {
                        let lbt = in_port.local_bytes_total.load(Ordering::Acquire);
                        skip_bytes = in_port.seq_remote.span_exists(lbt, skip_bytes);
                        if skip_bytes == 0 {
                            break;
                        }
                    }
                    let mut dummy = AddressInfo::default();
                    let skip_bytes =
                        prog.inputs[ii]
                            .iter
                            .step(skip_bytes, &mut dummy, flags.src, false);
                    tracing::debug!(xd = ?self.guid, skip_bytes, "skipping input bytes");
                    assert!(skip_bytes > 0);
                    let lbt = in_port.local_bytes_total.load(Ordering::Acquire);
                    self.update_bytes_read(ii, lbt, skip_bytes);
                    in_port
                        .local_bytes_total
                        .store(lbt + skip_bytes, Ordering::Release);
                    if self.consume_skip_counts(prog, skip_bytes) {
                        break;
                    }
                    continue;
                }
                (Some(ii), Some(oi)) => (ii, oi),
            };

            let in_port = &self.input_ports[in_idx];
            let out_port = &self.output_ports[out_idx];

            // several counters change asynchronously to the logic below;
            // sample them once and adjust locally
            let mut pbt_snapshot = in_port.remote_bytes_total.load(Ordering::Acquire);
            let rbc_snapshot = in_port.local_bytes_cons.load(Ordering::Acquire);
            let wbc_snapshot = out_port.local_bytes_cons.load(Ordering::Acquire);

            // empty iterators and filtered streams may only reveal the end
            // of the transfer here
            let in_lbt = in_port.local_bytes_total.load(Ordering::Acquire);
            let input_exhausted = if in_port.peer_guid == XFERDES_NO_GUID {
                prog.inputs[in_idx].iter.done()
            } else {
                in_lbt == pbt_snapshot
            };
            if input_exhausted {
                if in_lbt == 0 {
                    tracing::debug!(xd = ?self.guid, "empty transfer");
                }
                self.iteration_completed.store(true, Ordering::Release);
                self.notify_all_outputs(None);
                break;
            }

            let has_src_serdez = in_port.serdez_op.is_some();
            let has_dst_serdez = out_port.serdez_op.is_some();

            let mut src_info = AddressInfo::default();
            let mut dst_info = AddressInfo::default();
            let read_seq;
            let write_seq;
            let read_bytes;
            let write_bytes;
            let mut read_pad_bytes = 0usize;
            let mut write_pad_bytes = 0usize;

            if has_src_serdez && !has_dst_serdez {
                // serialization only - must be into an IB; output space is
                // uncertain, so the destination steps later inside the
                // channel
                assert!(in_port.peer_guid == XFERDES_NO_GUID);
                assert!(out_port.peer_guid != XFERDES_NO_GUID);
                let op = in_port.serdez_op.as_ref().unwrap();
                let field_size = op.sizeof_field_type();
                let max_ser = op.max_serialized_size();

                // no room for even one worst-case element? try again later
                if out_port.seq_remote.span_exists(wbc_snapshot, max_ser) < max_ser {
                    break;
                }

                let in_prog = &mut prog.inputs[in_idx];
                let src_bytes =
                    in_prog
                        .iter
                        .step(self.max_req_size, &mut src_info, flags.src, true);
                let mut num_elems = src_bytes / field_size;
                if num_elems == 0 {
                    if src_bytes == 0 {
                        break;
                    }
                    in_prog.iter.cancel_step();
                    break;
                }
                assert_eq!(num_elems * field_size, src_bytes);
                let max_dst_bytes = num_elems * max_ser;

                // an output control restricts the element count
                if prog.output_control.control_port_idx.is_some()
                    && num_elems > prog.output_control.remaining_count
                {
                    tracing::debug!(xd = ?self.guid, from = num_elems,
                                    to = prog.output_control.remaining_count,
                                    "scatter/serialize clamp");
                    num_elems = prog.output_control.remaining_count;
                }

                let clamp_dst_bytes = num_elems * max_ser;
                let mut dst_bytes_avail =
                    out_port.seq_remote.span_exists(wbc_snapshot, clamp_dst_bytes);

                let mut src_bytes = src_bytes;
                if dst_bytes_avail == max_dst_bytes {
                    in_prog.iter.confirm_step();
                } else {
                    // shrink to the elements that are certain to fit
                    let act_elems = dst_bytes_avail / max_ser;
                    dst_bytes_avail = act_elems * max_ser;
                    let new_src_bytes = act_elems * field_size;
                    in_prog.iter.cancel_step();
                    src_bytes = in_prog.iter.step(new_src_bytes, &mut src_info, flags.src, false);
                    // a 2D/3D source may come up short; re-adjust
                    if src_bytes < new_src_bytes {
                        if src_bytes == 0 {
                            break;
                        }
                        let n = src_bytes / field_size;
                        assert_eq!(n * field_size, src_bytes);
                        dst_bytes_avail = n * max_ser;
                    }
                }

                // dst_info is a don't-care until the channel steps the
                // destination; mirror the source so lines/planes match
                dst_info = src_info;

                read_seq = in_port.local_bytes_total.load(Ordering::Acquire);
                read_bytes = src_bytes;
                in_port
                    .local_bytes_total
                    .store(read_seq + src_bytes, Ordering::Release);

                write_seq = 0; // filled in by the channel
                write_bytes = dst_bytes_avail;
                out_port
                    .local_bytes_cons
                    .fetch_add(dst_bytes_avail, Ordering::AcqRel);
            } else if !has_src_serdez && has_dst_serdez {
                // deserialization only - must be from an IB; input need per
                // element is uncertain, so the source steps later inside the
                // channel
                assert!(in_port.peer_guid != XFERDES_NO_GUID);
                assert!(out_port.peer_guid == XFERDES_NO_GUID);
                let op = out_port.serdez_op.as_ref().unwrap();
                let field_size = op.sizeof_field_type();
                let max_ser = op.max_serialized_size();

                // the input is done only if the limit is known AND every
                // remaining byte has arrived
                let mut input_data_done = pbt_snapshot != XferPort::TOTAL_UNKNOWN
                    && (rbc_snapshot >= pbt_snapshot
                        || in_port
                            .seq_remote
                            .span_exists(rbc_snapshot, pbt_snapshot - rbc_snapshot)
                            == pbt_snapshot - rbc_snapshot);
                // an input control mid-stream makes those checks imprecise
                if prog.input_control.control_port_idx.is_some()
                    && !prog.input_control.eos_received
                {
                    input_data_done = false;
                }

                if !input_data_done
                    && in_port.seq_remote.span_exists(rbc_snapshot, max_ser) < max_ser
                {
                    break;
                }

                let out_prog = &mut prog.outputs[out_idx];
                let mut dst_bytes = out_prog.iter.step(
                    self.max_req_size,
                    &mut dst_info,
                    flags.dst,
                    !input_data_done,
                );
                let mut num_elems = dst_bytes / field_size;
                if num_elems == 0 {
                    if dst_bytes > 0 && !input_data_done {
                        out_prog.iter.cancel_step();
                    }
                    break;
                }
                assert_eq!(num_elems * field_size, dst_bytes);
                let max_src_bytes = num_elems * max_ser;

                if prog.input_control.control_port_idx.is_some()
                    && num_elems > prog.input_control.remaining_count
                {
                    tracing::debug!(xd = ?self.guid, from = num_elems,
                                    to = prog.input_control.remaining_count,
                                    "gather/deserialize clamp");
                    num_elems = prog.input_control.remaining_count;
                }

                let clamp_src_bytes = num_elems * max_ser;
                let src_bytes_avail;
                if input_data_done {
                    // we certainly have all the remaining data; we won't
                    // overshoot unless the stream is corrupt
                    src_bytes_avail = max_src_bytes;
                } else {
                    let avail = in_port.seq_remote.span_exists(rbc_snapshot, clamp_src_bytes);
                    if avail == max_src_bytes {
                        out_prog.iter.confirm_step();
                        src_bytes_avail = avail;
                    } else {
                        tracing::debug!(xd = ?self.guid, from = max_src_bytes, to = avail,
                                        "pred limits deserialize");
                        let act_elems = avail / max_ser;
                        let mut avail = act_elems * max_ser;
                        let new_dst_bytes = act_elems * field_size;
                        out_prog.iter.cancel_step();
                        dst_bytes =
                            out_prog.iter.step(new_dst_bytes, &mut dst_info, flags.dst, false);
                        if dst_bytes < new_dst_bytes {
                            if dst_bytes == 0 {
                                break;
                            }
                            let n = dst_bytes / field_size;
                            assert_eq!(n * field_size, dst_bytes);
                            avail = n * max_ser;
                        }
                        src_bytes_avail = avail;
                    }
                }

                // src_info is a don't-care until the channel steps the
                // source
                src_info = dst_info.clone();

                read_seq = 0; // filled in by the channel
                read_bytes = src_bytes_avail;
                in_port
                    .local_bytes_cons
                    .fetch_add(src_bytes_avail, Ordering::AcqRel);

                write_seq = out_port.local_bytes_total.load(Ordering::Acquire);
                write_bytes = dst_bytes;
                let new_lbt = write_seq + dst_bytes;
                out_port.local_bytes_total.store(new_lbt, Ordering::Release);
                // completion detection uses the conservative count
                out_port.local_bytes_cons.store(new_lbt, Ordering::Release);
            } else {
                // no serdez (simultaneous serdez is refused at path
                // registration)
                assert!(!(has_src_serdez && has_dst_serdez));

                let mut max_bytes = self.max_req_size.min(
                    prog.input_control
                        .remaining_count
                        .min(prog.output_control.remaining_count),
                );

                // don't exceed the predecessor's revealed total
                if in_port.peer_guid != XFERDES_NO_GUID {
                    let pre_max = pbt_snapshot - in_lbt;
                    if pre_max == 0 {
                        // handled by the exhaustion check above
                        unreachable!("stale pre_bytes_total snapshot");
                    }
                    if pre_max < max_bytes {
                        tracing::debug!(xd = ?self.guid, from = max_bytes, to = pre_max,
                                        "pred limits xfer");
                        max_bytes = pre_max;
                    }
                    max_bytes = in_port.seq_remote.span_exists(in_lbt, max_bytes);
                    if max_bytes == 0 {
                        break;
                    }
                }

                if out_port.peer_guid != XFERDES_NO_GUID {
                    // don't overwrite IB data that hasn't been read yet
                    let out_lbt = out_port.local_bytes_total.load(Ordering::Acquire);
                    max_bytes = out_port.seq_remote.span_exists(out_lbt, max_bytes);
                    if max_bytes == 0 {
                        break;
                    }
                }

                // tentatively take as much as we can from the source
                let mut src_bytes =
                    prog.inputs[in_idx]
                        .iter
                        .step(max_bytes, &mut src_info, flags.src, true);
                if src_bytes == 0 {
                    break;
                }

                // the destination step must stay tentative whenever the two
                // sides might collapse dimensions differently
                let mut dimension_mismatch_possible = (in_port.peer_guid == XFERDES_NO_GUID
                    || out_port.peer_guid == XFERDES_NO_GUID)
                    && flags.any_lines();

                let mut dst_bytes = prog.outputs[out_idx].iter.step(
                    src_bytes,
                    &mut dst_info,
                    flags.dst,
                    dimension_mismatch_possible,
                );
                if dst_bytes == 0 {
                    // an IB input collapsing against a non-IB output needs
                    // padding on the input side
                    if in_port.peer_guid != XFERDES_NO_GUID
                        && out_port.peer_guid == XFERDES_NO_GUID
                        && src_bytes < max_bytes
                    {
                        tracing::debug!(xd = ?self.guid, src_bytes, "padding input buffer");
                        src_info = AddressInfo::default();
                        src_info.num_lines = 1;
                        src_info.num_planes = 1;
                        dst_info = src_info;
                        read_pad_bytes = src_bytes;
                        src_bytes = 0;
                        dimension_mismatch_possible = false;
                        prog.inputs[in_idx].iter.confirm_step();
                    } else {
                        prog.inputs[in_idx].iter.cancel_step();
                        break;
                    }
                }

                // does the source now need to shrink?
                if dst_bytes < src_bytes && src_bytes > 0 {
                    prog.inputs[in_idx].iter.cancel_step();
                    src_bytes = prog.inputs[in_idx].iter.step(
                        dst_bytes,
                        &mut src_info,
                        flags.src,
                        dimension_mismatch_possible,
                    );
                    if src_bytes == 0 {
                        // corner case: a destination IB wants padding to its
                        // boundary
                        assert!(
                            in_port.peer_guid == XFERDES_NO_GUID
                                && out_port.peer_guid != XFERDES_NO_GUID
                        );
                        if dst_bytes < max_bytes {
                            tracing::debug!(xd = ?self.guid, dst_bytes, "padding output buffer");
                            src_info = AddressInfo::default();
                            src_info.num_lines = 1;
                            src_info.num_planes = 1;
                            dst_info = src_info;
                            write_pad_bytes = dst_bytes;
                            dst_bytes = 0;
                            dimension_mismatch_possible = false;
                            prog.outputs[out_idx].iter.confirm_step();
                        } else {
                            prog.outputs[out_idx].iter.cancel_step();
                            break;
                        }
                    }
                    // still possible if the source is 2+D and the
                    // destination stopped mid-span
                    if src_bytes < dst_bytes {
                        assert!(dimension_mismatch_possible);
                        prog.outputs[out_idx].iter.cancel_step();
                        dst_bytes = prog.outputs[out_idx].iter.step(
                            src_bytes,
                            &mut dst_info,
                            flags.dst,
                            true,
                        );
                    }
                    assert_eq!(src_bytes, dst_bytes);
                } else if !dimension_mismatch_possible {
                    // no mismatch possible - safe to confirm now
                    prog.inputs[in_idx].iter.confirm_step();
                }

                if !dimension_mismatch_possible {
                    assert_eq!(src_info.bytes_per_chunk, dst_info.bytes_per_chunk);
                    assert_eq!(src_info.num_lines, 1);
                    assert_eq!(src_info.num_planes, 1);
                    assert_eq!(dst_info.num_lines, 1);
                    assert_eq!(dst_info.num_planes, 1);
                } else {
                    reconcile_dimensions(&mut src_info, &mut dst_info, flags);

                    // if reconciliation shrank the transfer, cancel and
                    // re-step both sides at the reduced size
                    let act_bytes =
                        src_info.bytes_per_chunk * src_info.num_lines * src_info.num_planes;
                    if act_bytes == src_bytes {
                        prog.inputs[in_idx].iter.confirm_step();
                        prog.outputs[out_idx].iter.confirm_step();
                    } else {
                        let mut dummy = AddressInfo::default();
                        prog.inputs[in_idx].iter.cancel_step();
                        let sb = prog.inputs[in_idx]
                            .iter
                            .step(act_bytes, &mut dummy, flags.src, false);
                        assert_eq!(sb, act_bytes);
                        prog.outputs[out_idx].iter.cancel_step();
                        let db = prog.outputs[out_idx]
                            .iter
                            .step(act_bytes, &mut dummy, flags.dst, false);
                        assert_eq!(db, act_bytes);
                    }
                }

                let act_bytes = src_info.bytes_per_chunk * src_info.num_lines * src_info.num_planes;

                read_seq = in_lbt;
                read_bytes = act_bytes + read_pad_bytes;
                // bytes read don't advance for indirection sources
                if in_port.indirect_port_idx.is_none() {
                    in_port
                        .local_bytes_total
                        .store(in_lbt + read_bytes, Ordering::Release);
                }

                let out_lbt = out_port.local_bytes_total.load(Ordering::Acquire);
                write_seq = out_lbt;
                write_bytes = act_bytes + write_pad_bytes;
                let new_out_lbt = out_lbt + write_bytes;
                out_port
                    .local_bytes_total
                    .store(new_out_lbt, Ordering::Release);
                out_port
                    .local_bytes_cons
                    .store(new_out_lbt, Ordering::Release);
            }

            if !self.take_request_slot() {
                // shouldn't happen (request_available checked above), but a
                // racing return can only add slots
                unreachable!("request pool underflow");
            }

            let new_req = Request {
                xd: self.clone(),
                src_port_idx: in_idx,
                dst_port_idx: out_idx,
                read_seq_pos: read_seq,
                read_seq_count: read_bytes,
                write_seq_pos: write_seq,
                write_seq_count: write_bytes,
                dim: if src_info.num_planes == 1 {
                    if src_info.num_lines == 1 {
                        RequestDim::D1
                    } else {
                        RequestDim::D2
                    }
                } else {
                    RequestDim::D3
                },
                src_off: src_info.base_offset,
                dst_off: dst_info.base_offset,
                nbytes: src_info.bytes_per_chunk,
                nlines: src_info.num_lines.max(1),
                src_str: src_info.line_stride,
                dst_str: dst_info.line_stride,
                nplanes: src_info.num_planes.max(1),
                src_pstr: src_info.plane_stride,
                dst_pstr: dst_info.plane_stride,
            };

            // the seq_remote updates are asynchronous, so resample the total
            // before the completion checks below
            if in_port.peer_guid != XFERDES_NO_GUID && pbt_snapshot == XferPort::TOTAL_UNKNOWN {
                pbt_snapshot = in_port.remote_bytes_total.load(Ordering::Acquire);
            }

            let mut iteration_done = false;
            if prog.input_control.control_port_idx.is_some()
                || prog.output_control.control_port_idx.is_some()
            {
                // control ports count in elements when a serdez op is
                // involved
                let mut input_count = read_bytes - read_pad_bytes;
                let mut output_count = write_bytes - write_pad_bytes;
                if let Some(op) = in_port.serdez_op.as_ref() {
                    assert_eq!(output_count % op.max_serialized_size(), 0);
                    output_count /= op.max_serialized_size();
                }
                if let Some(op) = out_port.serdez_op.as_ref() {
                    assert_eq!(input_count % op.max_serialized_size(), 0);
                    input_count /= op.max_serialized_size();
                }
                assert!(prog.input_control.remaining_count >= input_count);
                assert!(prog.output_control.remaining_count >= output_count);
                prog.input_control.remaining_count -= input_count;
                prog.output_control.remaining_count -= output_count;
                if (prog.input_control.remaining_count == 0 && prog.input_control.eos_received)
                    || (prog.output_control.remaining_count == 0
                        && prog.output_control.eos_received)
                {
                    tracing::debug!(xd = ?self.guid, "iteration completed via control port");
                    iteration_done = true;
                }
            } else {
                // otherwise our iterators tell us
                let in_lbt = in_port.local_bytes_total.load(Ordering::Acquire);
                if prog.inputs[in_idx].iter.done()
                    || prog.outputs[out_idx].iter.done()
                    || in_lbt == pbt_snapshot
                {
                    iteration_done = true;
                }
            }

            if iteration_done {
                self.iteration_completed.store(true, Ordering::Release);
                self.notify_all_outputs(Some(out_idx));
            }

            tracing::trace!(req = ?new_req, "generated request");
            reqs.push(new_req);

            if iteration_done {
                break 'next_req;
            }
        }

        reqs
    }

    /// Subtract skipped bytes from both control counts; true means the
    /// iteration completed.
    fn consume_skip_counts(self: &Arc<Self>, prog: &mut XdProgress, bytes: usize) -> bool {
        prog.input_control.remaining_count =
            prog.input_control.remaining_count.saturating_sub(bytes);
        prog.output_control.remaining_count =
            prog.output_control.remaining_count.saturating_sub(bytes);
        if (prog.input_control.remaining_count == 0 && prog.input_control.eos_received)
            || (prog.output_control.remaining_count == 0 && prog.output_control.eos_received)
        {
            tracing::debug!(xd = ?self.guid, "iteration completed via control port");
            self.iteration_completed.store(true, Ordering::Release);
            self.notify_all_outputs(None);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // completion

    /// A descriptor is complete when the iteration finished, every output
    /// peer has been told its final byte count, and every output's writes
    /// are fully acknowledged.
    pub fn is_completed(self: &Arc<Self>) -> bool {
        if self.transfer_completed.load(Ordering::Acquire) {
            return true;
        }
        if !self.iteration_completed.load(Ordering::Acquire) {
            return false;
        }
        for out_port in &self.output_ports {
            // send the total bytes if still owed
            if out_port.needs_pbt_update.load(Ordering::Acquire) {
                debug_assert!(out_port.peer_guid != XFERDES_NO_GUID);
                if out_port.needs_pbt_update.swap(false, Ordering::AcqRel) {
                    self.queue.update_pre_bytes_total(
                        out_port.peer_guid,
                        out_port.peer_port_idx,
                        out_port.local_bytes_total.load(Ordering::Acquire),
                    );
                }
            }
            // the conservative write count guards serializing descriptors
            let lbc_snapshot = out_port.local_bytes_cons.load(Ordering::Acquire);
            if out_port.seq_local.span_exists(0, lbc_snapshot) != lbc_snapshot {
                return false;
            }
        }
        self.transfer_completed.store(true, Ordering::Release);
        true
    }

    /// Free IB holdings, flush the channel, and report to the launch node.
    /// Idempotent.
    pub fn mark_completed(self: &Arc<Self>) {
        if self.completion_done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.flush_xd(self);
        for ib in &self.input_ibs {
            self.queue.free_ib(*ib);
        }
        let success = !self.transfer_failed.load(Ordering::Acquire);
        tracing::debug!(xd = ?self.guid, success, "transfer descriptor complete");
        self.queue.mark_fence(self.fence, success);
    }
}

impl std::fmt::Debug for XferDes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XferDes")
            .field("guid", &self.guid)
            .field("kind", &self.kind)
            .field("iteration_completed", &self.iteration_completed)
            .field("transfer_completed", &self.transfer_completed)
            .finish()
    }
}

/// Batches sequence-assembler acknowledgements so hot loops don't send one
/// update per chunk. Adjacent spans per port are merged; everything flushes
/// past a byte threshold and at the end of a progress call.
pub struct SequenceCache {
    is_write: bool,
    threshold: usize,
    accumulated: usize,
    entries: [Option<(usize, usize, usize)>; Self::MAX_ENTRIES],
}

impl SequenceCache {
    const MAX_ENTRIES: usize = 4;

    pub fn read(threshold: usize) -> Self {
        Self {
            is_write: false,
            threshold,
            accumulated: 0,
            entries: [None; Self::MAX_ENTRIES],
        }
    }

    pub fn write(threshold: usize) -> Self {
        Self {
            is_write: true,
            threshold,
            accumulated: 0,
            entries: [None; Self::MAX_ENTRIES],
        }
    }

    pub fn add_span(&mut self, xd: &Arc<XferDes>, port: Option<usize>, start: usize, size: usize) {
        let Some(port) = port else { return };
        if size == 0 {
            return;
        }
        self.accumulated += size;
        let mut free_slot = None;
        let mut merged = false;
        for (i, e) in self.entries.iter_mut().enumerate() {
            match e {
                Some((p, s, len)) if *p == port && *s + *len == start => {
                    *len += size;
                    merged = true;
                    break;
                }
                None if free_slot.is_none() => free_slot = Some(i),
                _ => {}
            }
        }
        if !merged {
            match free_slot {
                Some(i) => self.entries[i] = Some((port, start, size)),
                None => {
                    // full: flush everything, then record
                    self.flush(xd);
                    self.entries[0] = Some((port, start, size));
                    self.accumulated = size;
                }
            }
        }
        if self.accumulated > self.threshold {
            self.flush(xd);
        }
    }

    pub fn flush(&mut self, xd: &Arc<XferDes>) {
        for e in self.entries.iter_mut() {
            if let Some((port, start, size)) = e.take() {
                if self.is_write {
                    xd.update_bytes_write(port, start, size);
                } else {
                    xd.update_bytes_read(port, start, size);
                }
            }
        }
        self.accumulated = 0;
    }
}

/// When 2D transfers are allowed the two sides can disagree on
/// `bytes_per_chunk` or line counts; split the coarser side until both march
/// in lockstep. The transformation can grow the dimensionality - the
/// emergent 4th dimension is clamped by matching planes on both sides.
pub(crate) fn reconcile_dimensions(
    src_info: &mut AddressInfo,
    dst_info: &mut AddressInfo,
    flags: RequestFlags,
) {
    let mut src_4d_factor = 1usize;
    let mut dst_4d_factor = 1usize;

    if src_info.bytes_per_chunk < dst_info.bytes_per_chunk {
        let ratio = dst_info.bytes_per_chunk / src_info.bytes_per_chunk;
        assert_eq!(src_info.bytes_per_chunk * ratio, dst_info.bytes_per_chunk);
        dst_4d_factor *= dst_info.num_planes; // existing planes lost
        dst_info.num_planes = dst_info.num_lines;
        dst_info.plane_stride = dst_info.line_stride;
        dst_info.num_lines = ratio;
        dst_info.line_stride = src_info.bytes_per_chunk;
        dst_info.bytes_per_chunk = src_info.bytes_per_chunk;
    }
    if dst_info.bytes_per_chunk < src_info.bytes_per_chunk {
        let ratio = src_info.bytes_per_chunk / dst_info.bytes_per_chunk;
        assert_eq!(dst_info.bytes_per_chunk * ratio, src_info.bytes_per_chunk);
        src_4d_factor *= src_info.num_planes;
        src_info.num_planes = src_info.num_lines;
        src_info.plane_stride = src_info.line_stride;
        src_info.num_lines = ratio;
        src_info.line_stride = dst_info.bytes_per_chunk;
        src_info.bytes_per_chunk = dst_info.bytes_per_chunk;
    }

    // similarly promote 2D to 3D if the line counts disagree
    if src_info.num_lines < dst_info.num_lines {
        let ratio = dst_info.num_lines / src_info.num_lines;
        assert_eq!(src_info.num_lines * ratio, dst_info.num_lines);
        dst_4d_factor *= dst_info.num_planes;
        dst_info.num_planes = ratio;
        dst_info.plane_stride = dst_info.line_stride * src_info.num_lines;
        dst_info.num_lines = src_info.num_lines;
    }
    if dst_info.num_lines < src_info.num_lines {
        let ratio = src_info.num_lines / dst_info.num_lines;
        assert_eq!(dst_info.num_lines * ratio, src_info.num_lines);
        src_4d_factor *= src_info.num_planes;
        src_info.num_planes = ratio;
        src_info.plane_stride = src_info.line_stride * dst_info.num_lines;
        src_info.num_lines = dst_info.num_lines;
    }

    assert_eq!(src_info.num_lines, dst_info.num_lines);
    assert_eq!(
        src_info.num_planes * src_4d_factor,
        dst_info.num_planes * dst_4d_factor
    );
    assert!(src_info.num_lines > 1 || src_info.num_planes == 1);
    assert!(dst_info.num_lines > 1 || dst_info.num_planes == 1);

    // only as many planes as both sides can manage
    if src_info.num_planes > dst_info.num_planes {
        src_info.num_planes = dst_info.num_planes;
    } else {
        dst_info.num_planes = src_info.num_planes;
    }

    // if 3D isn't allowed, fall back to one plane
    if !flags.any_planes() {
        src_info.num_planes = 1;
        dst_info.num_planes = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_packing() {
        let id = XferDesId::new(3, 0x1234_5678);
        assert_eq!(id.owner_node(), 3);
        assert_ne!(id, XFERDES_NO_GUID);
    }

    #[test]
    fn test_reconcile_3d_source_into_1d_destination() {
        // 2 planes x 4 lines x 16 bytes against a flat 128-byte destination
        let mut src = AddressInfo {
            base_offset: 0,
            bytes_per_chunk: 16,
            num_lines: 4,
            line_stride: 64,
            num_planes: 2,
            plane_stride: 1024,
        };
        let mut dst = AddressInfo {
            base_offset: 0,
            bytes_per_chunk: 128,
            num_lines: 1,
            line_stride: 0,
            num_planes: 1,
            plane_stride: 0,
        };
        reconcile_dimensions(&mut src, &mut dst, RequestFlags::FULL);

        // the destination flattened into matching lines and planes, with
        // line stride equal to the common chunk
        assert_eq!(dst.bytes_per_chunk, 16);
        assert_eq!(dst.num_lines, 4);
        assert_eq!(dst.line_stride, 16);
        assert_eq!(dst.num_planes, 2);
        assert_eq!(dst.plane_stride, 64);
        assert_eq!(src.total_bytes(), dst.total_bytes());
        assert_eq!(src.total_bytes(), 128);
    }

    #[test]
    fn test_reconcile_line_mismatch_promotes_planes() {
        // same chunk size and total, 8 source lines vs 2x4 destination
        let mut src = AddressInfo {
            base_offset: 0,
            bytes_per_chunk: 32,
            num_lines: 8,
            line_stride: 100,
            num_planes: 1,
            plane_stride: 0,
        };
        let mut dst = AddressInfo {
            base_offset: 0,
            bytes_per_chunk: 32,
            num_lines: 2,
            line_stride: 32,
            num_planes: 4,
            plane_stride: 64,
        };
        reconcile_dimensions(&mut src, &mut dst, RequestFlags::FULL);
        // the extra source lines became planes matching the destination
        assert_eq!(src.num_lines, 2);
        assert_eq!(src.num_planes, 4);
        assert_eq!(src.plane_stride, 200);
        assert_eq!(src.total_bytes(), dst.total_bytes());
    }

    #[test]
    fn test_reconcile_planes_clamped_without_3d() {
        let mut src = AddressInfo {
            base_offset: 0,
            bytes_per_chunk: 8,
            num_lines: 4,
            line_stride: 8,
            num_planes: 1,
            plane_stride: 0,
        };
        let mut dst = AddressInfo {
            base_offset: 0,
            bytes_per_chunk: 32,
            num_lines: 1,
            line_stride: 0,
            num_planes: 1,
            plane_stride: 0,
        };
        reconcile_dimensions(&mut src, &mut dst, RequestFlags::SRC_LINES_ONLY);
        assert_eq!(src.num_planes, 1);
        assert_eq!(dst.num_planes, 1);
        assert_eq!(src.bytes_per_chunk, dst.bytes_per_chunk);
        assert_eq!(src.num_lines, dst.num_lines);
    }
}
