// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Address-split channel: demultiplexes one element stream into several.
//!
//! Indirect copies need their address stream split by target space. A
//! splitting descriptor consumes elements from its input port, routes each
//! through a per-descriptor [`AddressSplitter`], appends it to the chosen
//! output stream, and describes the interleaving on a control output port so
//! a downstream gather/scatter can follow along. It is a channel like any
//! other: every output honors IB flow control.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::bgwork::{BackgroundWorkManager, TimeLimit};
use crate::iterator::{AddressInfo, StepFlags};
use crate::port::ControlWord;
use crate::xferdes::{XdProgress, XferDes, XferDesId, XFERDES_NO_GUID};

use super::{Channel, ChannelBase, XferDesKind};

/// Per-element routing decision. `None` drops the element.
pub trait AddressSplitter: Send + Sync {
    fn element_size(&self) -> usize;
    fn route(&self, elem: &[u8]) -> Option<usize>;
}

struct SplitState {
    splitter: Arc<dyn AddressSplitter>,
    /// Output port of the run being accumulated, and its element count.
    pending_port: Option<usize>,
    pending_count: usize,
    /// Index of the control output port (always the last output).
    control_port: usize,
}

pub struct AddressSplitChannel {
    base: ChannelBase,
    states: Mutex<HashMap<XferDesId, SplitState>>,
}

impl AddressSplitChannel {
    pub fn new(node: crate::memory::NodeId, bgwork: Arc<BackgroundWorkManager>) -> Self {
        // address splitting is an internal hop; the planner selects it by
        // kind, not by memory pair, so the path table stays empty
        let base = ChannelBase::new(node, XferDesKind::AddrSplit, "addr split channel", bgwork);
        Self {
            base,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Bind the routing function for a splitting descriptor. The last output
    /// port is the control stream.
    pub fn register_splitter(
        &self,
        xd: &XferDes,
        splitter: Arc<dyn AddressSplitter>,
    ) {
        assert!(xd.output_ports.len() >= 2, "need data outputs plus a control output");
        let state = SplitState {
            splitter,
            pending_port: None,
            pending_count: 0,
            control_port: xd.output_ports.len() - 1,
        };
        self.states.lock().unwrap().insert(xd.guid(), state);
    }

    /// Append `data` to an output stream, honoring its IB window. Returns
    /// false (and leaves the stream untouched) when the window lacks space.
    fn write_output(xd: &Arc<XferDes>, prog: &mut XdProgress, port_idx: usize, data: &[u8]) -> bool {
        let out_port = &xd.output_ports[port_idx];
        let lbt = out_port.local_bytes_total.load(Ordering::Acquire);
        if out_port.peer_guid != XFERDES_NO_GUID
            && out_port.seq_remote.span_exists(lbt, data.len()) < data.len()
        {
            return false;
        }
        let mem = out_port.mem.as_ref().expect("split output must have memory");
        let iter = prog.outputs[port_idx].iter.as_mut();
        let mut written = 0;
        while written < data.len() {
            let mut info = AddressInfo::default();
            let n = iter.step(data.len() - written, &mut info, StepFlags::LINEAR, false);
            assert!(n > 0, "split output iterator exhausted mid-element");
            let dst = mem
                .get_direct_ptr(info.base_offset, n)
                .expect("split output must be host-mapped");
            unsafe { std::ptr::copy_nonoverlapping(data[written..].as_ptr(), dst, n) };
            written += n;
        }
        out_port
            .local_bytes_total
            .store(lbt + data.len(), Ordering::Release);
        out_port
            .local_bytes_cons
            .store(lbt + data.len(), Ordering::Release);
        xd.update_bytes_write(port_idx, lbt, data.len());
        true
    }

    /// Emit the accumulated run as one control word (count in bytes).
    /// Returns false if the control stream has no room.
    fn flush_run(xd: &Arc<XferDes>, prog: &mut XdProgress, state: &mut SplitState) -> bool {
        if state.pending_count == 0 {
            return true;
        }
        let word = ControlWord::encode(state.pending_port, state.pending_count, false);
        if !Self::write_output(xd, prog, state.control_port, &word.0.to_le_bytes()) {
            return false;
        }
        state.pending_port = None;
        state.pending_count = 0;
        true
    }

    fn progress(&self, xd: &Arc<XferDes>, prog: &mut XdProgress, work_until: TimeLimit) -> bool {
        let mut states = self.states.lock().unwrap();
        let state = states
            .get_mut(&xd.guid())
            .expect("splitting descriptor without a registered splitter");
        let elem_size = state.splitter.element_size();

        let in_port = &xd.input_ports[0];
        let in_mem = in_port.mem.clone().expect("split input must have memory");
        let mut did_work = false;

        loop {
            if xd.iteration_completed() {
                break;
            }

            let lbt = in_port.local_bytes_total.load(Ordering::Acquire);
            let input_ended = if in_port.peer_guid == XFERDES_NO_GUID {
                prog.inputs[0].iter.done()
            } else {
                in_port.remote_bytes_total.load(Ordering::Acquire) == lbt
            };

            if input_ended {
                // drain the pending run, then the end-of-stream word
                if !Self::flush_run(xd, prog, state) {
                    break;
                }
                let eos_word = ControlWord::encode(None, 0, true);
                if !Self::write_output(xd, prog, state.control_port, &eos_word.0.to_le_bytes()) {
                    break;
                }
                xd.set_iteration_completed_and_notify();
                did_work = true;
                break;
            }

            // one whole element must be present
            if in_port.peer_guid != XFERDES_NO_GUID
                && in_port.seq_remote.span_exists(lbt, elem_size) < elem_size
            {
                break;
            }

            let mut info = AddressInfo::default();
            let n = prog.inputs[0]
                .iter
                .step(elem_size, &mut info, StepFlags::LINEAR, true);
            if n < elem_size {
                if n > 0 {
                    prog.inputs[0].iter.cancel_step();
                }
                break;
            }
            let src = in_mem
                .get_direct_ptr(info.base_offset, elem_size)
                .expect("split input must be host-mapped");
            let elem = unsafe { std::slice::from_raw_parts(src, elem_size) };
            let routed = state.splitter.route(elem);

            // a run break must fit in the control stream before we commit
            // the element
            if state.pending_count > 0
                && routed != state.pending_port
                && !Self::flush_run(xd, prog, state)
            {
                prog.inputs[0].iter.cancel_step();
                break;
            }

            // routed elements need room in their output window
            if let Some(k) = routed {
                let out_port = &xd.output_ports[k];
                let out_lbt = out_port.local_bytes_total.load(Ordering::Acquire);
                if out_port.peer_guid != XFERDES_NO_GUID
                    && out_port.seq_remote.span_exists(out_lbt, elem_size) < elem_size
                {
                    prog.inputs[0].iter.cancel_step();
                    break;
                }
                let elem_copy = elem.to_vec();
                prog.inputs[0].iter.confirm_step();
                let ok = Self::write_output(xd, prog, k, &elem_copy);
                assert!(ok, "output space vanished under the progress lock");
            } else {
                prog.inputs[0].iter.confirm_step();
            }

            state.pending_port = routed;
            state.pending_count += elem_size;

            in_port
                .local_bytes_total
                .store(lbt + elem_size, Ordering::Release);
            in_port.local_bytes_cons.fetch_add(elem_size, Ordering::AcqRel);
            xd.update_bytes_read(0, lbt, elem_size);

            did_work = true;
            if work_until.is_expired() {
                break;
            }
        }

        did_work
    }
}

impl Channel for AddressSplitChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn progress_xd(&self, xd: &Arc<XferDes>, work_until: TimeLimit) -> bool {
        if xd.transfer_completed() {
            return false;
        }
        let mut prog = xd.lock_progress();
        self.progress(xd, &mut prog, work_until)
    }
}
