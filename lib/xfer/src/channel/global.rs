// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Channels for globally addressable memory, reached only through the
//! node-collective `get_bytes`/`put_bytes` interface. One request per chunk,
//! 1D only.

use std::sync::Arc;

use crate::bgwork::{BackgroundWorkManager, TimeLimit};
use crate::memory::{MemoryKind, NodeId};
use crate::request::{Request, RequestFlags};
use crate::xferdes::{XdProgress, XferDes};

use super::{Channel, ChannelBase, PathEndpoint, XferDesKind};

const CPU_MEM_KINDS: [MemoryKind; 3] = [
    MemoryKind::System,
    MemoryKind::RegDma,
    MemoryKind::ZeroCopy,
];

/// Global-memory channel; `kind` selects the read or write direction.
pub struct GasnetChannel {
    base: ChannelBase,
}

impl GasnetChannel {
    pub fn new(node: NodeId, kind: XferDesKind, bgwork: Arc<BackgroundWorkManager>) -> Self {
        debug_assert!(matches!(
            kind,
            XferDesKind::GasnetRead | XferDesKind::GasnetWrite
        ));
        let name = match kind {
            XferDesKind::GasnetRead => "gasnet read channel",
            _ => "gasnet write channel",
        };
        let mut base = ChannelBase::new(node, kind, name, bgwork);
        for cpu in CPU_MEM_KINDS {
            match kind {
                XferDesKind::GasnetRead => base.add_path(
                    PathEndpoint::GlobalKind(MemoryKind::Global),
                    PathEndpoint::LocalKind(cpu),
                    0,
                    0,
                    false,
                    false,
                    XferDesKind::GasnetRead,
                ),
                _ => base.add_path(
                    PathEndpoint::LocalKind(cpu),
                    PathEndpoint::GlobalKind(MemoryKind::Global),
                    0,
                    0,
                    false,
                    false,
                    XferDesKind::GasnetWrite,
                ),
            }
        }
        Self { base }
    }

    fn submit(&self, xd: &Arc<XferDes>, req: Request) {
        assert!(xd.input_ports[req.src_port_idx].serdez_op.is_none());
        assert!(xd.output_ports[req.dst_port_idx].serdez_op.is_none());
        let in_mem = xd.input_ports[req.src_port_idx].mem.as_ref().unwrap();
        let out_mem = xd.output_ports[req.dst_port_idx].mem.as_ref().unwrap();

        let result = match self.kind() {
            XferDesKind::GasnetRead => {
                // global -> host: blocking get into the mapped destination
                let dst = out_mem
                    .get_direct_ptr(req.dst_off, req.nbytes)
                    .expect("gasnet read target must be host-mapped");
                let buf = unsafe { std::slice::from_raw_parts_mut(dst, req.nbytes) };
                in_mem.get_bytes(req.src_off, buf)
            }
            _ => {
                // host -> global: blocking put from the mapped source
                let src = in_mem
                    .get_direct_ptr(req.src_off, req.nbytes)
                    .expect("gasnet write source must be host-mapped");
                let buf = unsafe { std::slice::from_raw_parts(src as *const u8, req.nbytes) };
                out_mem.put_bytes(req.dst_off, buf)
            }
        };
        if let Err(err) = result {
            tracing::warn!(%err, xd = ?xd.guid(), "global memory access failed");
            xd.mark_failed();
        }

        xd.default_notify_request_read_done(&req);
        xd.default_notify_request_write_done(&req);
    }

    fn progress(&self, xd: &Arc<XferDes>, prog: &mut XdProgress, work_until: TimeLimit) -> bool {
        let mut did_work = false;
        loop {
            let reqs = xd.default_get_requests(prog, 1, RequestFlags::LINEAR);
            if reqs.is_empty() {
                break;
            }
            for req in reqs {
                self.submit(xd, req);
                did_work = true;
            }
            if work_until.is_expired() {
                break;
            }
        }
        did_work
    }
}

impl Channel for GasnetChannel {
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
