// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! GPU channels: host/device and device/device DMA over CUDA streams.
//!
//! Each request maps to async copies on the channel's stream followed by an
//! event record; a background poller queries outstanding events and fires
//! the completion callbacks. One channel exists per (device, direction).

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use cudarc::driver::{CudaContext, CudaEvent, CudaStream, DriverError, result as cuda_result, sys::CUresult};
use tokio_util::sync::CancellationToken;

use crate::bgwork::{BackgroundWorkManager, TimeLimit};
use crate::memory::{MemoryId, MemoryImpl, MemoryKind, NodeId};
use crate::request::{Request, RequestDim, RequestFlags};
use crate::xferdes::{XdProgress, XferDes};

use super::{Channel, ChannelBase, PathEndpoint, XferDesKind};

const GPU_CPU_KINDS: [MemoryKind; 3] = [
    MemoryKind::RegDma,
    MemoryKind::ZeroCopy,
    MemoryKind::System,
];

/// GPU framebuffer memory: a device allocation addressed by CUdeviceptr.
pub struct GpuFbMemory {
    id: MemoryId,
    base: u64,
    size: usize,
    _ctx: Arc<CudaContext>,
}

impl GpuFbMemory {
    pub fn allocate(id: MemoryId, ctx: Arc<CudaContext>, size: usize) -> anyhow::Result<Arc<Self>> {
        ctx.bind_to_thread()?;
        let base = unsafe { cuda_result::malloc_sync(size)? };
        Ok(Arc::new(Self {
            id,
            base,
            size,
            _ctx: ctx,
        }))
    }

    pub fn device_ptr(&self) -> u64 {
        self.base
    }
}

impl MemoryImpl for GpuFbMemory {
    fn id(&self) -> MemoryId {
        self.id
    }

    fn kind(&self) -> MemoryKind {
        MemoryKind::GpuFb
    }

    fn size(&self) -> usize {
        self.size
    }

    fn device_ptr_base(&self) -> Option<u64> {
        Some(self.base)
    }
}

impl Drop for GpuFbMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = cuda_result::free_sync(self.base);
        }
    }
}

struct PendingEvent {
    event: CudaEvent,
    req: Request,
}

struct PollerShared {
    queue: Mutex<VecDeque<PendingEvent>>,
    condvar: Condvar,
    cancel: CancellationToken,
}

/// Polls CUDA events for completed copies and fires the descriptor
/// callbacks.
struct CompletionPoller {
    shared: Arc<PollerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionPoller {
    fn new() -> Self {
        let shared = Arc::new(PollerShared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            cancel: CancellationToken::new(),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("xfer-gpu-poll".to_string())
            .spawn(move || Self::poll_loop(worker_shared))
            .expect("failed to spawn gpu poller");
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn push(&self, event: CudaEvent, req: Request) {
        self.shared
            .queue
            .lock()
            .unwrap()
            .push_back(PendingEvent { event, req });
        self.shared.condvar.notify_one();
    }

    fn poll_loop(shared: Arc<PollerShared>) {
        loop {
            let pending = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    if shared.cancel.is_cancelled() && queue.is_empty() {
                        return;
                    }
                    if let Some(p) = queue.pop_front() {
                        break p;
                    }
                    let (guard, _) = shared
                        .condvar
                        .wait_timeout(queue, std::time::Duration::from_millis(50))
                        .unwrap();
                    queue = guard;
                }
            };

            // poll the event until it fires
            loop {
                let done = unsafe {
                    match cuda_result::event::query(pending.event.cu_event()) {
                        Ok(()) => true,
                        Err(DriverError(CUresult::CUDA_ERROR_NOT_READY)) => false,
                        Err(err) => {
                            tracing::warn!(?err, "cuda event query failed");
                            pending.req.xd.mark_failed();
                            true
                        }
                    }
                };
                if done {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_micros(20));
            }

            pending.req.xd.default_notify_request_read_done(&pending.req);
            pending.req.xd.default_notify_request_write_done(&pending.req);
        }
    }

    fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.condvar.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// One GPU DMA direction for one device.
pub struct GpuChannel {
    base: ChannelBase,
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    poller: CompletionPoller,
}

impl GpuChannel {
    pub fn new(
        node: NodeId,
        kind: XferDesKind,
        ctx: Arc<CudaContext>,
        bgwork: Arc<BackgroundWorkManager>,
    ) -> anyhow::Result<Self> {
        let name = match kind {
            XferDesKind::GpuToFb => "gpu to-fb channel",
            XferDesKind::GpuFromFb => "gpu from-fb channel",
            XferDesKind::GpuInFb => "gpu in-fb channel",
            XferDesKind::GpuPeerFb => "gpu peer-fb channel",
            _ => panic!("not a GPU descriptor kind: {kind:?}"),
        };
        let mut base = ChannelBase::new(node, kind, name, bgwork);
        match kind {
            XferDesKind::GpuToFb => {
                for cpu in GPU_CPU_KINDS {
                    base.add_path(
                        PathEndpoint::LocalKind(cpu),
                        PathEndpoint::LocalKind(MemoryKind::GpuFb),
                        0,
                        0,
                        false,
                        false,
                        kind,
                    );
                }
            }
            XferDesKind::GpuFromFb => {
                for cpu in GPU_CPU_KINDS {
                    base.add_path(
                        PathEndpoint::LocalKind(MemoryKind::GpuFb),
                        PathEndpoint::LocalKind(cpu),
                        0,
                        0,
                        false,
                        false,
                        kind,
                    );
                }
            }
            _ => {
                base.add_path(
                    PathEndpoint::LocalKind(MemoryKind::GpuFb),
                    PathEndpoint::LocalKind(MemoryKind::GpuFb),
                    0,
                    0,
                    false,
                    false,
                    kind,
                );
            }
        }
        let stream = ctx.new_stream()?;
        Ok(Self {
            base,
            ctx,
            stream,
            poller: CompletionPoller::new(),
        })
    }

    fn device_addr(mem: &Arc<dyn MemoryImpl>, offset: usize) -> u64 {
        mem.device_ptr_base()
            .expect("GPU endpoint must be a framebuffer memory")
            + offset as u64
    }

    fn submit(&self, xd: &Arc<XferDes>, req: Request) -> Result<(), (anyhow::Error, Request)> {
        match self.try_submit(xd, &req) {
            Ok(event) => {
                self.poller.push(event, req);
                Ok(())
            }
            Err(err) => Err((err, req)),
        }
    }

    fn try_submit(&self, xd: &Arc<XferDes>, req: &Request) -> anyhow::Result<CudaEvent> {
        self.ctx.bind_to_thread()?;
        let in_mem = xd.input_ports[req.src_port_idx].mem.clone().unwrap();
        let out_mem = xd.output_ports[req.dst_port_idx].mem.clone().unwrap();
        let cu_stream = self.stream.cu_stream();

        // issue line-by-line async copies; dense requests are a single call
        let (nlines, nplanes) = match req.dim {
            RequestDim::D1 => (1, 1),
            RequestDim::D2 => (req.nlines, 1),
            RequestDim::D3 => (req.nlines, req.nplanes),
        };
        for p in 0..nplanes {
            for l in 0..nlines {
                let src_off = req.src_off + l * req.src_str + p * req.src_pstr;
                let dst_off = req.dst_off + l * req.dst_str + p * req.dst_pstr;
                unsafe {
                    match self.kind() {
                        XferDesKind::GpuToFb => {
                            let src = in_mem
                                .get_direct_ptr(src_off, req.nbytes)
                                .expect("host side of H2D must be mapped");
                            cuda_result::memcpy_htod_async(
                                Self::device_addr(&out_mem, dst_off),
                                std::slice::from_raw_parts(src, req.nbytes),
                                cu_stream,
                            )?;
                        }
                        XferDesKind::GpuFromFb => {
                            let dst = out_mem
                                .get_direct_ptr(dst_off, req.nbytes)
                                .expect("host side of D2H must be mapped");
                            cuda_result::memcpy_dtoh_async(
                                std::slice::from_raw_parts_mut(dst, req.nbytes),
                                Self::device_addr(&in_mem, src_off),
                                cu_stream,
                            )?;
                        }
                        _ => {
                            cuda_result::memcpy_dtod_async(
                                Self::device_addr(&out_mem, dst_off),
                                Self::device_addr(&in_mem, src_off),
                                req.nbytes,
                                cu_stream,
                            )?;
                        }
                    }
                }
            }
        }

        let event = self.stream.record_event(None)?;
        Ok(event)
    }

    fn progress(&self, xd: &Arc<XferDes>, prog: &mut XdProgress, work_until: TimeLimit) -> bool {
        let mut did_work = false;
        loop {
            let reqs = xd.default_get_requests(prog, 1, RequestFlags::FULL);
            if reqs.is_empty() {
                break;
            }
            for req in reqs {
                assert!(xd.input_ports[req.src_port_idx].serdez_op.is_none());
                assert!(xd.output_ports[req.dst_port_idx].serdez_op.is_none());
                did_work = true;
                match self.submit(xd, req) {
                    Ok(()) => {}
                    Err((err, req)) => {
                        tracing::warn!(%err, xd = ?xd.guid(), "gpu submit failed");
                        xd.mark_failed();
                        // complete the request so the counters still drain
                        xd.default_notify_request_read_done(&req);
                        xd.default_notify_request_write_done(&req);
                    }
                }
            }
            if work_until.is_expired() {
                break;
            }
        }
        did_work
    }
}

impl Channel for GpuChannel {
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

    fn shutdown(&self) {
        self.poller.shutdown();
    }
}

impl Drop for GpuChannel {
    fn drop(&mut self) {
        self.poller.shutdown();
    }
}
