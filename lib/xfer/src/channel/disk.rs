// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Disk and file channels.
//!
//! Each request becomes an asynchronous read or write handed to a per-node
//! [`AsyncFileIoContext`]; a background worker executes them with
//! `pread`/`pwrite` and fires the descriptor's completion callbacks. The
//! bounded in-flight discipline comes from the per-descriptor request pools;
//! `max_depth` bounds how many operations the worker drains per wakeup so
//! one descriptor cannot monopolize it.

use std::collections::VecDeque;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;

use crate::bgwork::{BackgroundWorkManager, TimeLimit};
use crate::memory::{MemoryKind, NodeId};
use crate::request::{Request, RequestFlags, SendPtr};
use crate::xferdes::{XdProgress, XferDes};

use super::{Channel, ChannelBase, PathEndpoint, XferDesKind};

const DISK_CPU_KINDS: [MemoryKind; 3] = [
    MemoryKind::System,
    MemoryKind::RegDma,
    MemoryKind::ZeroCopy,
];

enum AioOp {
    Read {
        fd: RawFd,
        offset: u64,
        len: usize,
        dst: SendPtr,
        req: Request,
    },
    Write {
        fd: RawFd,
        offset: u64,
        len: usize,
        src: SendPtr,
        req: Request,
    },
}

struct AioShared {
    queue: Mutex<VecDeque<AioOp>>,
    condvar: Condvar,
    cancel: CancellationToken,
    max_depth: usize,
}

/// Per-node asynchronous file-I/O engine: a submission queue drained by a
/// dedicated worker thread.
pub struct AsyncFileIoContext {
    shared: Arc<AioShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncFileIoContext {
    pub fn new(max_depth: usize) -> Arc<Self> {
        let shared = Arc::new(AioShared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            cancel: CancellationToken::new(),
            max_depth,
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("xfer-aio".to_string())
            .spawn(move || Self::worker_loop(worker_shared))
            .expect("failed to spawn aio worker");
        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn enqueue(&self, op: AioOp) {
        self.shared.queue.lock().unwrap().push_back(op);
        self.shared.condvar.notify_one();
    }

    pub fn enqueue_read(&self, fd: RawFd, offset: u64, len: usize, dst: SendPtr, req: Request) {
        self.enqueue(AioOp::Read {
            fd,
            offset,
            len,
            dst,
            req,
        });
    }

    pub fn enqueue_write(&self, fd: RawFd, offset: u64, len: usize, src: SendPtr, req: Request) {
        self.enqueue(AioOp::Write {
            fd,
            offset,
            len,
            src,
            req,
        });
    }

    fn worker_loop(shared: Arc<AioShared>) {
        loop {
            let batch: Vec<AioOp> = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    if shared.cancel.is_cancelled() && queue.is_empty() {
                        return;
                    }
                    if !queue.is_empty() {
                        let take = queue.len().min(shared.max_depth);
                        break queue.drain(..take).collect();
                    }
                    let (guard, _) = shared
                        .condvar
                        .wait_timeout(queue, std::time::Duration::from_millis(50))
                        .unwrap();
                    queue = guard;
                }
            };
            for op in batch {
                Self::execute(op);
            }
        }
    }

    fn execute(op: AioOp) {
        match op {
            AioOp::Read {
                fd,
                offset,
                len,
                dst,
                req,
            } => {
                let buf = unsafe { std::slice::from_raw_parts_mut(dst.0, len) };
                if let Err(err) = pread_exact(fd, offset, buf) {
                    tracing::warn!(%err, fd, offset, len, "disk read failed");
                    req.xd.mark_failed();
                }
                req.xd.default_notify_request_read_done(&req);
                req.xd.default_notify_request_write_done(&req);
            }
            AioOp::Write {
                fd,
                offset,
                len,
                src,
                req,
            } => {
                let buf = unsafe { std::slice::from_raw_parts(src.0 as *const u8, len) };
                if let Err(err) = pwrite_all(fd, offset, buf) {
                    tracing::warn!(%err, fd, offset, len, "disk write failed");
                    req.xd.mark_failed();
                }
                req.xd.default_notify_request_read_done(&req);
                req.xd.default_notify_request_write_done(&req);
            }
        }
    }

    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.condvar.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncFileIoContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pread_exact(fd: RawFd, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    while !buf.is_empty() {
        let n = nix::sys::uio::pread(borrowed, buf, offset as i64)
            .map_err(std::io::Error::from)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "pread hit end of file",
            ));
        }
        offset += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

fn pwrite_all(fd: RawFd, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    while !buf.is_empty() {
        let n = nix::sys::uio::pwrite(borrowed, buf, offset as i64)
            .map_err(std::io::Error::from)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "pwrite made no progress",
            ));
        }
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

/// Which direction an fd-backed descriptor moves bytes.
fn fd_transfer_is_read(xd: &XferDes, kind: MemoryKind) -> bool {
    if let Some(mem) = xd.input_ports.first().and_then(|p| p.mem.as_ref()) {
        if mem.kind() == kind {
            return true;
        }
    }
    if let Some(mem) = xd.output_ports.first().and_then(|p| p.mem.as_ref()) {
        if mem.kind() == kind {
            return false;
        }
    }
    panic!("neither endpoint of an fd-backed descriptor is {kind:?}");
}

fn progress_fd_requests(
    xd: &Arc<XferDes>,
    prog: &mut XdProgress,
    aio: &AsyncFileIoContext,
    mem_kind: MemoryKind,
    work_until: TimeLimit,
) -> bool {
    let is_read = fd_transfer_is_read(xd, mem_kind);
    let mut did_work = false;
    loop {
        let reqs = xd.default_get_requests(prog, 1, RequestFlags::LINEAR);
        if reqs.is_empty() {
            break;
        }
        for req in reqs {
            // no serdez on fd paths
            assert!(xd.input_ports[req.src_port_idx].serdez_op.is_none());
            assert!(xd.output_ports[req.dst_port_idx].serdez_op.is_none());
            did_work = true;
            if is_read {
                let in_mem = xd.input_ports[req.src_port_idx].mem.as_ref().unwrap();
                let out_mem = xd.output_ports[req.dst_port_idx].mem.as_ref().unwrap();
                let fd = in_mem.file_descriptor().expect("disk memory without fd");
                let file_off = (req.src_off + in_mem.file_offset()) as u64;
                let dst = out_mem
                    .get_direct_ptr(req.dst_off, req.nbytes)
                    .expect("fd transfer partner must be host-mapped");
                aio.enqueue_read(fd, file_off, req.nbytes, SendPtr(dst), req);
            } else {
                let in_mem = xd.input_ports[req.src_port_idx].mem.as_ref().unwrap();
                let out_mem = xd.output_ports[req.dst_port_idx].mem.as_ref().unwrap();
                let fd = out_mem.file_descriptor().expect("disk memory without fd");
                let file_off = (req.dst_off + out_mem.file_offset()) as u64;
                let src = in_mem
                    .get_direct_ptr(req.src_off, req.nbytes)
                    .expect("fd transfer partner must be host-mapped");
                aio.enqueue_write(fd, file_off, req.nbytes, SendPtr(src), req);
            }
        }
        if work_until.is_expired() {
            break;
        }
    }
    did_work
}

fn flush_fd_ports(xd: &Arc<XferDes>) {
    for port in xd.input_ports.iter().chain(xd.output_ports.iter()) {
        if let Some(fd) = port.mem.as_ref().and_then(|m| m.file_descriptor()) {
            if let Err(err) = nix::unistd::fsync(fd) {
                tracing::warn!(%err, fd, "fsync failed");
                xd.mark_failed();
            }
        }
    }
}

/// Channel for raw-disk memories (one fd covering the memory).
pub struct DiskChannel {
    base: ChannelBase,
    aio: Arc<AsyncFileIoContext>,
}

impl DiskChannel {
    pub const MAX_DEPTH: usize = 16;

    pub fn new(node: NodeId, bgwork: Arc<BackgroundWorkManager>) -> Self {
        let mut base = ChannelBase::new(node, XferDesKind::DiskRead, "disk channel", bgwork);
        for kind in DISK_CPU_KINDS {
            base.add_path(
                PathEndpoint::LocalKind(MemoryKind::Disk),
                PathEndpoint::LocalKind(kind),
                0,
                0,
                false,
                false,
                XferDesKind::DiskRead,
            );
            base.add_path(
                PathEndpoint::LocalKind(kind),
                PathEndpoint::LocalKind(MemoryKind::Disk),
                0,
                0,
                false,
                false,
                XferDesKind::DiskWrite,
            );
        }
        Self {
            base,
            aio: AsyncFileIoContext::new(Self::MAX_DEPTH),
        }
    }
}

impl Channel for DiskChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn progress_xd(&self, xd: &Arc<XferDes>, work_until: TimeLimit) -> bool {
        if xd.transfer_completed() {
            return false;
        }
        let mut prog = xd.lock_progress();
        progress_fd_requests(xd, &mut prog, &self.aio, MemoryKind::Disk, work_until)
    }

    fn flush_xd(&self, xd: &Arc<XferDes>) {
        flush_fd_ports(xd);
    }

    fn shutdown(&self) {
        self.aio.shutdown();
    }
}

/// Channel for file-backed memories (pre-opened fd plus a base offset).
pub struct FileChannel {
    base: ChannelBase,
    aio: Arc<AsyncFileIoContext>,
}

impl FileChannel {
    pub fn new(node: NodeId, bgwork: Arc<BackgroundWorkManager>) -> Self {
        let mut base = ChannelBase::new(node, XferDesKind::FileRead, "file channel", bgwork);
        for kind in DISK_CPU_KINDS {
            base.add_path(
                PathEndpoint::LocalKind(MemoryKind::File),
                PathEndpoint::LocalKind(kind),
                0,
                0,
                false,
                false,
                XferDesKind::FileRead,
            );
            base.add_path(
                PathEndpoint::LocalKind(kind),
                PathEndpoint::LocalKind(MemoryKind::File),
                0,
                0,
                false,
                false,
                XferDesKind::FileWrite,
            );
        }
        Self {
            base,
            aio: AsyncFileIoContext::new(DiskChannel::MAX_DEPTH),
        }
    }
}

impl Channel for FileChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn progress_xd(&self, xd: &Arc<XferDes>, work_until: TimeLimit) -> bool {
        if xd.transfer_completed() {
            return false;
        }
        let mut prog = xd.lock_progress();
        progress_fd_requests(xd, &mut prog, &self.aio, MemoryKind::File, work_until)
    }

    fn flush_xd(&self, xd: &Arc<XferDes>) {
        flush_fd_ports(xd);
    }

    fn shutdown(&self) {
        self.aio.shutdown();
    }
}
