// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Channels: the backends that execute one class of copies.
//!
//! Channels differ in how requests are submitted and completed but share the
//! path-table and ready-queue mechanics, which live here. State is composed,
//! not inherited: each backend embeds a [`ChannelBase`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bgwork::{BackgroundWorkManager, TimeLimit};
use crate::memory::{MemoryId, MemoryImpl, MemoryKind, NodeId};
use crate::xferdes::XferDes;

pub mod addr_split;
pub mod disk;
pub mod global;
#[cfg(feature = "cuda")]
pub mod gpu;
pub mod hdf5;
pub mod memcpy;
pub mod remote;

/// Kind of work a descriptor performs; doubles as the creation-dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XferDesKind {
    MemCpy,
    GasnetRead,
    GasnetWrite,
    RemoteWrite,
    DiskRead,
    DiskWrite,
    FileRead,
    FileWrite,
    GpuToFb,
    GpuFromFb,
    GpuInFb,
    GpuPeerFb,
    Hdf5Read,
    Hdf5Write,
    AddrSplit,
}

/// How one side of a supported path is specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEndpoint {
    /// A concrete memory.
    Specific(MemoryId),
    /// Any memory of this kind on the channel's node.
    LocalKind(MemoryKind),
    /// Any memory of this kind anywhere.
    GlobalKind(MemoryKind),
    /// Any RDMA-capable memory on the channel's node.
    LocalRdma,
    /// Any RDMA-capable memory on another node.
    RemoteRdma,
}

/// One row of a channel's path table.
#[derive(Debug, Clone, Copy)]
pub struct SupportedPath {
    pub src: PathEndpoint,
    pub dst: PathEndpoint,
    pub bandwidth: u32,
    pub latency: u32,
    pub redops_allowed: bool,
    pub serdez_allowed: bool,
    pub xd_kind: XferDesKind,
}

/// What a path query reports about one candidate memory.
#[derive(Debug, Clone, Copy)]
pub struct MemEndpointInfo {
    pub id: MemoryId,
    pub kind: MemoryKind,
    pub rdma_capable: bool,
}

impl MemEndpointInfo {
    pub fn of(mem: &dyn MemoryImpl, my_node: NodeId) -> Self {
        // rdma-ness depends on whether the memory is local or remote to us,
        // not to the channel
        let rdma_capable = if mem.id().owner_node() == my_node {
            mem.get_rdma_info().is_some()
        } else {
            mem.get_remote_addr(0).is_some()
        };
        Self {
            id: mem.id(),
            kind: mem.kind(),
            rdma_capable,
        }
    }
}

/// A path question: can this channel move bytes from `src` to `dst` with the
/// given serdez/redop requirements?
#[derive(Debug, Clone, Copy)]
pub struct PathQuery {
    pub src: MemEndpointInfo,
    pub dst: MemEndpointInfo,
    pub src_serdez: bool,
    pub dst_serdez: bool,
    pub redop: bool,
}

/// The answer: descriptor kind plus cost metrics.
#[derive(Debug, Clone, Copy)]
pub struct PathInfo {
    pub xd_kind: XferDesKind,
    pub bandwidth: u32,
    pub latency: u32,
}

fn endpoint_matches(ep: &PathEndpoint, mem: &MemEndpointInfo, channel_node: NodeId) -> bool {
    match *ep {
        PathEndpoint::Specific(id) => mem.id == id,
        PathEndpoint::LocalKind(kind) => {
            mem.kind == kind && mem.id.owner_node() == channel_node
        }
        PathEndpoint::GlobalKind(kind) => mem.kind == kind,
        PathEndpoint::LocalRdma => mem.id.owner_node() == channel_node && mem.rdma_capable,
        PathEndpoint::RemoteRdma => mem.id.owner_node() != channel_node && mem.rdma_capable,
    }
}

/// Scan a path table for a match.
pub fn scan_paths(paths: &[SupportedPath], node: NodeId, q: &PathQuery) -> Option<PathInfo> {
    for p in paths {
        if !p.serdez_allowed && (q.src_serdez || q.dst_serdez) {
            continue;
        }
        if !p.redops_allowed && q.redop {
            continue;
        }
        if !endpoint_matches(&p.src, &q.src, node) {
            continue;
        }
        if !endpoint_matches(&p.dst, &q.dst, node) {
            continue;
        }
        return Some(PathInfo {
            xd_kind: p.xd_kind,
            bandwidth: p.bandwidth,
            latency: p.latency,
        });
    }
    None
}

/// Shared per-channel state: the path table and the hookup to the
/// background-work pool.
pub struct ChannelBase {
    node: NodeId,
    kind: XferDesKind,
    name: &'static str,
    paths: Vec<SupportedPath>,
    bgwork: Arc<BackgroundWorkManager>,
}

impl ChannelBase {
    pub fn new(
        node: NodeId,
        kind: XferDesKind,
        name: &'static str,
        bgwork: Arc<BackgroundWorkManager>,
    ) -> Self {
        Self {
            node,
            kind,
            name,
            paths: Vec::new(),
            bgwork,
        }
    }

    pub fn add_path(
        &mut self,
        src: PathEndpoint,
        dst: PathEndpoint,
        bandwidth: u32,
        latency: u32,
        redops_allowed: bool,
        serdez_allowed: bool,
        xd_kind: XferDesKind,
    ) {
        self.paths.push(SupportedPath {
            src,
            dst,
            bandwidth,
            latency,
            redops_allowed,
            serdez_allowed,
            xd_kind,
        });
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A backend capable of executing one class of copies.
pub trait Channel: Send + Sync {
    fn base(&self) -> &ChannelBase;

    /// Advance one descriptor within the time limit. Returns whether any
    /// work happened. Must be a no-op on a completed descriptor.
    fn progress_xd(&self, xd: &Arc<XferDes>, work_until: TimeLimit) -> bool;

    fn kind(&self) -> XferDesKind {
        self.base().kind
    }

    fn node(&self) -> NodeId {
        self.base().node
    }

    fn paths(&self) -> &[SupportedPath] {
        &self.base().paths
    }

    fn supports_path(&self, q: &PathQuery) -> Option<PathInfo> {
        scan_paths(self.paths(), self.node(), q)
    }

    /// Hand a descriptor whose counters changed to the progress pool.
    fn enqueue_ready_xd(&self, xd: Arc<XferDes>) {
        let channel = xd.channel().clone();
        self.base().bgwork.push(channel, xd);
    }

    /// End-of-transfer hook (fsync and friends).
    fn flush_xd(&self, _xd: &Arc<XferDes>) {}

    fn shutdown(&self) {}
}

/// The per-node set of channels.
pub struct ChannelManager {
    node: NodeId,
    channels: Vec<Arc<dyn Channel>>,
    memcpy: Arc<memcpy::MemcpyChannel>,
    gasnet_read: Arc<global::GasnetChannel>,
    gasnet_write: Arc<global::GasnetChannel>,
    remote_write: Arc<remote::RemoteWriteChannel>,
    disk: Arc<disk::DiskChannel>,
    file: Arc<disk::FileChannel>,
    hdf5: Arc<hdf5::Hdf5Channel>,
    addr_split: Arc<addr_split::AddressSplitChannel>,
    #[cfg(feature = "cuda")]
    gpus: std::sync::Mutex<Vec<Arc<gpu::GpuChannel>>>,
}

impl ChannelManager {
    pub fn new(node: NodeId, bgwork: Arc<BackgroundWorkManager>) -> Self {
        let memcpy = Arc::new(memcpy::MemcpyChannel::new(node, bgwork.clone()));
        let gasnet_read = Arc::new(global::GasnetChannel::new(
            node,
            XferDesKind::GasnetRead,
            bgwork.clone(),
        ));
        let gasnet_write = Arc::new(global::GasnetChannel::new(
            node,
            XferDesKind::GasnetWrite,
            bgwork.clone(),
        ));
        let remote_write = Arc::new(remote::RemoteWriteChannel::new(node, bgwork.clone()));
        let disk = Arc::new(disk::DiskChannel::new(node, bgwork.clone()));
        let file = Arc::new(disk::FileChannel::new(node, bgwork.clone()));
        let hdf5 = Arc::new(hdf5::Hdf5Channel::new(node, bgwork.clone()));
        let addr_split = Arc::new(addr_split::AddressSplitChannel::new(node, bgwork.clone()));

        let channels: Vec<Arc<dyn Channel>> = vec![
            memcpy.clone(),
            gasnet_read.clone(),
            gasnet_write.clone(),
            remote_write.clone(),
            disk.clone(),
            file.clone(),
            hdf5.clone(),
            addr_split.clone(),
        ];

        Self {
            node,
            channels,
            memcpy,
            gasnet_read,
            gasnet_write,
            remote_write,
            disk,
            file,
            hdf5,
            addr_split,
            #[cfg(feature = "cuda")]
            gpus: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register the four DMA channels of one GPU.
    #[cfg(feature = "cuda")]
    pub fn add_gpu_channels(
        &mut self,
        ctx: std::sync::Arc<cudarc::driver::CudaContext>,
        bgwork: Arc<BackgroundWorkManager>,
    ) -> anyhow::Result<()> {
        for kind in [
            XferDesKind::GpuToFb,
            XferDesKind::GpuFromFb,
            XferDesKind::GpuInFb,
            XferDesKind::GpuPeerFb,
        ] {
            let ch = Arc::new(gpu::GpuChannel::new(
                self.node,
                kind,
                ctx.clone(),
                bgwork.clone(),
            )?);
            self.gpus.lock().unwrap().push(ch.clone());
            self.channels.push(ch);
        }
        Ok(())
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn channels(&self) -> &[Arc<dyn Channel>] {
        &self.channels
    }

    /// Find the best (highest-bandwidth) channel supporting a path.
    pub fn find_channel(&self, q: &PathQuery) -> Option<(Arc<dyn Channel>, PathInfo)> {
        let mut best: Option<(Arc<dyn Channel>, PathInfo)> = None;
        for ch in &self.channels {
            if let Some(info) = ch.supports_path(q) {
                let better = match &best {
                    Some((_, b)) => info.bandwidth > b.bandwidth,
                    None => true,
                };
                if better {
                    best = Some((ch.clone(), info));
                }
            }
        }
        best
    }

    /// Channel that executes descriptors of `kind`.
    pub fn channel_for_kind(&self, kind: XferDesKind) -> Arc<dyn Channel> {
        match kind {
            XferDesKind::MemCpy => self.memcpy.clone(),
            XferDesKind::GasnetRead => self.gasnet_read.clone(),
            XferDesKind::GasnetWrite => self.gasnet_write.clone(),
            XferDesKind::RemoteWrite => self.remote_write.clone(),
            XferDesKind::DiskRead | XferDesKind::DiskWrite => self.disk.clone(),
            XferDesKind::FileRead | XferDesKind::FileWrite => self.file.clone(),
            XferDesKind::Hdf5Read | XferDesKind::Hdf5Write => self.hdf5.clone(),
            XferDesKind::AddrSplit => self.addr_split.clone(),
            XferDesKind::GpuToFb
            | XferDesKind::GpuFromFb
            | XferDesKind::GpuInFb
            | XferDesKind::GpuPeerFb => {
                #[cfg(feature = "cuda")]
                {
                    return self
                        .gpus
                        .lock()
                        .unwrap()
                        .iter()
                        .find(|ch| ch.kind() == kind)
                        .cloned()
                        .map(|ch| ch as Arc<dyn Channel>)
                        .expect("no GPU channel registered for this kind");
                }
                #[cfg(not(feature = "cuda"))]
                panic!("GPU channels require the `cuda` feature");
            }
        }
    }

    pub fn memcpy_channel(&self) -> &Arc<memcpy::MemcpyChannel> {
        &self.memcpy
    }

    pub fn remote_write_channel(&self) -> &Arc<remote::RemoteWriteChannel> {
        &self.remote_write
    }

    pub fn addr_split_channel(&self) -> &Arc<addr_split::AddressSplitChannel> {
        &self.addr_split
    }

    pub fn shutdown(&self) {
        for ch in &self.channels {
            ch.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgwork::BackgroundWorkManager;

    fn q(
        src_kind: MemoryKind,
        src_node: NodeId,
        dst_kind: MemoryKind,
        dst_node: NodeId,
    ) -> PathQuery {
        PathQuery {
            src: MemEndpointInfo {
                id: MemoryId::new(src_node, 0),
                kind: src_kind,
                rdma_capable: src_kind == MemoryKind::RegDma,
            },
            dst: MemEndpointInfo {
                id: MemoryId::new(dst_node, 1),
                kind: dst_kind,
                rdma_capable: dst_kind == MemoryKind::RegDma,
            },
            src_serdez: false,
            dst_serdez: false,
            redop: false,
        }
    }

    #[test]
    fn test_path_tables_route_by_kind_and_locality() {
        let bgwork = BackgroundWorkManager::new(1);
        let mgr = ChannelManager::new(0, bgwork);

        // host-to-host lands on memcpy
        let (_, info) = mgr
            .find_channel(&q(MemoryKind::System, 0, MemoryKind::System, 0))
            .expect("memcpy path");
        assert_eq!(info.xd_kind, XferDesKind::MemCpy);

        // host to local disk is a disk write
        let (_, info) = mgr
            .find_channel(&q(MemoryKind::System, 0, MemoryKind::Disk, 0))
            .expect("disk path");
        assert_eq!(info.xd_kind, XferDesKind::DiskWrite);

        // local rdma to remote rdma is a remote write
        let (_, info) = mgr
            .find_channel(&q(MemoryKind::RegDma, 0, MemoryKind::RegDma, 1))
            .expect("remote path");
        assert_eq!(info.xd_kind, XferDesKind::RemoteWrite);

        // global memory reads route by the global-kind endpoint
        let (_, info) = mgr
            .find_channel(&q(MemoryKind::Global, 1, MemoryKind::System, 0))
            .expect("gasnet read path");
        assert_eq!(info.xd_kind, XferDesKind::GasnetRead);

        // remote host memory without rdma has no path at all
        assert!(
            mgr.find_channel(&q(MemoryKind::System, 0, MemoryKind::System, 1))
                .is_none()
        );

        mgr.shutdown();
    }

    #[test]
    fn test_serdez_allowed_only_on_memcpy() {
        let bgwork = BackgroundWorkManager::new(1);
        let mgr = ChannelManager::new(0, bgwork);

        let mut query = q(MemoryKind::System, 0, MemoryKind::System, 0);
        query.src_serdez = true;
        let (_, info) = mgr.find_channel(&query).expect("serdez memcpy path");
        assert_eq!(info.xd_kind, XferDesKind::MemCpy);

        // no channel carries serdez to disk
        let mut query = q(MemoryKind::System, 0, MemoryKind::Disk, 0);
        query.src_serdez = true;
        assert!(mgr.find_channel(&query).is_none());

        // simultaneous encode+decode is refused everywhere
        let mut query = q(MemoryKind::RegDma, 0, MemoryKind::RegDma, 1);
        query.src_serdez = true;
        query.dst_serdez = true;
        assert!(mgr.find_channel(&query).is_none());

        mgr.shutdown();
    }
}
