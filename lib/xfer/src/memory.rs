// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory interface consumed by the transfer engine.
//!
//! Channels never assume how a memory is backed; they ask for a direct
//! pointer (host-mapped memories), fall back to `get_bytes`/`put_bytes`
//! (globally addressable memories), or resolve a [`RemoteAddress`]
//! (RDMA-visible memories).

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Node identifier within the runtime.
pub type NodeId = u32;

/// Opaque memory handle: owner node in the upper 32 bits, per-node index in
/// the lower 32.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub u64);

impl MemoryId {
    pub fn new(owner: NodeId, index: u32) -> Self {
        Self(((owner as u64) << 32) | index as u64)
    }

    pub fn owner_node(&self) -> NodeId {
        (self.0 >> 32) as NodeId
    }
}

impl std::fmt::Debug for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mem[{}:{}]", self.owner_node(), self.0 as u32)
    }
}

/// Kinds of memories the engine can move bytes between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    /// Ordinary host RAM.
    System,
    /// Pinned/registered host RAM.
    RegDma,
    /// Zero-copy (device-visible) host RAM.
    ZeroCopy,
    /// NUMA socket memory.
    Socket,
    /// On-node raw disk device.
    Disk,
    /// On-node file-backed memory.
    File,
    /// GPU framebuffer.
    GpuFb,
    /// HDF5 dataset collection.
    Hdf,
    /// Globally addressable memory striped across nodes.
    Global,
}

impl MemoryKind {
    /// Host kinds reachable by plain CPU loads/stores.
    pub fn is_cpu_mapped(&self) -> bool {
        matches!(
            self,
            MemoryKind::System | MemoryKind::RegDma | MemoryKind::ZeroCopy | MemoryKind::Socket
        )
    }
}

/// Address of a byte range in an RDMA-visible memory, resolvable on the
/// memory's owner node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAddress {
    pub mem: MemoryId,
    pub offset: u64,
}

/// Memory implementation consumed by channels.
pub trait MemoryImpl: Send + Sync {
    fn id(&self) -> MemoryId;
    fn kind(&self) -> MemoryKind;
    fn size(&self) -> usize;

    /// Raw pointer to `[offset, offset+len)`, for host-mapped memories only.
    fn get_direct_ptr(&self, _offset: usize, _len: usize) -> Option<*mut u8> {
        None
    }

    /// Synchronous blocking read for non-mapped memories.
    fn get_bytes(&self, _offset: usize, _dst: &mut [u8]) -> Result<()> {
        Err(TransferError::NotSupported("get_bytes").into())
    }

    /// Synchronous blocking write for non-mapped memories.
    fn put_bytes(&self, _offset: usize, _src: &[u8]) -> Result<()> {
        Err(TransferError::NotSupported("put_bytes").into())
    }

    /// RDMA-resolvable address, if this memory is visible to the network.
    fn get_remote_addr(&self, _offset: usize) -> Option<RemoteAddress> {
        None
    }

    /// Opaque bytes identifying this memory's registered segment to a
    /// network module, if any.
    fn get_rdma_info(&self) -> Option<Vec<u8>> {
        None
    }

    /// File descriptor for fd-backed memories (disk, file).
    fn file_descriptor(&self) -> Option<RawFd> {
        None
    }

    /// Extra byte offset applied to all accesses of an fd-backed memory.
    fn file_offset(&self) -> usize {
        0
    }

    /// Downcast for the HDF5 channel, which needs the dataset opener.
    fn as_hdf(&self) -> Option<&HdfMemory> {
        None
    }

    /// Base device address for framebuffer memories.
    fn device_ptr_base(&self) -> Option<u64> {
        None
    }
}

/// Heap allocation whose bytes are handed out as raw pointers.
///
/// # Safety
///
/// The engine's flow control guarantees that no two in-flight requests touch
/// overlapping byte ranges with conflicting access, so concurrent raw-pointer
/// copies into disjoint ranges are sound. The allocation lives as long as the
/// memory object, which in-flight requests keep alive through their
/// descriptor.
struct OwnedBytes {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for OwnedBytes {}
unsafe impl Sync for OwnedBytes {}

impl OwnedBytes {
    fn zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Self { ptr, len }
    }
}

impl Drop for OwnedBytes {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

/// Host RAM memory (`System`, `RegDma`, `ZeroCopy`, or `Socket` kinds).
/// `RegDma` memories are also RDMA-visible.
pub struct HostMemory {
    id: MemoryId,
    kind: MemoryKind,
    bytes: OwnedBytes,
}

impl HostMemory {
    pub fn new(id: MemoryId, kind: MemoryKind, size: usize) -> Arc<Self> {
        debug_assert!(kind.is_cpu_mapped());
        Arc::new(Self {
            id,
            kind,
            bytes: OwnedBytes::zeroed(size),
        })
    }
}

impl MemoryImpl for HostMemory {
    fn id(&self) -> MemoryId {
        self.id
    }

    fn kind(&self) -> MemoryKind {
        self.kind
    }

    fn size(&self) -> usize {
        self.bytes.len
    }

    fn get_direct_ptr(&self, offset: usize, len: usize) -> Option<*mut u8> {
        if offset + len > self.bytes.len {
            return None;
        }
        Some(unsafe { self.bytes.ptr.add(offset) })
    }

    fn get_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let ptr = self
            .get_direct_ptr(offset, dst.len())
            .ok_or(TransferError::OutOfBounds)?;
        unsafe { std::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn put_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        let ptr = self
            .get_direct_ptr(offset, src.len())
            .ok_or(TransferError::OutOfBounds)?;
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len()) };
        Ok(())
    }

    fn get_remote_addr(&self, offset: usize) -> Option<RemoteAddress> {
        if self.kind == MemoryKind::RegDma {
            Some(RemoteAddress {
                mem: self.id,
                offset: offset as u64,
            })
        } else {
            None
        }
    }

    fn get_rdma_info(&self) -> Option<Vec<u8>> {
        if self.kind == MemoryKind::RegDma {
            Some(self.id.0.to_le_bytes().to_vec())
        } else {
            None
        }
    }
}

/// Globally addressable memory. Only reachable through `get_bytes` /
/// `put_bytes`; never hands out direct pointers.
pub struct GlobalMemory {
    id: MemoryId,
    data: Mutex<Vec<u8>>,
}

impl GlobalMemory {
    pub fn new(id: MemoryId, size: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            data: Mutex::new(vec![0u8; size]),
        })
    }
}

impl MemoryImpl for GlobalMemory {
    fn id(&self) -> MemoryId {
        self.id
    }

    fn kind(&self) -> MemoryKind {
        MemoryKind::Global
    }

    fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn get_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let src = data
            .get(offset..offset + dst.len())
            .ok_or(TransferError::OutOfBounds)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn put_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let dst = data
            .get_mut(offset..offset + src.len())
            .ok_or(TransferError::OutOfBounds)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// Disk-backed memory: one file descriptor covering the whole memory.
pub struct DiskMemory {
    id: MemoryId,
    fd: OwnedFd,
    size: usize,
}

impl DiskMemory {
    pub fn new(id: MemoryId, fd: OwnedFd, size: usize) -> Arc<Self> {
        Arc::new(Self { id, fd, size })
    }
}

impl MemoryImpl for DiskMemory {
    fn id(&self) -> MemoryId {
        self.id
    }

    fn kind(&self) -> MemoryKind {
        MemoryKind::Disk
    }

    fn size(&self) -> usize {
        self.size
    }

    fn file_descriptor(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }
}

/// File-backed memory: a pre-opened fd plus a base offset within the file.
pub struct FileMemory {
    id: MemoryId,
    fd: OwnedFd,
    offset: usize,
    size: usize,
}

impl FileMemory {
    pub fn new(id: MemoryId, fd: OwnedFd, offset: usize, size: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            fd,
            offset,
            size,
        })
    }
}

impl MemoryImpl for FileMemory {
    fn id(&self) -> MemoryId {
        self.id
    }

    fn kind(&self) -> MemoryKind {
        MemoryKind::File
    }

    fn size(&self) -> usize {
        self.size
    }

    fn file_descriptor(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }

    fn file_offset(&self) -> usize {
        self.offset
    }
}

/// Synchronous hyperslab I/O against one HDF5 dataset. The HDF5 library
/// binding lives behind this trait; the engine only selects hyperslabs and
/// moves bytes.
pub trait Hdf5Dataset: Send + Sync {
    /// Number of bytes per element of the dataset's type.
    fn element_size(&self) -> usize;

    /// Bounds of the whole dataset, outermost dimension first.
    fn bounds(&self) -> &[u64];

    /// Read the hyperslab `offset..offset+extent` into `dst`.
    fn read_hyperslab(&self, offset: &[u64], extent: &[u64], dst: &mut [u8]) -> Result<()>;

    /// Write `src` over the hyperslab `offset..offset+extent`.
    fn write_hyperslab(&self, offset: &[u64], extent: &[u64], src: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens datasets on first touch for an [`HdfMemory`].
pub trait Hdf5DatasetOpener: Send + Sync {
    fn open(&self, filename: &str, dsetname: &str, read_only: bool)
    -> Result<Arc<dyn Hdf5Dataset>>;
}

/// HDF5-backed memory: a collection of datasets addressed by
/// (filename, dataset name) and opened lazily by the channel.
pub struct HdfMemory {
    id: MemoryId,
    opener: Box<dyn Hdf5DatasetOpener>,
}

impl HdfMemory {
    pub fn new(id: MemoryId, opener: Box<dyn Hdf5DatasetOpener>) -> Arc<Self> {
        Arc::new(Self { id, opener })
    }

    pub fn open_dataset(
        &self,
        filename: &str,
        dsetname: &str,
        read_only: bool,
    ) -> Result<Arc<dyn Hdf5Dataset>> {
        self.opener.open(filename, dsetname, read_only)
    }
}

impl MemoryImpl for HdfMemory {
    fn id(&self) -> MemoryId {
        self.id
    }

    fn kind(&self) -> MemoryKind {
        MemoryKind::Hdf
    }

    fn size(&self) -> usize {
        0
    }

    fn as_hdf(&self) -> Option<&HdfMemory> {
        Some(self)
    }
}

/// Local stand-in for a memory that lives on another node. Resolves RDMA
/// addresses for channels that push bytes across the wire; direct access is
/// refused.
pub struct RemoteMemoryProxy {
    id: MemoryId,
    kind: MemoryKind,
    rdma_visible: bool,
}

impl RemoteMemoryProxy {
    pub fn new(id: MemoryId, kind: MemoryKind, rdma_visible: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            rdma_visible,
        })
    }
}

impl MemoryImpl for RemoteMemoryProxy {
    fn id(&self) -> MemoryId {
        self.id
    }

    fn kind(&self) -> MemoryKind {
        self.kind
    }

    fn size(&self) -> usize {
        0
    }

    fn get_remote_addr(&self, offset: usize) -> Option<RemoteAddress> {
        self.rdma_visible.then_some(RemoteAddress {
            mem: self.id,
            offset: offset as u64,
        })
    }
}

/// Per-node table of memory implementations.
#[derive(Default)]
pub struct MemoryRegistry {
    memories: RwLock<HashMap<MemoryId, Arc<dyn MemoryImpl>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mem: Arc<dyn MemoryImpl>) {
        let prev = self.memories.write().unwrap().insert(mem.id(), mem);
        assert!(prev.is_none(), "memory registered twice");
    }

    pub fn lookup(&self, id: MemoryId) -> Option<Arc<dyn MemoryImpl>> {
        self.memories.read().unwrap().get(&id).cloned()
    }
}
