// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Node-local registry of transfer descriptors.
//!
//! Routes cross-node counter updates to the right descriptor by GUID.
//! Updates that arrive before the descriptor's local creation are parked in
//! a pending structure and merged in at registration time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::oneshot;

use crate::memory::{MemoryId, MemoryRegistry, NodeId};
use crate::message::{NetworkTransport, XferMessage};
use crate::port::{IbAllocator, IbInfo};
use crate::sequence::SequenceAssembler;
use crate::xferdes::{FenceHandle, XferDes, XferDesId};

/// Registry slot: either the live descriptor, or updates waiting for it.
#[derive(Default)]
struct XferDesWithUpdates {
    xd: Option<Arc<XferDes>>,
    seq_pre_write: HashMap<usize, SequenceAssembler>,
    pre_bytes_total: HashMap<usize, usize>,
}

/// Per-node singleton owning descriptor routing, completion fences, and IB
/// windows.
pub struct XferDesQueue {
    node_id: NodeId,
    memories: Arc<MemoryRegistry>,
    transport: Arc<dyn NetworkTransport>,
    guid_to_xd: RwLock<HashMap<XferDesId, XferDesWithUpdates>>,
    fences: Mutex<HashMap<u64, oneshot::Sender<bool>>>,
    ib_allocators: RwLock<HashMap<MemoryId, Arc<IbAllocator>>>,
    next_guid_index: AtomicU64,
    next_fence_id: AtomicU64,
}

impl XferDesQueue {
    pub fn new(
        node_id: NodeId,
        memories: Arc<MemoryRegistry>,
        transport: Arc<dyn NetworkTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            memories,
            transport,
            guid_to_xd: RwLock::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            ib_allocators: RwLock::new(HashMap::new()),
            next_guid_index: AtomicU64::new(1),
            next_fence_id: AtomicU64::new(1),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn memories(&self) -> &Arc<MemoryRegistry> {
        &self.memories
    }

    pub fn transport(&self) -> &Arc<dyn NetworkTransport> {
        &self.transport
    }

    /// Allocate a GUID for a descriptor that will execute on
    /// `execution_node`. The launching node's id goes into the index bits,
    /// so planners on different nodes never collide.
    pub fn alloc_guid(&self, execution_node: NodeId) -> XferDesId {
        let counter = self.next_guid_index.fetch_add(1, Ordering::Relaxed);
        debug_assert!(counter < u32::MAX as u64);
        let index = ((self.node_id as u64) << 32) | counter;
        XferDesId::new(execution_node, index)
    }

    // ------------------------------------------------------------------
    // completion fences

    /// Register a fence on this (launch) node; the receiver resolves with
    /// the descriptor's success flag.
    pub fn register_fence(&self) -> (FenceHandle, oneshot::Receiver<bool>) {
        let fence_id = self.next_fence_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.fences.lock().unwrap().insert(fence_id, tx);
        (
            FenceHandle {
                launch_node: self.node_id,
                fence_id,
            },
            rx,
        )
    }

    /// Mark a fence finished, locally or through the network.
    pub fn mark_fence(&self, fence: FenceHandle, success: bool) {
        if fence.launch_node == self.node_id {
            if let Some(tx) = self.fences.lock().unwrap().remove(&fence.fence_id) {
                let _ = tx.send(success);
            }
        } else {
            let _ = self.transport.send(
                self.node_id,
                fence.launch_node,
                XferMessage::NotifyXferDesComplete {
                    fence_id: fence.fence_id,
                    success,
                },
            );
        }
    }

    pub(crate) fn handle_fence_complete(&self, fence_id: u64, success: bool) {
        if let Some(tx) = self.fences.lock().unwrap().remove(&fence_id) {
            let _ = tx.send(success);
        }
    }

    // ------------------------------------------------------------------
    // counter updates

    /// Producer -> consumer: new bytes written into the consumer's input.
    pub fn update_pre_bytes_write(
        &self,
        xd_guid: XferDesId,
        port_idx: usize,
        span_start: usize,
        span_size: usize,
    ) {
        if xd_guid.owner_node() == self.node_id {
            let xd = {
                let mut map = self.guid_to_xd.write().unwrap();
                let entry = map.entry(xd_guid).or_default();
                match &entry.xd {
                    Some(xd) => Some(xd.clone()),
                    None => {
                        entry
                            .seq_pre_write
                            .entry(port_idx)
                            .or_default()
                            .add_span(span_start, span_size);
                        None
                    }
                }
            };
            if let Some(xd) = xd {
                xd.update_pre_bytes_write(port_idx, span_start, span_size);
            }
        } else {
            let _ = self.transport.send(
                self.node_id,
                xd_guid.owner_node(),
                XferMessage::UpdateBytesWrite {
                    guid: xd_guid,
                    port_idx,
                    span_start,
                    span_size,
                },
            );
        }
    }

    /// Producer -> consumer: the stream's final byte count.
    pub fn update_pre_bytes_total(&self, xd_guid: XferDesId, port_idx: usize, total: usize) {
        if xd_guid.owner_node() == self.node_id {
            let xd = {
                let mut map = self.guid_to_xd.write().unwrap();
                let entry = map.entry(xd_guid).or_default();
                match &entry.xd {
                    Some(xd) => Some(xd.clone()),
                    None => {
                        // never more than one total per port
                        let prev = entry.pre_bytes_total.insert(port_idx, total);
                        assert!(prev.is_none(), "duplicate pre_bytes_total");
                        None
                    }
                }
            };
            if let Some(xd) = xd {
                xd.update_pre_bytes_total(port_idx, total);
            }
        } else {
            let _ = self.transport.send(
                self.node_id,
                xd_guid.owner_node(),
                XferMessage::UpdateBytesTotal {
                    guid: xd_guid,
                    port_idx,
                    pre_bytes_total: total,
                },
            );
        }
    }

    /// Consumer -> producer: IB slots freed.
    pub fn update_next_bytes_read(
        &self,
        xd_guid: XferDesId,
        port_idx: usize,
        span_start: usize,
        span_size: usize,
    ) {
        if xd_guid.owner_node() == self.node_id {
            let xd = self
                .guid_to_xd
                .read()
                .unwrap()
                .get(&xd_guid)
                .and_then(|e| e.xd.clone());
            // a missing producer has already completed; the update can be
            // dropped safely
            if let Some(xd) = xd {
                xd.update_next_bytes_read(port_idx, span_start, span_size);
            }
        } else {
            let _ = self.transport.send(
                self.node_id,
                xd_guid.owner_node(),
                XferMessage::UpdateBytesRead {
                    guid: xd_guid,
                    port_idx,
                    span_start,
                    span_size,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // lifecycle

    /// Register a locally created descriptor, merging any updates that beat
    /// it here, then wait for iterator metadata and hand it to its channel.
    pub fn enqueue_xfer_des(self: &Arc<Self>, xd: Arc<XferDes>) {
        let pending = xd.request_metadata();
        if pending.is_empty() {
            self.register_and_arm(xd);
            return;
        }
        tracing::debug!(xd = ?xd.guid(), waiting = pending.len(), "xd metadata wait");
        let remaining = Arc::new(AtomicU64::new(pending.len() as u64));
        for ev in pending {
            let queue = self.clone();
            let xd = xd.clone();
            let remaining = remaining.clone();
            ev.add_waiter(Box::new(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    tracing::debug!(xd = ?xd.guid(), "xd metadata ready");
                    queue.register_and_arm(xd);
                }
            }));
        }
    }

    fn register_and_arm(&self, xd: Arc<XferDes>) {
        {
            let mut map = self.guid_to_xd.write().unwrap();
            let entry = map.entry(xd.guid()).or_default();
            assert!(entry.xd.is_none(), "descriptor registered twice");
            for (&port_idx, &total) in &entry.pre_bytes_total {
                xd.input_ports[port_idx]
                    .remote_bytes_total
                    .store(total, Ordering::Release);
            }
            for (&port_idx, seq) in entry.seq_pre_write.iter() {
                xd.input_ports[port_idx].seq_remote.swap(seq);
            }
            entry.seq_pre_write.clear();
            entry.pre_bytes_total.clear();
            entry.xd = Some(xd.clone());
        }
        xd.update_progress();
    }

    pub fn lookup(&self, guid: XferDesId) -> Option<Arc<XferDes>> {
        self.guid_to_xd
            .read()
            .unwrap()
            .get(&guid)
            .and_then(|e| e.xd.clone())
    }

    /// Tear down a descriptor, locally or by message to its execution node.
    pub fn destroy_xfer_des(&self, guid: XferDesId) {
        if guid.owner_node() == self.node_id {
            let entry = self.guid_to_xd.write().unwrap().remove(&guid);
            if let Some(entry) = entry {
                if let Some(xd) = entry.xd {
                    tracing::debug!(xd = ?guid, "destroying transfer descriptor");
                    drop(xd);
                }
            }
        } else {
            let _ = self.transport.send(
                self.node_id,
                guid.owner_node(),
                XferMessage::DestroyXferDes { guid },
            );
        }
    }

    // ------------------------------------------------------------------
    // intermediate buffers

    /// Make a memory's IB space allocatable on this (owner) node.
    pub fn register_ib_allocator(&self, memory: MemoryId, size: usize) {
        let prev = self
            .ib_allocators
            .write()
            .unwrap()
            .insert(memory, Arc::new(IbAllocator::new(memory, size)));
        assert!(prev.is_none(), "IB allocator registered twice");
    }

    /// Allocate an IB window in a local memory (the planner's side of the
    /// RPC protocol).
    pub fn alloc_ib(&self, memory: MemoryId, size: usize) -> Result<IbInfo, crate::error::TransferError> {
        assert_eq!(memory.owner_node(), self.node_id, "IB alloc is owner-local");
        let alloc = self
            .ib_allocators
            .read()
            .unwrap()
            .get(&memory)
            .cloned()
            .expect("no IB allocator for memory");
        alloc.alloc(size)
    }

    /// Free an IB window, routing to the memory's owner node if needed.
    pub fn free_ib(&self, ib: IbInfo) {
        if ib.memory.owner_node() == self.node_id {
            if let Some(alloc) = self.ib_allocators.read().unwrap().get(&ib.memory).cloned() {
                alloc.free(ib.offset, ib.size);
            }
        } else {
            let _ = self.transport.send(
                self.node_id,
                ib.memory.owner_node(),
                XferMessage::FreeIntermediateBuffer {
                    memory: ib.memory,
                    offset: ib.offset,
                    size: ib.size,
                },
            );
        }
    }
}
