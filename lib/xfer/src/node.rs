// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-node assembly of the transfer engine: memories, descriptor queue,
//! channels, background workers, and the message dispatch that ties a node
//! into the cluster.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use derive_builder::Builder;
use derive_getters::Getters;

use crate::bgwork::BackgroundWorkManager;
use crate::channel::{ChannelManager, XferDesKind};
use crate::memory::{MemoryRegistry, NodeId};
use crate::message::{CreateXferDesMessage, MessageHandler, NetworkTransport, PortDesc, XferMessage};
use crate::port::{IbInfo, PortInit};
use crate::queue::XferDesQueue;
use crate::serdez::SerdezOp;
use crate::xferdes::{XferDes, XferDesCreateArgs};

/// Tunables for one engine node.
#[derive(Debug, Clone, Builder, Getters)]
#[builder(pattern = "owned")]
pub struct XferNodeConfig {
    node_id: NodeId,
    /// Progress worker threads in the background-work pool.
    #[builder(default = "2")]
    num_workers: usize,
    /// Cooperative time budget handed to each `progress_xd` call.
    #[builder(default = "Duration::from_micros(100)")]
    work_slice: Duration,
}

impl XferNodeConfig {
    pub fn builder() -> XferNodeConfigBuilder {
        XferNodeConfigBuilder::default()
    }
}

/// One engine node: everything a process contributes to the transfer DAG.
pub struct XferNode {
    node_id: NodeId,
    memories: Arc<MemoryRegistry>,
    queue: Arc<XferDesQueue>,
    channels: Arc<ChannelManager>,
    bgwork: Arc<BackgroundWorkManager>,
    serdez_table: RwLock<HashMap<u32, Arc<dyn SerdezOp>>>,
}

impl XferNode {
    pub fn new(node_id: NodeId, transport: Arc<dyn NetworkTransport>) -> Arc<Self> {
        let config = XferNodeConfig::builder()
            .node_id(node_id)
            .build()
            .expect("default node config is complete");
        Self::from_config(config, transport)
    }

    pub fn from_config(config: XferNodeConfig, transport: Arc<dyn NetworkTransport>) -> Arc<Self> {
        let node_id = *config.node_id();
        let memories = Arc::new(MemoryRegistry::new());
        let queue = XferDesQueue::new(node_id, memories.clone(), transport);
        let bgwork =
            BackgroundWorkManager::with_work_slice(*config.num_workers(), *config.work_slice());
        let channels = Arc::new(ChannelManager::new(node_id, bgwork.clone()));
        Arc::new(Self {
            node_id,
            memories,
            queue,
            channels,
            bgwork,
            serdez_table: RwLock::new(HashMap::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn memories(&self) -> &Arc<MemoryRegistry> {
        &self.memories
    }

    pub fn queue(&self) -> &Arc<XferDesQueue> {
        &self.queue
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn bgwork(&self) -> &Arc<BackgroundWorkManager> {
        &self.bgwork
    }

    /// Bind a serdez codec to an id usable in cross-node port descriptions.
    pub fn register_serdez(&self, id: u32, op: Arc<dyn SerdezOp>) {
        let prev = self.serdez_table.write().unwrap().insert(id, op);
        assert!(prev.is_none(), "serdez id registered twice");
    }

    pub fn lookup_serdez(&self, id: u32) -> Option<Arc<dyn SerdezOp>> {
        self.serdez_table.read().unwrap().get(&id).cloned()
    }

    /// Create a descriptor locally and hand it through the metadata-wait /
    /// enqueue lifecycle.
    pub fn create_xfer_des(&self, kind: XferDesKind, args: XferDesCreateArgs) -> Arc<XferDes> {
        let channel = self.channels.channel_for_kind(kind);
        let xd = XferDes::new(args, kind, channel, self.queue.clone());
        self.queue.enqueue_xfer_des(xd.clone());
        xd
    }

    /// Dispatch a descriptor creation to the node that will execute it.
    pub fn submit_create(&self, msg: CreateXferDesMessage) -> anyhow::Result<()> {
        let target = msg.guid.owner_node();
        if target == self.node_id {
            self.create_from_message(msg);
            Ok(())
        } else {
            self.queue.transport().send(
                self.node_id,
                target,
                XferMessage::CreateXferDes(Box::new(msg)),
            )
        }
    }

    fn create_from_message(&self, msg: CreateXferDesMessage) {
        let inputs = msg
            .inputs
            .iter()
            .map(|d| self.port_from_desc(d))
            .collect::<Vec<_>>();
        let outputs = msg
            .outputs
            .iter()
            .map(|d| self.port_from_desc(d))
            .collect::<Vec<_>>();
        let mut args =
            XferDesCreateArgs::new(msg.guid, msg.launch_node, inputs, outputs, msg.fence);
        args.priority = msg.priority;
        args.max_req_size = msg.max_req_size;
        args.max_reqs = msg.max_reqs;
        self.create_xfer_des(msg.kind, args);
    }

    fn port_from_desc(&self, desc: &PortDesc) -> PortInit {
        PortInit {
            mem: desc.mem,
            iter: desc.iter.instantiate(),
            serdez_op: desc.serdez_id.map(|id| {
                self.lookup_serdez(id)
                    .expect("serdez id not registered on this node")
            }),
            peer_guid: desc.peer_guid,
            peer_port_idx: desc.peer_port_idx,
            indirect_port_idx: desc.indirect_port_idx,
            ib_offset: desc.ib_offset,
            ib_size: desc.ib_size,
            port_type: desc.port_type,
        }
    }

    pub fn shutdown(&self) {
        self.channels.shutdown();
        self.bgwork.shutdown();
    }
}

impl MessageHandler for XferNode {
    fn handle_message(&self, sender: NodeId, msg: XferMessage) {
        match msg {
            XferMessage::UpdateBytesWrite {
                guid,
                port_idx,
                span_start,
                span_size,
            } => self
                .queue
                .update_pre_bytes_write(guid, port_idx, span_start, span_size),
            XferMessage::UpdateBytesRead {
                guid,
                port_idx,
                span_start,
                span_size,
            } => self
                .queue
                .update_next_bytes_read(guid, port_idx, span_start, span_size),
            XferMessage::UpdateBytesTotal {
                guid,
                port_idx,
                pre_bytes_total,
            } => self
                .queue
                .update_pre_bytes_total(guid, port_idx, pre_bytes_total),
            XferMessage::RemoteWrite(m) => {
                crate::channel::remote::handle_remote_write(&self.queue, sender, m)
            }
            XferMessage::RemoteWriteAck { request_id } => {
                self.channels.remote_write_channel().handle_ack(request_id)
            }
            XferMessage::NotifyXferDesComplete { fence_id, success } => {
                self.queue.handle_fence_complete(fence_id, success)
            }
            XferMessage::DestroyXferDes { guid } => self.queue.destroy_xfer_des(guid),
            XferMessage::CreateXferDes(m) => self.create_from_message(*m),
            XferMessage::FreeIntermediateBuffer {
                memory,
                offset,
                size,
            } => self.queue.free_ib(IbInfo {
                memory,
                offset,
                size,
            }),
        }
    }
}
