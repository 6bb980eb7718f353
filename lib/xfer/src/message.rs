// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cross-node update protocol.
//!
//! The engine defines *what* messages exist and what they carry; how they go
//! over a wire belongs to the network module behind [`NetworkTransport`]. The
//! in-process [`LoopbackNetwork`] used by tests still round-trips every
//! message through its serde encoding so the payload definitions stay honest.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::channel::XferDesKind;
use crate::iterator::IteratorDesc;
use crate::memory::{MemoryId, NodeId, RemoteAddress};
use crate::port::PortType;
use crate::xferdes::{FenceHandle, XferDesId};

/// Serializable port description for cross-node descriptor creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDesc {
    pub mem: Option<MemoryId>,
    pub iter: IteratorDesc,
    /// Key into the node-local serdez table, if this port carries a codec.
    pub serdez_id: Option<u32>,
    pub peer_guid: XferDesId,
    pub peer_port_idx: usize,
    pub indirect_port_idx: Option<usize>,
    pub ib_offset: usize,
    pub ib_size: usize,
    pub port_type: PortType,
}

/// Dispatch a descriptor creation to its execution node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateXferDesMessage {
    pub guid: XferDesId,
    pub launch_node: NodeId,
    pub kind: XferDesKind,
    pub inputs: Vec<PortDesc>,
    pub outputs: Vec<PortDesc>,
    pub priority: i32,
    pub max_req_size: usize,
    pub max_reqs: usize,
    pub fence: FenceHandle,
}

/// A remote-write data message. Fuses the payload delivery with the
/// `UpdateBytesWrite` (and, at end-of-stream, `UpdateBytesTotal`) that the
/// downstream descriptor needs, so a chunk costs one message plus one ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteWriteMessage {
    pub target: RemoteAddress,
    /// Descriptor consuming these bytes on the target node;
    /// `XFERDES_NO_GUID` if the write lands in terminal memory.
    pub next_xd_guid: XferDesId,
    pub next_port_idx: usize,
    pub span_start: usize,
    /// Folded end-of-stream total, when known.
    pub pre_bytes_total: Option<usize>,
    /// Keys the ack back to the sender's in-flight request.
    pub request_id: u64,
    pub data: Vec<u8>,
}

/// All control-plane messages between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum XferMessage {
    /// Producer reports new output bytes to the consumer.
    UpdateBytesWrite {
        guid: XferDesId,
        port_idx: usize,
        span_start: usize,
        span_size: usize,
    },
    /// Consumer reports IB slots freed back to the producer.
    UpdateBytesRead {
        guid: XferDesId,
        port_idx: usize,
        span_start: usize,
        span_size: usize,
    },
    /// Producer reveals the final byte count (end of stream).
    UpdateBytesTotal {
        guid: XferDesId,
        port_idx: usize,
        pre_bytes_total: usize,
    },
    RemoteWrite(RemoteWriteMessage),
    RemoteWriteAck {
        request_id: u64,
    },
    /// Descriptor completion reported back to the launch node.
    NotifyXferDesComplete {
        fence_id: u64,
        success: bool,
    },
    DestroyXferDes {
        guid: XferDesId,
    },
    CreateXferDes(Box<CreateXferDesMessage>),
    /// Return an intermediate-buffer window to its owner node.
    FreeIntermediateBuffer {
        memory: MemoryId,
        offset: usize,
        size: usize,
    },
}

/// Delivers engine messages between nodes. Implementations own the wire
/// encoding; the engine only guarantees the payloads serialize.
pub trait NetworkTransport: Send + Sync {
    fn send(&self, from: NodeId, target: NodeId, msg: XferMessage) -> Result<()>;
}

/// Receives messages on behalf of a node.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, sender: NodeId, msg: XferMessage);
}

/// In-process transport connecting several engine nodes; messages are
/// encoded and decoded on the way through so payload compatibility is
/// exercised even without a real network.
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: RwLock<HashMap<NodeId, Arc<dyn MessageHandler>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, node: NodeId, handler: Arc<dyn MessageHandler>) {
        let prev = self.nodes.write().unwrap().insert(node, handler);
        assert!(prev.is_none(), "node attached twice");
    }
}

impl NetworkTransport for LoopbackNetwork {
    fn send(&self, from: NodeId, target: NodeId, msg: XferMessage) -> Result<()> {
        let handler = self
            .nodes
            .read()
            .unwrap()
            .get(&target)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no node {target} attached"))?;
        let bytes = bincode::serde::encode_to_vec(&msg, bincode::config::standard())?;
        let (decoded, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        handler.handle_message(from, decoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<(NodeId, XferMessage)>>,
    }

    impl MessageHandler for Recorder {
        fn handle_message(&self, sender: NodeId, msg: XferMessage) {
            self.seen.lock().unwrap().push((sender, msg));
        }
    }

    #[test]
    fn test_loopback_roundtrip() {
        let net = LoopbackNetwork::new();
        let rec = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        net.attach(1, rec.clone());

        net.send(
            0,
            1,
            XferMessage::UpdateBytesWrite {
                guid: XferDesId::new(1, 7),
                port_idx: 2,
                span_start: 4096,
                span_size: 512,
            },
        )
        .unwrap();

        let seen = rec.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 0);
        match &seen[0].1 {
            XferMessage::UpdateBytesWrite {
                guid,
                port_idx,
                span_start,
                span_size,
            } => {
                assert_eq!(*guid, XferDesId::new(1, 7));
                assert_eq!(*port_idx, 2);
                assert_eq!(*span_start, 4096);
                assert_eq!(*span_size, 512);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(net.send(0, 9, XferMessage::DestroyXferDes { guid: XferDesId(3) }).is_err());
    }

    #[test]
    fn test_remote_write_message_encodes() {
        let msg = XferMessage::RemoteWrite(RemoteWriteMessage {
            target: RemoteAddress {
                mem: MemoryId::new(1, 0),
                offset: 64,
            },
            next_xd_guid: XferDesId::new(1, 3),
            next_port_idx: 0,
            span_start: 0,
            pre_bytes_total: Some(4096),
            request_id: 17,
            data: vec![1, 2, 3],
        });
        let bytes = bincode::serde::encode_to_vec(&msg, bincode::config::standard()).unwrap();
        let (back, _): (XferMessage, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        match back {
            XferMessage::RemoteWrite(m) => {
                assert_eq!(m.data, vec![1, 2, 3]);
                assert_eq!(m.pre_bytes_total, Some(4096));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
