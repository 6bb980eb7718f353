// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Streaming data-transfer engine.
//!
//! Moves bytes between heterogeneous memories - host RAM, pinned RAM, GPU
//! framebuffers, on-node files, HDF5 datasets, and the RDMA-visible memory
//! of peer nodes - by composing a DAG of transfer descriptors, each bound to
//! a channel specialized for one class of copy. Descriptors stream data
//! through bounded circular intermediate buffers, giving pipelined
//! multi-hop transfers and cross-node flow control.
//!
//! The engine schedules bytes, not tasks: a higher-level planner decides
//! which transfers to run and hands the resulting descriptor graph to the
//! per-node [`node::XferNode`].

pub mod addrlist;
pub mod bgwork;
pub mod channel;
pub mod error;
pub mod iterator;
pub mod memory;
pub mod message;
pub mod node;
pub mod port;
pub mod queue;
pub mod request;
pub mod sequence;
pub mod serdez;
pub mod xferdes;

pub use addrlist::{AddressList, AddressListCursor};
pub use bgwork::{BackgroundWorkManager, ReadyEvent, TimeLimit};
pub use channel::{Channel, ChannelManager, PathInfo, PathQuery, XferDesKind};
pub use error::TransferError;
pub use iterator::{AddressInfo, AddressInfoHdf5, IteratorDesc, StepFlags, TransferIterator};
pub use memory::{MemoryId, MemoryImpl, MemoryKind, MemoryRegistry, NodeId, RemoteAddress};
pub use message::{LoopbackNetwork, NetworkTransport, XferMessage};
pub use node::{XferNode, XferNodeConfig};
pub use port::{ControlWord, IbInfo, PortInit, XferPort};
pub use queue::XferDesQueue;
pub use request::{Request, RequestDim};
pub use sequence::SequenceAssembler;
pub use serdez::SerdezOp;
pub use xferdes::{FenceHandle, XferDes, XferDesCreateArgs, XferDesId, XFERDES_NO_GUID};
