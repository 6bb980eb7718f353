// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Descriptor ports and control-stream decoding.
//!
//! A port is one endpoint of a transfer descriptor. Its state is split in
//! two: fields touched by concurrent cross-node updates (sequence assemblers,
//! atomic byte counters) live in [`XferPort`] and are reachable through
//! `&self`; fields owned by the single progressing worker (iterator, address
//! list, cursor) live in [`PortProgress`] behind the descriptor's progress
//! lock.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::addrlist::{AddressList, AddressListCursor};
use crate::error::TransferError;
use crate::memory::{MemoryId, MemoryImpl};
use crate::sequence::SequenceAssembler;
use crate::serdez::SerdezOp;
use crate::xferdes::{XFERDES_NO_GUID, XferDesId};

/// Shared half of a port: safe to touch from update handlers while a worker
/// progresses the descriptor.
pub struct XferPort {
    pub mem: Option<Arc<dyn MemoryImpl>>,
    pub serdez_op: Option<Arc<dyn SerdezOp>>,
    /// Neighboring descriptor sharing an IB with this port;
    /// `XFERDES_NO_GUID` for a terminal port.
    pub peer_guid: XferDesId,
    pub peer_port_idx: usize,
    /// Port supplying indirection addresses for this one, if any.
    pub indirect_port_idx: Option<usize>,
    /// Whether this port produces addresses for another port.
    pub is_indirect_port: bool,
    /// Window within a circular intermediate buffer; `ib_size == 0` means
    /// this port is not an IB.
    pub ib_offset: usize,
    pub ib_size: usize,
    /// Must send `pre_bytes_total` downstream when the final count is known.
    pub needs_pbt_update: AtomicBool,
    /// Monotone count of bytes this port has fully consumed/produced.
    /// Written only by the progressing worker; atomic so update handlers can
    /// read it once `iteration_completed` is published.
    pub local_bytes_total: AtomicUsize,
    /// Conservative byte count used for external visibility (may run ahead
    /// of `local_bytes_total` while a serdez request is in flight).
    pub local_bytes_cons: AtomicUsize,
    /// Final byte count of the incoming stream; `usize::MAX` until the peer
    /// signals end-of-stream.
    pub remote_bytes_total: AtomicUsize,
    /// Bytes locally completed (read for inputs, written for outputs).
    pub seq_local: SequenceAssembler,
    /// Bytes known safe from the peer's perspective (readable data for
    /// inputs, writable window for IB outputs).
    pub seq_remote: SequenceAssembler,
}

impl XferPort {
    /// Sentinel for "end-of-stream not yet known".
    pub const TOTAL_UNKNOWN: usize = usize::MAX;
}

/// Progress-owned half of a port.
pub struct PortProgress {
    pub iter: Box<dyn crate::iterator::TransferIterator>,
    pub addrlist: AddressList,
    pub addrcursor: AddressListCursor,
}

/// Role a port plays in its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortType {
    Data,
    GatherControl,
    ScatterControl,
}

/// Steering state fed by a control port. `remaining_count` is
/// `usize::MAX` when no control port exists.
#[derive(Debug)]
pub struct ControlState {
    pub control_port_idx: Option<usize>,
    pub current_io_port: Option<usize>,
    pub remaining_count: usize,
    pub eos_received: bool,
}

impl ControlState {
    pub fn uncontrolled() -> Self {
        Self {
            control_port_idx: None,
            current_io_port: Some(0),
            remaining_count: usize::MAX,
            eos_received: false,
        }
    }

    pub fn controlled(control_port_idx: usize) -> Self {
        Self {
            control_port_idx: Some(control_port_idx),
            current_io_port: Some(0),
            remaining_count: 0,
            eos_received: false,
        }
    }
}

/// One 32-bit word of a control stream: low 7 bits are `port + 1`
/// (0 means skip), bit 7 is end-of-stream, the high 24 bits are the count
/// for this segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlWord(pub u32);

impl ControlWord {
    pub const BYTES: usize = std::mem::size_of::<u32>();

    pub fn encode(port: Option<usize>, count: usize, eos: bool) -> Self {
        let port_bits = match port {
            Some(p) => {
                debug_assert!(p < 0x7f);
                (p + 1) as u32
            }
            None => 0,
        };
        debug_assert!(count < (1 << 24));
        Self(((count as u32) << 8) | (u32::from(eos) << 7) | port_bits)
    }

    pub fn port(&self) -> Option<usize> {
        ((self.0 & 0x7f) as usize).checked_sub(1)
    }

    pub fn count(&self) -> usize {
        (self.0 >> 8) as usize
    }

    pub fn eos(&self) -> bool {
        (self.0 & 0x80) != 0
    }
}

/// One edge of the transfer DAG: a window in an intermediate-buffer memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbInfo {
    pub memory: MemoryId,
    pub offset: usize,
    pub size: usize,
}

/// First-fit allocator for intermediate-buffer windows within one memory.
/// Allocation happens on the memory's owner node; remote holders free their
/// windows with an RPC routed back here.
pub struct IbAllocator {
    memory: MemoryId,
    inner: Mutex<IbAllocInner>,
}

struct IbAllocInner {
    // offset -> size of each free extent, coalesced
    free: BTreeMap<usize, usize>,
}

impl IbAllocator {
    pub fn new(memory: MemoryId, size: usize) -> Self {
        let mut free = BTreeMap::new();
        free.insert(0, size);
        Self {
            memory,
            inner: Mutex::new(IbAllocInner { free }),
        }
    }

    pub fn memory(&self) -> MemoryId {
        self.memory
    }

    pub fn alloc(&self, size: usize) -> Result<IbInfo, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        let found = inner
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&ofs, &len)| (ofs, len));
        let Some((ofs, len)) = found else {
            return Err(TransferError::IbExhausted);
        };
        inner.free.remove(&ofs);
        if len > size {
            inner.free.insert(ofs + size, len - size);
        }
        Ok(IbInfo {
            memory: self.memory,
            offset: ofs,
            size,
        })
    }

    pub fn free(&self, offset: usize, size: usize) {
        let mut inner = self.inner.lock().unwrap();
        let mut ofs = offset;
        let mut len = size;
        // coalesce with the predecessor
        if let Some((&prev_ofs, &prev_len)) = inner.free.range(..ofs).next_back() {
            assert!(prev_ofs + prev_len <= ofs, "double free of IB window");
            if prev_ofs + prev_len == ofs {
                inner.free.remove(&prev_ofs);
                ofs = prev_ofs;
                len += prev_len;
            }
        }
        // and with the successor
        if let Some((&next_ofs, &next_len)) = inner.free.range(ofs + len..).next() {
            if ofs + len == next_ofs {
                inner.free.remove(&next_ofs);
                len += next_len;
            }
        }
        inner.free.insert(ofs, len);
    }
}

/// Construction-time description of one port.
pub struct PortInit {
    pub mem: Option<MemoryId>,
    pub iter: Box<dyn crate::iterator::TransferIterator>,
    pub serdez_op: Option<Arc<dyn SerdezOp>>,
    pub peer_guid: XferDesId,
    pub peer_port_idx: usize,
    pub indirect_port_idx: Option<usize>,
    pub ib_offset: usize,
    pub ib_size: usize,
    pub port_type: PortType,
}

impl PortInit {
    /// Plain terminal data port over a memory.
    pub fn data(mem: MemoryId, iter: Box<dyn crate::iterator::TransferIterator>) -> Self {
        Self {
            mem: Some(mem),
            iter,
            serdez_op: None,
            peer_guid: XFERDES_NO_GUID,
            peer_port_idx: 0,
            indirect_port_idx: None,
            ib_offset: 0,
            ib_size: 0,
            port_type: PortType::Data,
        }
    }

    pub fn with_serdez(mut self, op: Arc<dyn SerdezOp>) -> Self {
        self.serdez_op = Some(op);
        self
    }

    /// Bind this port to an IB window shared with `peer_guid`/`peer_port`.
    pub fn with_ib(mut self, ib: IbInfo, peer_guid: XferDesId, peer_port: usize) -> Self {
        self.ib_offset = ib.offset;
        self.ib_size = ib.size;
        self.peer_guid = peer_guid;
        self.peer_port_idx = peer_port;
        self
    }

    pub fn gather_control(mut self) -> Self {
        self.port_type = PortType::GatherControl;
        self
    }

    pub fn scatter_control(mut self) -> Self {
        self.port_type = PortType::ScatterControl;
        self
    }
}

impl XferPort {
    pub(crate) fn from_init(init: &PortInit, mem: Option<Arc<dyn MemoryImpl>>, is_input: bool) -> Self {
        let port = Self {
            mem,
            serdez_op: init.serdez_op.clone(),
            peer_guid: init.peer_guid,
            peer_port_idx: init.peer_port_idx,
            indirect_port_idx: init.indirect_port_idx,
            is_indirect_port: false,
            ib_offset: init.ib_offset,
            ib_size: init.ib_size,
            needs_pbt_update: AtomicBool::new(!is_input && init.peer_guid != XFERDES_NO_GUID),
            local_bytes_total: AtomicUsize::new(0),
            local_bytes_cons: AtomicUsize::new(0),
            remote_bytes_total: AtomicUsize::new(Self::TOTAL_UNKNOWN),
            seq_local: SequenceAssembler::new(),
            seq_remote: SequenceAssembler::new(),
        };
        // the first ib_size byte locations of an IB output are freely
        // writable
        if !is_input && port.ib_size > 0 {
            port.seq_remote.add_span(0, port.ib_size);
        }
        port
    }

    /// Bytes the peer has finished with (readable for inputs, writable for
    /// outputs), starting at stream position `start`.
    pub fn peer_bytes_ready(&self, start: usize, max: usize) -> usize {
        self.seq_remote.span_exists(start, max)
    }

    pub fn remote_total(&self) -> Option<usize> {
        let v = self.remote_bytes_total.load(Ordering::Acquire);
        (v != Self::TOTAL_UNKNOWN).then_some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_word_roundtrip() {
        let w = ControlWord::encode(Some(1), 100, false);
        assert_eq!(w.port(), Some(1));
        assert_eq!(w.count(), 100);
        assert!(!w.eos());

        let w = ControlWord::encode(None, 0, true);
        assert_eq!(w.port(), None);
        assert_eq!(w.count(), 0);
        assert!(w.eos());

        let w = ControlWord::encode(Some(0), 50, true);
        assert_eq!(w.port(), Some(0));
        assert_eq!(w.count(), 50);
        assert!(w.eos());
    }

    #[test]
    fn test_ib_allocator_first_fit_and_coalesce() {
        let alloc = IbAllocator::new(MemoryId::new(0, 0), 1024);
        let a = alloc.alloc(256).unwrap();
        let b = alloc.alloc(256).unwrap();
        let c = alloc.alloc(512).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(c.offset, 512);
        assert!(alloc.alloc(1).is_err());

        // free middle, then ends; everything coalesces back
        alloc.free(b.offset, b.size);
        alloc.free(a.offset, a.size);
        alloc.free(c.offset, c.size);
        let all = alloc.alloc(1024).unwrap();
        assert_eq!(all.offset, 0);
    }

    #[test]
    fn test_ib_output_window_preseeded() {
        let init = PortInit::data(
            MemoryId::new(0, 0),
            Box::new(crate::iterator::WrappingFifoIterator::new(0, 128)),
        )
        .with_ib(
            IbInfo {
                memory: MemoryId::new(0, 0),
                offset: 0,
                size: 128,
            },
            XferDesId(42),
            0,
        );
        let out_port = XferPort::from_init(&init, None, false);
        assert_eq!(out_port.peer_bytes_ready(0, 4096), 128);
        let in_port = XferPort::from_init(&init, None, true);
        assert_eq!(in_port.peer_bytes_ready(0, 4096), 0);
    }
}
