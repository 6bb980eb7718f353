// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A request is one unit of work submitted to a channel: a 1D/2D/3D
//! geometry, source/destination offsets, port indices, and the sequence
//! positions the completion callbacks will acknowledge.

use std::sync::Arc;

use crate::iterator::StepFlags;
use crate::xferdes::XferDes;

/// Geometry of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDim {
    D1,
    D2,
    D3,
}

/// Per-side dimension allowances a channel grants to request generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFlags {
    pub src: StepFlags,
    pub dst: StepFlags,
}

impl RequestFlags {
    pub const LINEAR: RequestFlags = RequestFlags {
        src: StepFlags::LINEAR,
        dst: StepFlags::LINEAR,
    };

    pub const FULL: RequestFlags = RequestFlags {
        src: StepFlags::FULL,
        dst: StepFlags::FULL,
    };

    /// Source may be 2D while the destination stays contiguous (remote
    /// writes).
    pub const SRC_LINES_ONLY: RequestFlags = RequestFlags {
        src: StepFlags::PLANAR,
        dst: StepFlags::LINEAR,
    };

    pub fn any_lines(&self) -> bool {
        self.src.lines_ok || self.dst.lines_ok
    }

    pub fn any_planes(&self) -> bool {
        self.src.planes_ok || self.dst.planes_ok
    }
}

/// One unit of channel work.
pub struct Request {
    pub xd: Arc<XferDes>,
    pub src_port_idx: usize,
    pub dst_port_idx: usize,
    /// Position and length acknowledged on the input's `seq_local` when the
    /// read side completes.
    pub read_seq_pos: usize,
    pub read_seq_count: usize,
    /// Same for the output's `seq_local`.
    pub write_seq_pos: usize,
    pub write_seq_count: usize,
    pub dim: RequestDim,
    pub src_off: usize,
    pub dst_off: usize,
    /// Contiguous bytes per line.
    pub nbytes: usize,
    pub nlines: usize,
    pub src_str: usize,
    pub dst_str: usize,
    pub nplanes: usize,
    pub src_pstr: usize,
    pub dst_pstr: usize,
}

impl Request {
    pub fn total_bytes(&self) -> usize {
        self.nbytes * self.nlines * self.nplanes
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.dim {
            RequestDim::D1 => write!(
                f,
                "req{{{:?} {}->{} len={}}}",
                self.xd.guid(),
                self.src_off,
                self.dst_off,
                self.nbytes
            ),
            RequestDim::D2 => write!(
                f,
                "req{{{:?} {}->{} len={} lines={}({},{})}}",
                self.xd.guid(),
                self.src_off,
                self.dst_off,
                self.nbytes,
                self.nlines,
                self.src_str,
                self.dst_str
            ),
            RequestDim::D3 => write!(
                f,
                "req{{{:?} {}->{} len={} lines={}({},{}) planes={}({},{})}}",
                self.xd.guid(),
                self.src_off,
                self.dst_off,
                self.nbytes,
                self.nlines,
                self.src_str,
                self.dst_str,
                self.nplanes,
                self.src_pstr,
                self.dst_pstr
            ),
        }
    }
}

/// Raw pointer that crosses a thread boundary inside a request.
///
/// # Safety
///
/// The pointee is memory owned by a `MemoryImpl` the request's descriptor
/// keeps alive, and flow control guarantees no conflicting concurrent access
/// to the addressed range.
#[derive(Clone, Copy)]
pub struct SendPtr(pub *mut u8);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}
