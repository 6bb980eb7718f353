// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::memory::MemoryId;

/// Errors surfaced by the transfer engine.
///
/// Saturation ("no data yet", "no space yet") is not an error; it is reported
/// as a "no work" return from `progress_xd`. Programming errors (impossible
/// endpoint kinds, requests against a channel that cannot carry them) panic.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no channel supports the requested path: {src:?} -> {dst:?}")]
    UnsupportedPath { src: MemoryId, dst: MemoryId },

    #[error("operation not supported by this memory: {0}")]
    NotSupported(&'static str),

    #[error("access outside the memory's bounds")]
    OutOfBounds,

    #[error("intermediate buffer pool exhausted")]
    IbExhausted,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
