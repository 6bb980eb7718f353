// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end transfers through full engine nodes: single hops, pipelined
//! intermediate buffers, cross-node pushes, serdez streams, and steered
//! gathers.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rstest::rstest;
use tokio::sync::oneshot;

use dynamo_xfer::channel::XferDesKind;
use dynamo_xfer::iterator::{
    GatedIterator, Hdf5Iterator, LinearIterator, RectIterator, SpanIterator, WrappingFifoIterator,
};
use dynamo_xfer::memory::{
    GlobalMemory, Hdf5Dataset, Hdf5DatasetOpener, HdfMemory, HostMemory, MemoryId, MemoryImpl,
    MemoryKind, RemoteMemoryProxy,
};
use dynamo_xfer::message::{NetworkTransport, XferMessage};
use dynamo_xfer::port::{ControlWord, PortInit};
use dynamo_xfer::serdez::SerdezOp;
use dynamo_xfer::{LoopbackNetwork, NodeId, TimeLimit, XferDesCreateArgs, XferNode};

fn wait_fence(mut rx: oneshot::Receiver<bool>) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match rx.try_recv() {
            Ok(v) => return v,
            Err(oneshot::error::TryRecvError::Empty) => {
                assert!(Instant::now() < deadline, "transfer timed out");
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(oneshot::error::TryRecvError::Closed) => panic!("fence dropped"),
        }
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 + 7) as u8).collect()
}

fn host_mem(node: &XferNode, index: u32, kind: MemoryKind, size: usize) -> Arc<HostMemory> {
    let mem = HostMemory::new(MemoryId::new(node.node_id(), index), kind, size);
    node.memories().register(mem.clone());
    mem
}

fn single_node() -> (Arc<LoopbackNetwork>, Arc<XferNode>) {
    let net = LoopbackNetwork::new();
    let node = XferNode::new(0, net.clone());
    net.attach(0, node.clone());
    (net, node)
}

#[test]
fn test_host_to_host_1d_128k() {
    let (_net, node) = single_node();
    let len = 128 << 10;
    let src = host_mem(&node, 0, MemoryKind::System, len);
    let dst = host_mem(&node, 1, MemoryKind::System, len);
    let data = pattern(len);
    src.put_bytes(0, &data).unwrap();

    let guid = node.queue().alloc_guid(0);
    let (fence, rx) = node.queue().register_fence();
    let xd = node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![PortInit::data(src.id(), Box::new(LinearIterator::new(0, len)))],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, len)))],
            fence,
        ),
    );

    assert!(wait_fence(rx));
    assert!(xd.iteration_completed());
    assert!(xd.transfer_completed());
    assert_eq!(xd.output_ports[0].seq_local.span_exists(0, len), len);
    assert_eq!(
        xd.output_ports[0].local_bytes_total.load(Ordering::Acquire),
        len
    );

    let mut out = vec![0u8; len];
    dst.get_bytes(0, &mut out).unwrap();
    assert_eq!(out, data);

    // progress on a completed descriptor is a no-op
    assert!(!xd.channel().progress_xd(&xd, TimeLimit::unlimited()));
    node.queue().destroy_xfer_des(guid);
    node.shutdown();
}

#[test]
fn test_host_to_host_unaligned() {
    let (_net, node) = single_node();
    let len = 8192 + 13;
    let src = host_mem(&node, 0, MemoryKind::System, 16 << 10);
    let dst = host_mem(&node, 1, MemoryKind::System, 16 << 10);
    let data = pattern(len);
    src.put_bytes(3, &data).unwrap();

    let guid = node.queue().alloc_guid(0);
    let (fence, rx) = node.queue().register_fence();
    node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![PortInit::data(src.id(), Box::new(LinearIterator::new(3, len)))],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(5, len)))],
            fence,
        ),
    );

    assert!(wait_fence(rx));
    let mut out = vec![0u8; len];
    dst.get_bytes(5, &mut out).unwrap();
    assert_eq!(out, data);
    node.shutdown();
}

#[test]
fn test_two_hop_through_small_ib() {
    let (_net, node) = single_node();
    let len = 1 << 20;
    let ib_size = 64 << 10;
    let src = host_mem(&node, 0, MemoryKind::System, len);
    let dst = host_mem(&node, 1, MemoryKind::System, len);
    let ib_mem = host_mem(&node, 2, MemoryKind::System, ib_size);
    node.queue().register_ib_allocator(ib_mem.id(), ib_size);
    let ib = node.queue().alloc_ib(ib_mem.id(), ib_size).unwrap();

    let data = pattern(len);
    src.put_bytes(0, &data).unwrap();

    let guid_a = node.queue().alloc_guid(0);
    let guid_b = node.queue().alloc_guid(0);
    let (fence_a, rx_a) = node.queue().register_fence();
    let (fence_b, rx_b) = node.queue().register_fence();

    node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid_a,
            0,
            vec![PortInit::data(src.id(), Box::new(LinearIterator::new(0, len)))],
            vec![
                PortInit::data(
                    ib_mem.id(),
                    Box::new(WrappingFifoIterator::new(ib.offset, ib.size)),
                )
                .with_ib(ib, guid_b, 0),
            ],
            fence_a,
        ),
    );
    let xd_b = node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid_b,
            0,
            vec![
                PortInit::data(
                    ib_mem.id(),
                    Box::new(WrappingFifoIterator::new(ib.offset, ib.size)),
                )
                .with_ib(ib, guid_a, 0),
            ],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, len)))],
            fence_b,
        ),
    );

    assert!(wait_fence(rx_a));
    assert!(wait_fence(rx_b));
    assert_eq!(
        xd_b.input_ports[0].remote_bytes_total.load(Ordering::Acquire),
        len
    );

    let mut out = vec![0u8; len];
    dst.get_bytes(0, &mut out).unwrap();
    assert_eq!(out, data);

    node.queue().destroy_xfer_des(guid_a);
    node.queue().destroy_xfer_des(guid_b);
    // the IB window came back to the allocator
    let again = node.queue().alloc_ib(ib_mem.id(), ib_size).unwrap();
    assert_eq!(again.offset, 0);
    node.shutdown();
}

#[test]
fn test_metadata_wait_defers_enqueue() {
    let (_net, node) = single_node();
    let len = 4096;
    let src = host_mem(&node, 0, MemoryKind::System, len);
    let dst = host_mem(&node, 1, MemoryKind::System, len);
    let data = pattern(len);
    src.put_bytes(0, &data).unwrap();

    let ready = dynamo_xfer::ReadyEvent::new();
    let guid = node.queue().alloc_guid(0);
    let (fence, rx) = node.queue().register_fence();
    node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![PortInit::data(
                src.id(),
                Box::new(GatedIterator::new(
                    Box::new(LinearIterator::new(0, len)),
                    ready.clone(),
                )),
            )],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, len)))],
            fence,
        ),
    );

    // parked until the metadata event fires
    std::thread::sleep(Duration::from_millis(20));
    assert!(node.queue().lookup(guid).is_none());

    ready.trigger();
    assert!(wait_fence(rx));
    let mut out = vec![0u8; len];
    dst.get_bytes(0, &mut out).unwrap();
    assert_eq!(out, data);
    node.shutdown();
}

#[test]
fn test_empty_transfer_still_completes() {
    let (_net, node) = single_node();
    let src = host_mem(&node, 0, MemoryKind::System, 64);
    let dst = host_mem(&node, 1, MemoryKind::System, 64);
    let ib_mem = host_mem(&node, 2, MemoryKind::System, 64);
    node.queue().register_ib_allocator(ib_mem.id(), 64);
    let ib = node.queue().alloc_ib(ib_mem.id(), 64).unwrap();

    let guid_a = node.queue().alloc_guid(0);
    let guid_b = node.queue().alloc_guid(0);
    let (fence_a, rx_a) = node.queue().register_fence();
    let (fence_b, rx_b) = node.queue().register_fence();

    node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid_a,
            0,
            vec![PortInit::data(src.id(), Box::new(LinearIterator::new(0, 0)))],
            vec![
                PortInit::data(ib_mem.id(), Box::new(WrappingFifoIterator::new(0, 64)))
                    .with_ib(ib, guid_b, 0),
            ],
            fence_a,
        ),
    );
    let xd_b = node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid_b,
            0,
            vec![
                PortInit::data(ib_mem.id(), Box::new(WrappingFifoIterator::new(0, 64)))
                    .with_ib(ib, guid_a, 0),
            ],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, 0)))],
            fence_b,
        ),
    );

    assert!(wait_fence(rx_a));
    assert!(wait_fence(rx_b));
    // the zero-byte total still arrived exactly once
    assert_eq!(
        xd_b.input_ports[0].remote_bytes_total.load(Ordering::Acquire),
        0
    );
    node.shutdown();
}

#[test]
fn test_rect_3d_to_linear_flattening() {
    let (_net, node) = single_node();
    // 2 planes x 4 lines x 16 bytes scattered in a 1 KiB region
    let src = host_mem(&node, 0, MemoryKind::System, 1024);
    let dst = host_mem(&node, 1, MemoryKind::System, 128);
    let backing = pattern(1024);
    src.put_bytes(0, &backing).unwrap();

    let guid = node.queue().alloc_guid(0);
    let (fence, rx) = node.queue().register_fence();
    node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![PortInit::data(
                src.id(),
                Box::new(RectIterator::new(0, 16, 4, 32, 2, 512)),
            )],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, 128)))],
            fence,
        ),
    );
    assert!(wait_fence(rx));

    let mut out = vec![0u8; 128];
    dst.get_bytes(0, &mut out).unwrap();
    let mut expect = Vec::new();
    for p in 0..2 {
        for l in 0..4 {
            let base = p * 512 + l * 32;
            expect.extend_from_slice(&backing[base..base + 16]);
        }
    }
    assert_eq!(out, expect);
    node.shutdown();
}

#[test]
fn test_host_to_file_with_tail() {
    let (_net, node) = single_node();
    let total = 1024 * 4096 + 512;
    let src = host_mem(&node, 0, MemoryKind::System, total);
    let data = pattern(total);
    src.put_bytes(0, &data).unwrap();

    let path = std::env::temp_dir().join(format!("dynamo-xfer-test-{}", std::process::id()));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let file_mem = dynamo_xfer::memory::FileMemory::new(
        MemoryId::new(0, 1),
        std::os::fd::OwnedFd::from(file),
        0,
        total,
    );
    node.memories().register(file_mem.clone());

    let guid = node.queue().alloc_guid(0);
    let (fence, rx) = node.queue().register_fence();
    node.create_xfer_des(
        XferDesKind::FileWrite,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![PortInit::data(src.id(), Box::new(LinearIterator::new(0, total)))],
            vec![PortInit::data(
                file_mem.id(),
                Box::new(LinearIterator::new(0, total)),
            )],
            fence,
        ),
    );
    assert!(wait_fence(rx));

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), total);
    assert_eq!(written, data);
    let _ = std::fs::remove_file(&path);
    node.shutdown();
}

#[test]
fn test_global_memory_roundtrip() {
    let (_net, node) = single_node();
    let len = 32 << 10;
    let src = host_mem(&node, 0, MemoryKind::System, len);
    let dst = host_mem(&node, 1, MemoryKind::System, len);
    let global = GlobalMemory::new(MemoryId::new(0, 2), len);
    node.memories().register(global.clone());
    let data = pattern(len);
    src.put_bytes(0, &data).unwrap();

    // host -> global
    let guid = node.queue().alloc_guid(0);
    let (fence, rx) = node.queue().register_fence();
    node.create_xfer_des(
        XferDesKind::GasnetWrite,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![PortInit::data(src.id(), Box::new(LinearIterator::new(0, len)))],
            vec![PortInit::data(global.id(), Box::new(LinearIterator::new(0, len)))],
            fence,
        ),
    );
    assert!(wait_fence(rx));

    // global -> host
    let guid = node.queue().alloc_guid(0);
    let (fence, rx) = node.queue().register_fence();
    node.create_xfer_des(
        XferDesKind::GasnetRead,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![PortInit::data(global.id(), Box::new(LinearIterator::new(0, len)))],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, len)))],
            fence,
        ),
    );
    assert!(wait_fence(rx));

    let mut out = vec![0u8; len];
    dst.get_bytes(0, &mut out).unwrap();
    assert_eq!(out, data);
    node.shutdown();
}

// counts control-plane traffic while delegating to the loopback
struct CountingNet {
    inner: Arc<LoopbackNetwork>,
    remote_writes: Mutex<Vec<usize>>,
    acks: Mutex<usize>,
    totals: Mutex<Vec<usize>>,
}

impl CountingNet {
    fn new(inner: Arc<LoopbackNetwork>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            remote_writes: Mutex::new(Vec::new()),
            acks: Mutex::new(0),
            totals: Mutex::new(Vec::new()),
        })
    }
}

impl NetworkTransport for CountingNet {
    fn send(&self, from: NodeId, target: NodeId, msg: XferMessage) -> anyhow::Result<()> {
        match &msg {
            XferMessage::RemoteWrite(m) => {
                self.remote_writes.lock().unwrap().push(m.data.len());
                if let Some(t) = m.pre_bytes_total {
                    self.totals.lock().unwrap().push(t);
                }
            }
            XferMessage::RemoteWriteAck { .. } => *self.acks.lock().unwrap() += 1,
            XferMessage::UpdateBytesTotal {
                pre_bytes_total, ..
            } => self.totals.lock().unwrap().push(*pre_bytes_total),
            _ => {}
        }
        self.inner.send(from, target, msg)
    }
}

fn two_nodes() -> (Arc<CountingNet>, Arc<XferNode>, Arc<XferNode>) {
    let loopback = LoopbackNetwork::new();
    let counting = CountingNet::new(loopback.clone());
    let node0 = XferNode::new(0, counting.clone());
    let node1 = XferNode::new(1, counting.clone());
    loopback.attach(0, node0.clone());
    loopback.attach(1, node1.clone());
    (counting, node0, node1)
}

#[test]
fn test_remote_gather_assembles_one_message() {
    let (net, node0, node1) = two_nodes();
    let piece = 4096;
    let pieces = 16;
    let total = piece * pieces;

    // 16 non-contiguous 4 KiB pieces, stride 8 KiB
    let src = host_mem(&node0, 0, MemoryKind::RegDma, piece * pieces * 2);
    let spans: Vec<(usize, usize)> = (0..pieces).map(|i| (i * piece * 2, piece)).collect();
    let backing = pattern(piece * pieces * 2);
    src.put_bytes(0, &backing).unwrap();

    // B: a 128 KiB IB on node 1 drained into host memory
    let ib_size = 128 << 10;
    let ib_mem = host_mem(&node1, 0, MemoryKind::RegDma, ib_size);
    let dst = host_mem(&node1, 1, MemoryKind::System, total);
    node1.queue().register_ib_allocator(ib_mem.id(), ib_size);
    let ib = node1.queue().alloc_ib(ib_mem.id(), ib_size).unwrap();
    // node 0 addresses B's IB through a proxy
    node0
        .memories()
        .register(RemoteMemoryProxy::new(ib_mem.id(), MemoryKind::RegDma, true));

    let guid_a = node0.queue().alloc_guid(0);
    let guid_b = node1.queue().alloc_guid(1);
    let (fence_a, rx_a) = node0.queue().register_fence();
    let (fence_b, rx_b) = node1.queue().register_fence();

    node0.create_xfer_des(
        XferDesKind::RemoteWrite,
        XferDesCreateArgs::new(
            guid_a,
            0,
            vec![PortInit::data(src.id(), Box::new(SpanIterator::new(spans.clone())))],
            vec![
                PortInit::data(
                    ib_mem.id(),
                    Box::new(WrappingFifoIterator::new(ib.offset, ib.size)),
                )
                .with_ib(ib, guid_b, 0),
            ],
            fence_a,
        ),
    );
    let xd_b = node1.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid_b,
            1,
            vec![
                PortInit::data(
                    ib_mem.id(),
                    Box::new(WrappingFifoIterator::new(ib.offset, ib.size)),
                )
                .with_ib(ib, guid_a, 0),
            ],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, total)))],
            fence_b,
        ),
    );

    assert!(wait_fence(rx_a));
    assert!(wait_fence(rx_b));

    // one assembled message, one ack
    let writes = net.remote_writes.lock().unwrap().clone();
    assert_eq!(writes, vec![total]);
    assert_eq!(*net.acks.lock().unwrap(), 1);
    assert_eq!(
        xd_b.input_ports[0].remote_bytes_total.load(Ordering::Acquire),
        total
    );

    // pieces concatenated in iterator order
    let mut out = vec![0u8; total];
    dst.get_bytes(0, &mut out).unwrap();
    let mut expect = Vec::new();
    for &(ofs, len) in &spans {
        expect.extend_from_slice(&backing[ofs..ofs + len]);
    }
    assert_eq!(out, expect);

    node0.shutdown();
    node1.shutdown();
}

#[test]
fn test_cross_node_pipeline_waves() {
    let (net, node0, node1) = two_nodes();
    let total = 4 << 20;
    let ib_size = 1 << 20;

    let src = host_mem(&node0, 0, MemoryKind::RegDma, total);
    let data = pattern(total);
    src.put_bytes(0, &data).unwrap();

    let ib_mem = host_mem(&node1, 0, MemoryKind::RegDma, ib_size);
    let dst = host_mem(&node1, 1, MemoryKind::System, total);
    node1.queue().register_ib_allocator(ib_mem.id(), ib_size);
    let ib = node1.queue().alloc_ib(ib_mem.id(), ib_size).unwrap();
    node0
        .memories()
        .register(RemoteMemoryProxy::new(ib_mem.id(), MemoryKind::RegDma, true));

    let guid_a = node0.queue().alloc_guid(0);
    let guid_b = node1.queue().alloc_guid(1);
    let (fence_a, rx_a) = node0.queue().register_fence();
    let (fence_b, rx_b) = node1.queue().register_fence();

    node0.create_xfer_des(
        XferDesKind::RemoteWrite,
        XferDesCreateArgs::new(
            guid_a,
            0,
            vec![PortInit::data(src.id(), Box::new(LinearIterator::new(0, total)))],
            vec![
                PortInit::data(
                    ib_mem.id(),
                    Box::new(WrappingFifoIterator::new(ib.offset, ib.size)),
                )
                .with_ib(ib, guid_b, 0),
            ],
            fence_a,
        ),
    );
    let xd_b = node1.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid_b,
            1,
            vec![
                PortInit::data(
                    ib_mem.id(),
                    Box::new(WrappingFifoIterator::new(ib.offset, ib.size)),
                )
                .with_ib(ib, guid_a, 0),
            ],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, total)))],
            fence_b,
        ),
    );

    assert!(wait_fence(rx_a));
    assert!(wait_fence(rx_b));

    // the final total arrived exactly once
    assert_eq!(
        xd_b.input_ports[0].remote_bytes_total.load(Ordering::Acquire),
        total
    );
    assert_eq!(net.totals.lock().unwrap().iter().filter(|&&t| t == total).count(), 1);

    let mut out = vec![0u8; total];
    dst.get_bytes(0, &mut out).unwrap();
    assert_eq!(out, data);

    node0.shutdown();
    node1.shutdown();
}

/// 24-byte field encoded as a 4-byte length plus trailing-zero-trimmed
/// payload; the declared worst case is deliberately loose.
struct PrefixSerdez;

const FIELD: usize = 24;
const MAX_SER: usize = 40;

impl SerdezOp for PrefixSerdez {
    fn sizeof_field_type(&self) -> usize {
        FIELD
    }

    fn max_serialized_size(&self) -> usize {
        MAX_SER
    }

    unsafe fn serialize(&self, src: *const u8, num_elems: usize, dst: *mut u8) -> usize {
        let mut written = 0;
        for i in 0..num_elems {
            written += unsafe { self.serialize_one(src.add(i * FIELD), dst.add(written)) };
        }
        written
    }

    unsafe fn serialize_one(&self, src: *const u8, dst: *mut u8) -> usize {
        let elem = unsafe { std::slice::from_raw_parts(src, FIELD) };
        let keep = FIELD - elem.iter().rev().take_while(|&&b| b == 0).count();
        unsafe {
            std::ptr::copy_nonoverlapping((keep as u32).to_le_bytes().as_ptr(), dst, 4);
            std::ptr::copy_nonoverlapping(src, dst.add(4), keep);
        }
        4 + keep
    }

    unsafe fn deserialize(&self, dst: *mut u8, num_elems: usize, src: *const u8) -> usize {
        let mut consumed = 0;
        for i in 0..num_elems {
            consumed += unsafe { self.deserialize_one(dst.add(i * FIELD), src.add(consumed)) };
        }
        consumed
    }

    unsafe fn deserialize_one(&self, dst: *mut u8, src: *const u8) -> usize {
        unsafe {
            let mut len_bytes = [0u8; 4];
            std::ptr::copy_nonoverlapping(src, len_bytes.as_mut_ptr(), 4);
            let keep = u32::from_le_bytes(len_bytes) as usize;
            assert!(keep <= FIELD);
            std::ptr::write_bytes(dst, 0, FIELD);
            std::ptr::copy_nonoverlapping(src.add(4), dst, keep);
            4 + keep
        }
    }
}

#[rstest]
#[case::scenario(32 << 10)]
#[case::many_wraps(4096)]
fn test_serdez_roundtrip_through_ib(#[case] ib_size: usize) {
    let (_net, node) = single_node();
    let elems = 1000;
    let src_len = elems * FIELD;

    let src = host_mem(&node, 0, MemoryKind::System, src_len);
    let dst = host_mem(&node, 1, MemoryKind::System, src_len);
    let ib_mem = host_mem(&node, 2, MemoryKind::System, ib_size);
    node.queue().register_ib_allocator(ib_mem.id(), ib_size);
    let ib = node.queue().alloc_ib(ib_mem.id(), ib_size).unwrap();

    // variable-length content: trailing zeros of varying width
    let mut data = vec![0u8; src_len];
    for e in 0..elems {
        let fill = e % (FIELD + 1);
        for b in 0..fill {
            data[e * FIELD + b] = (e * 7 + b + 1) as u8;
        }
    }
    src.put_bytes(0, &data).unwrap();

    let serdez: Arc<dyn SerdezOp> = Arc::new(PrefixSerdez);

    let guid_ser = node.queue().alloc_guid(0);
    let guid_des = node.queue().alloc_guid(0);
    let (fence_ser, rx_ser) = node.queue().register_fence();
    let (fence_des, rx_des) = node.queue().register_fence();

    let xd_ser = node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid_ser,
            0,
            vec![
                PortInit::data(src.id(), Box::new(LinearIterator::new(0, src_len)))
                    .with_serdez(serdez.clone()),
            ],
            vec![
                PortInit::data(
                    ib_mem.id(),
                    Box::new(WrappingFifoIterator::new(ib.offset, ib.size)),
                )
                .with_ib(ib, guid_des, 0),
            ],
            fence_ser,
        ),
    );
    let xd_des = node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid_des,
            0,
            vec![
                PortInit::data(
                    ib_mem.id(),
                    Box::new(WrappingFifoIterator::new(ib.offset, ib.size)),
                )
                .with_ib(ib, guid_ser, 0),
            ],
            vec![
                PortInit::data(dst.id(), Box::new(LinearIterator::new(0, src_len)))
                    .with_serdez(serdez.clone()),
            ],
            fence_des,
        ),
    );

    assert!(wait_fence(rx_ser));
    assert!(wait_fence(rx_des));

    // the serialized stream is bounded by the worst case and its exact size
    // was published downstream
    let emitted = xd_ser.output_ports[0]
        .local_bytes_total
        .load(Ordering::Acquire);
    assert!(emitted <= elems * MAX_SER);
    assert_eq!(
        xd_ser.output_ports[0].local_bytes_cons.load(Ordering::Acquire),
        emitted
    );
    assert_eq!(
        xd_des.input_ports[0].remote_bytes_total.load(Ordering::Acquire),
        emitted
    );

    let mut out = vec![0u8; src_len];
    dst.get_bytes(0, &mut out).unwrap();
    assert_eq!(out, data);
    node.shutdown();
}

#[test]
fn test_gather_control_stream() {
    let (_net, node) = single_node();
    let src_a = host_mem(&node, 0, MemoryKind::System, 128);
    let src_b = host_mem(&node, 1, MemoryKind::System, 64);
    let dst = host_mem(&node, 2, MemoryKind::System, 150);
    let ctrl_mem = host_mem(&node, 3, MemoryKind::System, 16);

    let data_a = pattern(128);
    let data_b: Vec<u8> = (0..64).map(|i| (200 - i) as u8).collect();
    src_a.put_bytes(0, &data_a).unwrap();
    src_b.put_bytes(0, &data_b).unwrap();

    // steering: 100 bytes from port 0, 50 from port 1, then end of stream
    let words = [
        ControlWord::encode(Some(0), 100, false),
        ControlWord::encode(Some(1), 50, false),
        ControlWord::encode(None, 0, true),
    ];
    let mut ctrl_bytes = Vec::new();
    for w in words {
        ctrl_bytes.extend_from_slice(&w.0.to_le_bytes());
    }
    ctrl_mem.put_bytes(0, &ctrl_bytes).unwrap();

    let guid = node.queue().alloc_guid(0);
    // the control stream's updates arrive before the descriptor exists and
    // must be parked
    node.queue().update_pre_bytes_write(guid, 2, 0, 12);
    node.queue().update_pre_bytes_total(guid, 2, 12);

    let (fence, rx) = node.queue().register_fence();
    node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![
                PortInit::data(src_a.id(), Box::new(LinearIterator::new(0, 128))),
                PortInit::data(src_b.id(), Box::new(LinearIterator::new(0, 64))),
                PortInit::data(ctrl_mem.id(), Box::new(WrappingFifoIterator::new(0, 16)))
                    .gather_control(),
            ],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, 150)))],
            fence,
        ),
    );

    assert!(wait_fence(rx));

    let mut out = vec![0u8; 150];
    dst.get_bytes(0, &mut out).unwrap();
    assert_eq!(&out[..100], &data_a[..100]);
    assert_eq!(&out[100..], &data_b[..50]);
    node.shutdown();
}

#[test]
fn test_gather_control_skip_segment() {
    let (_net, node) = single_node();
    let src_a = host_mem(&node, 0, MemoryKind::System, 64);
    let src_b = host_mem(&node, 1, MemoryKind::System, 64);
    let dst = host_mem(&node, 2, MemoryKind::System, 130);
    let ctrl_mem = host_mem(&node, 3, MemoryKind::System, 16);

    let data_a = pattern(64);
    let data_b: Vec<u8> = (0..64).map(|i| (200 - i) as u8).collect();
    src_a.put_bytes(0, &data_a).unwrap();
    src_b.put_bytes(0, &data_b).unwrap();

    // 60 bytes from port 0, a 20-byte hole (port word 0 = skip), 50 from
    // port 1
    let words = [
        ControlWord::encode(Some(0), 60, false),
        ControlWord::encode(None, 20, false),
        ControlWord::encode(Some(1), 50, true),
    ];
    let mut ctrl_bytes = Vec::new();
    for w in words {
        ctrl_bytes.extend_from_slice(&w.0.to_le_bytes());
    }
    ctrl_mem.put_bytes(0, &ctrl_bytes).unwrap();

    let guid = node.queue().alloc_guid(0);
    node.queue().update_pre_bytes_write(guid, 2, 0, 12);
    node.queue().update_pre_bytes_total(guid, 2, 12);

    let (fence, rx) = node.queue().register_fence();
    node.create_xfer_des(
        XferDesKind::MemCpy,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![
                PortInit::data(src_a.id(), Box::new(LinearIterator::new(0, 64))),
                PortInit::data(src_b.id(), Box::new(LinearIterator::new(0, 64))),
                PortInit::data(ctrl_mem.id(), Box::new(WrappingFifoIterator::new(0, 16)))
                    .gather_control(),
            ],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, 130)))],
            fence,
        ),
    );

    assert!(wait_fence(rx));

    let mut out = vec![0u8; 130];
    dst.get_bytes(0, &mut out).unwrap();
    assert_eq!(&out[..60], &data_a[..60]);
    // the skipped segment was never written
    assert_eq!(&out[60..80], &[0u8; 20]);
    assert_eq!(&out[80..], &data_b[..50]);
    node.shutdown();
}

/// Row-major in-memory dataset for exercising the HDF5 channel.
struct MemDataset {
    bounds: Vec<u64>,
    elem_size: usize,
    data: Mutex<Vec<u8>>,
}

impl MemDataset {
    fn index(&self, coord: &[u64]) -> usize {
        let mut idx = 0u64;
        for (d, &c) in coord.iter().enumerate() {
            idx = idx * self.bounds[d] + c;
        }
        idx as usize * self.elem_size
    }

    fn for_each_row(
        &self,
        offset: &[u64],
        extent: &[u64],
        mut f: impl FnMut(usize, usize, usize),
    ) {
        // iterate rows of the fastest dimension
        let inner = extent.len() - 1;
        let row_bytes = extent[inner] as usize * self.elem_size;
        let mut coord: Vec<u64> = offset.to_vec();
        let mut buf_pos = 0;
        loop {
            f(self.index(&coord), row_bytes, buf_pos);
            buf_pos += row_bytes;
            // carry outer dims
            let mut d = inner;
            loop {
                if d == 0 {
                    return;
                }
                d -= 1;
                coord[d] += 1;
                if coord[d] < offset[d] + extent[d] {
                    break;
                }
                coord[d] = offset[d];
            }
        }
    }
}

impl Hdf5Dataset for MemDataset {
    fn element_size(&self) -> usize {
        self.elem_size
    }

    fn bounds(&self) -> &[u64] {
        &self.bounds
    }

    fn read_hyperslab(&self, offset: &[u64], extent: &[u64], dst: &mut [u8]) -> anyhow::Result<()> {
        let data = self.data.lock().unwrap();
        self.for_each_row(offset, extent, |src_idx, row, buf_pos| {
            dst[buf_pos..buf_pos + row].copy_from_slice(&data[src_idx..src_idx + row]);
        });
        Ok(())
    }

    fn write_hyperslab(&self, offset: &[u64], extent: &[u64], src: &[u8]) -> anyhow::Result<()> {
        let mut data = self.data.lock().unwrap();
        self.for_each_row(offset, extent, |dst_idx, row, buf_pos| {
            data[dst_idx..dst_idx + row].copy_from_slice(&src[buf_pos..buf_pos + row]);
        });
        Ok(())
    }
}

struct MemDatasetOpener {
    dataset: Arc<MemDataset>,
}

impl Hdf5DatasetOpener for MemDatasetOpener {
    fn open(
        &self,
        _filename: &str,
        _dsetname: &str,
        _read_only: bool,
    ) -> anyhow::Result<Arc<dyn Hdf5Dataset>> {
        Ok(self.dataset.clone())
    }
}

#[test]
fn test_hdf5_write_and_read_back() {
    let (_net, node) = single_node();
    // 8x16 dataset of 8-byte elements
    let bounds = vec![8u64, 16u64];
    let elem = 8usize;
    let dataset = Arc::new(MemDataset {
        bounds: bounds.clone(),
        elem_size: elem,
        data: Mutex::new(vec![0u8; 8 * 16 * elem]),
    });
    let hdf = HdfMemory::new(
        MemoryId::new(0, 0),
        Box::new(MemDatasetOpener {
            dataset: dataset.clone(),
        }),
    );
    node.memories().register(hdf.clone());

    // write a 4x8 region at (2, 4)
    let region_bytes = 4 * 8 * elem;
    let src = host_mem(&node, 1, MemoryKind::System, region_bytes);
    let dst = host_mem(&node, 2, MemoryKind::System, region_bytes);
    let data = pattern(region_bytes);
    src.put_bytes(0, &data).unwrap();

    let hdf_iter = || {
        Box::new(Hdf5Iterator::new(
            0,
            "test.h5",
            "dset",
            bounds.clone(),
            vec![2, 4],
            vec![4, 8],
            elem,
        ))
    };

    let guid = node.queue().alloc_guid(0);
    let (fence, rx) = node.queue().register_fence();
    node.create_xfer_des(
        XferDesKind::Hdf5Write,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![PortInit::data(src.id(), Box::new(LinearIterator::new(0, region_bytes)))],
            vec![PortInit::data(hdf.id(), hdf_iter())],
            fence,
        ),
    );
    assert!(wait_fence(rx));

    // read the same region back through the channel
    let guid = node.queue().alloc_guid(0);
    let (fence, rx) = node.queue().register_fence();
    node.create_xfer_des(
        XferDesKind::Hdf5Read,
        XferDesCreateArgs::new(
            guid,
            0,
            vec![PortInit::data(hdf.id(), hdf_iter())],
            vec![PortInit::data(dst.id(), Box::new(LinearIterator::new(0, region_bytes)))],
            fence,
        ),
    );
    assert!(wait_fence(rx));

    let mut out = vec![0u8; region_bytes];
    dst.get_bytes(0, &mut out).unwrap();
    assert_eq!(out, data);

    // the dataset holds the region at the right place
    let stored = dataset.data.lock().unwrap();
    for row in 0..4 {
        let dset_idx = ((2 + row) * 16 + 4) * elem;
        let src_idx = row * 8 * elem;
        assert_eq!(
            &stored[dset_idx..dset_idx + 8 * elem],
            &data[src_idx..src_idx + 8 * elem]
        );
    }
    node.shutdown();
}

struct ParitySplitter;

impl dynamo_xfer::channel::addr_split::AddressSplitter for ParitySplitter {
    fn element_size(&self) -> usize {
        8
    }

    fn route(&self, elem: &[u8]) -> Option<usize> {
        match elem[0] {
            0xff => None,
            b => Some((b % 2) as usize),
        }
    }
}

#[test]
fn test_address_split_routes_and_describes() {
    let (_net, node) = single_node();
    let first_bytes: [u8; 12] = [0, 1, 2, 3, 0xff, 4, 5, 0xff, 6, 7, 8, 9];
    let elem = 8usize;
    let total = first_bytes.len() * elem;

    let src = host_mem(&node, 0, MemoryKind::System, total);
    let out_even = host_mem(&node, 1, MemoryKind::System, total);
    let out_odd = host_mem(&node, 2, MemoryKind::System, total);
    let ctrl = host_mem(&node, 3, MemoryKind::System, 64);

    let mut data = vec![0u8; total];
    for (i, &b) in first_bytes.iter().enumerate() {
        data[i * elem] = b;
        data[i * elem + 1] = i as u8;
    }
    src.put_bytes(0, &data).unwrap();

    let guid = node.queue().alloc_guid(0);
    let (fence, rx) = node.queue().register_fence();
    let args = XferDesCreateArgs::new(
        guid,
        0,
        vec![PortInit::data(src.id(), Box::new(LinearIterator::new(0, total)))],
        vec![
            PortInit::data(out_even.id(), Box::new(LinearIterator::new(0, total))),
            PortInit::data(out_odd.id(), Box::new(LinearIterator::new(0, total))),
            PortInit::data(ctrl.id(), Box::new(LinearIterator::new(0, 64))),
        ],
        fence,
    );
    let channel = node.channels().channel_for_kind(XferDesKind::AddrSplit);
    let xd = dynamo_xfer::XferDes::new(args, XferDesKind::AddrSplit, channel, node.queue().clone());
    node.channels()
        .addr_split_channel()
        .register_splitter(&xd, Arc::new(ParitySplitter));
    node.queue().enqueue_xfer_des(xd.clone());

    assert!(wait_fence(rx));

    // elements landed on their streams in input order
    let mut even = vec![0u8; 5 * elem];
    out_even.get_bytes(0, &mut even).unwrap();
    let expect_even: Vec<u8> = [0u8, 2, 4, 6, 8]
        .iter()
        .flat_map(|&b| {
            let i = first_bytes.iter().position(|&x| x == b).unwrap();
            data[i * elem..(i + 1) * elem].to_vec()
        })
        .collect();
    assert_eq!(even, expect_even);

    let mut odd = vec![0u8; 5 * elem];
    out_odd.get_bytes(0, &mut odd).unwrap();
    let expect_odd: Vec<u8> = [1u8, 3, 5, 7, 9]
        .iter()
        .flat_map(|&b| {
            let i = first_bytes.iter().position(|&x| x == b).unwrap();
            data[i * elem..(i + 1) * elem].to_vec()
        })
        .collect();
    assert_eq!(odd, expect_odd);

    // the control stream narrates the interleaving and ends with EOS
    let ctrl_len = xd.output_ports[2].local_bytes_total.load(Ordering::Acquire);
    assert!(ctrl_len >= 4 && ctrl_len % 4 == 0);
    let mut raw = vec![0u8; ctrl_len];
    ctrl.get_bytes(0, &mut raw).unwrap();
    let words: Vec<ControlWord> = raw
        .chunks(4)
        .map(|c| ControlWord(u32::from_le_bytes(c.try_into().unwrap())))
        .collect();
    let last = words.last().unwrap();
    assert!(last.eos());
    assert_eq!(last.count(), 0);
    // byte counts per run sum to the full input
    let run_total: usize = words.iter().map(|w| w.count()).sum();
    assert_eq!(run_total, total);
    node.shutdown();
}

#[test]
fn test_cross_node_descriptor_creation() {
    let (_net, node0, node1) = two_nodes();
    let len = 16 << 10;
    let src = host_mem(&node1, 0, MemoryKind::System, len);
    let dst = host_mem(&node1, 1, MemoryKind::System, len);
    let data = pattern(len);
    src.put_bytes(0, &data).unwrap();

    // node 0 plans a copy that runs entirely on node 1
    let guid = node0.queue().alloc_guid(1);
    let (fence, rx) = node0.queue().register_fence();
    node0
        .submit_create(dynamo_xfer::message::CreateXferDesMessage {
            guid,
            launch_node: 0,
            kind: XferDesKind::MemCpy,
            inputs: vec![dynamo_xfer::message::PortDesc {
                mem: Some(src.id()),
                iter: dynamo_xfer::IteratorDesc::Linear { base: 0, bytes: len },
                serdez_id: None,
                peer_guid: dynamo_xfer::XFERDES_NO_GUID,
                peer_port_idx: 0,
                indirect_port_idx: None,
                ib_offset: 0,
                ib_size: 0,
                port_type: dynamo_xfer::port::PortType::Data,
            }],
            outputs: vec![dynamo_xfer::message::PortDesc {
                mem: Some(dst.id()),
                iter: dynamo_xfer::IteratorDesc::Linear { base: 0, bytes: len },
                serdez_id: None,
                peer_guid: dynamo_xfer::XFERDES_NO_GUID,
                peer_port_idx: 0,
                indirect_port_idx: None,
                ib_offset: 0,
                ib_size: 0,
                port_type: dynamo_xfer::port::PortType::Data,
            }],
            priority: 0,
            max_req_size: 256 << 10,
            max_reqs: 16,
            fence,
        })
        .unwrap();

    // completion comes back to the launch node over the wire
    assert!(wait_fence(rx));
    let mut out = vec![0u8; len];
    dst.get_bytes(0, &mut out).unwrap();
    assert_eq!(out, data);

    node0.queue().destroy_xfer_des(guid);
    node0.shutdown();
    node1.shutdown();
}

#[test]
fn test_fence_reports_success_flag() {
    let (_net, node) = single_node();
    let (fence, rx) = node.queue().register_fence();
    node.queue().mark_fence(fence, false);
    assert!(!wait_fence(rx));
    node.shutdown();
}
