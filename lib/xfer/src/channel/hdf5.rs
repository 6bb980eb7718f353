// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HDF5 channel: moves bytes between host memory and dataset hyperslabs.
//!
//! The dataset side is driven by `step_hdf5`, which yields hyperslab
//! descriptors; the host side must deliver a matching 1D extent. When it
//! cannot, the dataset step shrinks and retries - 2D/3D reconciliation on
//! the memory side is not supported here. Datasets are opened lazily on
//! first touch and cached per (descriptor, field).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::bgwork::{BackgroundWorkManager, TimeLimit};
use crate::iterator::{AddressInfo, AddressInfoHdf5, StepFlags};
use crate::memory::{Hdf5Dataset, HdfMemory, MemoryKind, NodeId};
use crate::xferdes::{XdProgress, XferDes, XferDesId, XFERDES_NO_GUID};

use super::{Channel, ChannelBase, PathEndpoint, XferDesKind};

const HDF_CPU_KINDS: [MemoryKind; 3] = [
    MemoryKind::System,
    MemoryKind::RegDma,
    MemoryKind::ZeroCopy,
];

pub struct Hdf5Channel {
    base: ChannelBase,
    // (xd guid, field) -> lazily opened dataset
    datasets: Mutex<HashMap<(XferDesId, u32), Arc<dyn Hdf5Dataset>>>,
}

impl Hdf5Channel {
    pub fn new(node: NodeId, bgwork: Arc<BackgroundWorkManager>) -> Self {
        let mut base = ChannelBase::new(node, XferDesKind::Hdf5Read, "hdf5 channel", bgwork);
        for kind in HDF_CPU_KINDS {
            base.add_path(
                PathEndpoint::LocalKind(MemoryKind::Hdf),
                PathEndpoint::LocalKind(kind),
                0,
                0,
                false,
                false,
                XferDesKind::Hdf5Read,
            );
            base.add_path(
                PathEndpoint::LocalKind(kind),
                PathEndpoint::LocalKind(MemoryKind::Hdf),
                0,
                0,
                false,
                false,
                XferDesKind::Hdf5Write,
            );
        }
        Self {
            base,
            datasets: Mutex::new(HashMap::new()),
        }
    }

    fn dataset_for(
        &self,
        xd: &XferDes,
        hdf_mem: &HdfMemory,
        info: &AddressInfoHdf5,
        read_only: bool,
    ) -> Arc<dyn Hdf5Dataset> {
        let key = (xd.guid(), info.field_id);
        let mut cache = self.datasets.lock().unwrap();
        if let Some(ds) = cache.get(&key) {
            return ds.clone();
        }
        // open datasets on the first touch of this transfer
        let ds = hdf_mem
            .open_dataset(&info.filename, &info.dsetname, read_only)
            .expect("failed to open HDF5 dataset");
        assert_eq!(ds.bounds().len(), info.dset_bounds.len());
        cache.insert(key, ds.clone());
        ds
    }

    fn progress(&self, xd: &Arc<XferDes>, prog: &mut XdProgress, work_until: TimeLimit) -> bool {
        let is_read = xd
            .input_ports
            .first()
            .and_then(|p| p.mem.as_ref())
            .map(|m| m.kind() == MemoryKind::Hdf)
            .unwrap_or(false);
        if !is_read {
            let is_write = xd
                .output_ports
                .first()
                .and_then(|p| p.mem.as_ref())
                .map(|m| m.kind() == MemoryKind::Hdf)
                .unwrap_or(false);
            assert!(is_write, "neither endpoint of an HDF5 descriptor is HDF");
        }

        let mut did_work = false;
        while xd.request_available() && !xd.iteration_completed() {
            // the control machinery isn't wired to dataset space; single
            // data ports only
            let in_port_idx = 0usize;
            let out_port_idx = 0usize;
            let in_port = &xd.input_ports[in_port_idx];
            let out_port = &xd.output_ports[out_port_idx];
            assert!(in_port.serdez_op.is_none() && out_port.serdez_op.is_none());

            // are the iterators finished?
            if prog.inputs[in_port_idx].iter.done() || prog.outputs[out_port_idx].iter.done() {
                xd.set_iteration_completed_and_notify();
                break;
            }

            let mut max_bytes = xd.max_req_size();

            // respect the predecessor's revealed total and delivered bytes
            if in_port.peer_guid != XFERDES_NO_GUID {
                let lbt = in_port.local_bytes_total.load(std::sync::atomic::Ordering::Acquire);
                let pbt = in_port
                    .remote_bytes_total
                    .load(std::sync::atomic::Ordering::Acquire);
                let pre_max = pbt.saturating_sub(lbt);
                if pre_max == 0 {
                    // an empty stream reveals its end only here
                    xd.set_iteration_completed_and_notify();
                    break;
                }
                max_bytes = max_bytes.min(pre_max);
                max_bytes = in_port.seq_remote.span_exists(lbt, max_bytes);
                if max_bytes == 0 {
                    break;
                }
            }

            // and the downstream IB's capacity
            if out_port.peer_guid != XFERDES_NO_GUID {
                let lbt = out_port.local_bytes_total.load(std::sync::atomic::Ordering::Acquire);
                max_bytes = out_port.seq_remote.span_exists(lbt, max_bytes);
                if max_bytes == 0 {
                    break;
                }
            }

            // the dataset side steps first, then the memory side must match
            let hdf_is_input = is_read;
            let mut hdf_info = AddressInfoHdf5::default();
            let mut mem_info = AddressInfo::default();

            let (hdf_prog, mem_prog) = if hdf_is_input {
                (&mut prog.inputs[in_port_idx], &mut prog.outputs[out_port_idx])
            } else {
                (&mut prog.outputs[out_port_idx], &mut prog.inputs[in_port_idx])
            };

            let mut hdf_bytes = hdf_prog.iter.step_hdf5(max_bytes, &mut hdf_info, true);
            if hdf_bytes == 0 {
                // not even one element fits - try again later
                break;
            }
            let mut mem_bytes = mem_prog.iter.step(hdf_bytes, &mut mem_info, StepFlags::LINEAR, true);
            if mem_bytes == hdf_bytes {
                hdf_prog.iter.confirm_step();
                mem_prog.iter.confirm_step();
            } else {
                // shrink the dataset step to what the memory side delivered
                assert!(mem_bytes < hdf_bytes);
                hdf_prog.iter.cancel_step();
                if mem_bytes == 0 {
                    mem_prog.iter.cancel_step();
                    break;
                }
                hdf_bytes = hdf_prog.iter.step_hdf5(mem_bytes, &mut hdf_info, false);
                // multi-dimensional hyperslabs round down; re-check the
                // memory side
                if hdf_bytes == mem_bytes {
                    mem_prog.iter.confirm_step();
                } else {
                    mem_prog.iter.cancel_step();
                    mem_bytes = mem_prog.iter.step(hdf_bytes, &mut mem_info, StepFlags::LINEAR, false);
                    assert_eq!(hdf_bytes, mem_bytes);
                }
            }

            let hdf_mem_arc = if hdf_is_input {
                in_port.mem.clone()
            } else {
                out_port.mem.clone()
            };
            let mem_mem_arc = if hdf_is_input {
                out_port.mem.clone()
            } else {
                in_port.mem.clone()
            };
            let hdf_mem = hdf_mem_arc
                .as_ref()
                .and_then(|m| m.as_hdf())
                .expect("HDF endpoint must be an HdfMemory");
            let host_ptr = mem_mem_arc
                .as_ref()
                .and_then(|m| m.get_direct_ptr(mem_info.base_offset, hdf_bytes))
                .expect("HDF5 transfer partner must be host-mapped");

            let dataset = self.dataset_for(xd, hdf_mem, &hdf_info, is_read);

            // synchronous dataset I/O
            let result = if is_read {
                let dst = unsafe { std::slice::from_raw_parts_mut(host_ptr, hdf_bytes) };
                dataset.read_hyperslab(&hdf_info.offset, &hdf_info.extent, dst)
            } else {
                let src = unsafe { std::slice::from_raw_parts(host_ptr as *const u8, hdf_bytes) };
                dataset.write_hyperslab(&hdf_info.offset, &hdf_info.extent, src)
            };
            if let Err(err) = result {
                tracing::warn!(%err, xd = ?xd.guid(), "hdf5 dataset i/o failed");
                xd.mark_failed();
            }

            // advance sequence state; the request is complete already
            let read_seq = in_port.local_bytes_total.load(std::sync::atomic::Ordering::Acquire);
            in_port
                .local_bytes_total
                .store(read_seq + hdf_bytes, std::sync::atomic::Ordering::Release);
            let write_seq = out_port.local_bytes_total.load(std::sync::atomic::Ordering::Acquire);
            out_port
                .local_bytes_total
                .store(write_seq + hdf_bytes, std::sync::atomic::Ordering::Release);
            out_port
                .local_bytes_cons
                .store(write_seq + hdf_bytes, std::sync::atomic::Ordering::Release);

            // set iteration completion before acknowledging so multi-hop
            // successors see the total promptly
            if (hdf_is_input && prog.inputs[in_port_idx].iter.done())
                || (!hdf_is_input && prog.outputs[out_port_idx].iter.done())
            {
                xd.set_iteration_completed_and_notify();
            }

            xd.update_bytes_read(in_port_idx, read_seq, hdf_bytes);
            xd.update_bytes_write(out_port_idx, write_seq, hdf_bytes);

            did_work = true;
            if work_until.is_expired() {
                break;
            }
        }
        did_work
    }
}

impl Channel for Hdf5Channel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn progress_xd(&self, xd: &Arc<XferDes>, work_until: TimeLimit) -> bool {
        if xd.transfer_completed() {
            return false;
        }
        let mut prog = xd.lock_progress();
        self.progress(xd, &mut prog, work_until)
    }

    fn flush_xd(&self, xd: &Arc<XferDes>) {
        let mut cache = self.datasets.lock().unwrap();
        let keys: Vec<_> = cache
            .keys()
            .filter(|(guid, _)| *guid == xd.guid())
            .cloned()
            .collect();
        for key in keys {
            if let Some(ds) = cache.remove(&key) {
                if let Err(err) = ds.flush() {
                    tracing::warn!(%err, xd = ?xd.guid(), "hdf5 dataset flush failed");
                }
            }
        }
    }
}
