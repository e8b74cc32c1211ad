//! Ghost-exchange pipeline: per-peer transfer plans and the split
//! start / wait-receives / wait-sends machinery that moves cell payloads
//! between ranks.
//!
//! A plan lists, per peer, the cells to send and to receive, sorted by
//! ascending cell id with sequential 1-based message tags assigned from
//! that order. Both ends derive the same plan independently from the
//! replicated directory, so tags and buffer sizes always agree.
//!
//! Two wire shapes are supported:
//! - `Bulk`: one message per peer, the concatenation of fixed-size
//!   payloads in plan order;
//! - `PerCell`: one message per cell under its own tag, preceded by a
//!   per-peer size message when payload lengths vary.

use crate::algs::communicator::{tags, CommTag, Communicator, Wait};
use crate::data::store::CellData;
use crate::grid_error::GridError;
use crate::topology::cell::CellId;
use hashbrown::HashMap;
use std::collections::BTreeMap;

/// Wire shape of payload transfers, chosen when the grid is built.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferMode {
    /// One message per peer; requires `CellData::FIXED_LEN`.
    Bulk,
    /// One message per cell, fixed or variable length.
    PerCell,
}

/// Per-peer send and receive lists with assigned message tags.
#[derive(Clone, Debug, Default)]
pub struct ExchangePlan {
    to_send: BTreeMap<usize, Vec<(CellId, u16)>>,
    to_receive: BTreeMap<usize, Vec<(CellId, u16)>>,
}

impl ExchangePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a cell to send to `peer`; tags are assigned by [`finalize`].
    ///
    /// [`finalize`]: ExchangePlan::finalize
    pub fn add_send(&mut self, peer: usize, cell: CellId) {
        self.to_send.entry(peer).or_default().push((cell, 0));
    }

    /// Stages a cell to receive from `peer`.
    pub fn add_receive(&mut self, peer: usize, cell: CellId) {
        self.to_receive.entry(peer).or_default().push((cell, 0));
    }

    /// Sorts every per-peer list by cell id and assigns sequential 1-based
    /// tags; sender and receiver reach identical tags from identical sets.
    pub fn finalize(&mut self) -> Result<(), GridError> {
        for lists in [&mut self.to_send, &mut self.to_receive] {
            for (&peer, list) in lists.iter_mut() {
                list.sort_unstable_by_key(|(cell, _)| *cell);
                list.dedup_by_key(|(cell, _)| *cell);
                if list.len() >= tags::BLOCK_SPAN as usize {
                    return Err(GridError::TagOverflow {
                        peer,
                        cells: list.len(),
                    });
                }
                for (i, entry) in list.iter_mut().enumerate() {
                    entry.1 = (i + 1) as u16;
                }
            }
        }
        Ok(())
    }

    pub fn sends(&self) -> &BTreeMap<usize, Vec<(CellId, u16)>> {
        &self.to_send
    }

    pub fn receives(&self) -> &BTreeMap<usize, Vec<(CellId, u16)>> {
        &self.to_receive
    }

    /// Total number of cell payloads this rank will send.
    pub fn send_cell_count(&self) -> u64 {
        self.to_send.values().map(|v| v.len() as u64).sum()
    }

    /// Total number of cell payloads this rank will receive.
    pub fn receive_cell_count(&self) -> u64 {
        self.to_receive.values().map(|v| v.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.to_send.is_empty() && self.to_receive.is_empty()
    }

    pub fn clear(&mut self) {
        self.to_send.clear();
        self.to_receive.clear();
    }
}

enum PendingRecv<C: Communicator> {
    Bulk {
        peer: usize,
        cells: Vec<CellId>,
        item_len: usize,
        handle: C::RecvHandle,
    },
    Cell {
        peer: usize,
        cell: CellId,
        expected_len: usize,
        handle: C::RecvHandle,
    },
}

/// In-flight payload transfers; receives and sends are joined separately
/// so computation can overlap communication.
pub struct Transfer<C: Communicator> {
    recvs: Vec<PendingRecv<C>>,
    sends: Vec<C::SendHandle>,
}

impl<C: Communicator> Transfer<C> {
    /// A transfer with nothing in flight.
    pub fn idle() -> Self {
        Self {
            recvs: Vec::new(),
            sends: Vec::new(),
        }
    }
}

/// Posts all receives, then all sends, for the payloads named by `plan`.
///
/// Payloads are read from `source`; a planned send whose cell is missing
/// there means the plan and the store diverged, which is fatal.
pub fn start_transfers<P, C>(
    comm: &C,
    mode: TransferMode,
    base: CommTag,
    plan: &ExchangePlan,
    source: &HashMap<CellId, P>,
) -> Result<Transfer<C>, GridError>
where
    P: CellData,
    C: Communicator,
{
    let base_tag = base.as_u16();
    let mut transfer = Transfer::idle();

    // pack everything up front; send lengths double as the size messages
    let mut packed: BTreeMap<usize, Vec<Vec<u8>>> = BTreeMap::new();
    for (&peer, list) in plan.sends() {
        let mut bufs = Vec::with_capacity(list.len());
        for (cell, _) in list {
            let payload = source.get(cell).unwrap_or_else(|| {
                crate::invariant_violation!(
                    "planned to send cell {cell} to rank {peer} but it has no local payload"
                )
            });
            let mut buf = Vec::new();
            payload.pack(&mut buf);
            if let Some(fixed) = P::FIXED_LEN {
                if buf.len() != fixed {
                    return Err(GridError::PayloadSizeMismatch {
                        expected: fixed,
                        got: buf.len(),
                    });
                }
            }
            bufs.push(buf);
        }
        packed.insert(peer, bufs);
    }

    match mode {
        TransferMode::Bulk => {
            let item_len = P::FIXED_LEN.ok_or(GridError::VariablePayloadInBulkMode)?;

            for (&peer, list) in plan.receives() {
                let mut buf = vec![0u8; list.len() * item_len];
                let handle = comm.irecv(peer, base_tag, &mut buf);
                transfer.recvs.push(PendingRecv::Bulk {
                    peer,
                    cells: list.iter().map(|(c, _)| *c).collect(),
                    item_len,
                    handle,
                });
            }

            for (&peer, bufs) in &packed {
                let joined: Vec<u8> = bufs.iter().flatten().copied().collect();
                transfer.sends.push(comm.isend(peer, base_tag, &joined));
            }
        }
        TransferMode::PerCell => {
            // size handshake on the base tag when lengths vary
            let recv_lens: BTreeMap<usize, Vec<usize>> = match P::FIXED_LEN {
                Some(fixed) => plan
                    .receives()
                    .iter()
                    .map(|(&peer, list)| (peer, vec![fixed; list.len()]))
                    .collect(),
                None => {
                    let mut size_recvs = Vec::new();
                    for (&peer, list) in plan.receives() {
                        let mut buf = vec![0u8; list.len() * 4];
                        size_recvs.push((peer, list.len(), comm.irecv(peer, base_tag, &mut buf)));
                    }
                    let mut size_sends = Vec::new();
                    for (&peer, bufs) in &packed {
                        let lens: Vec<u8> = bufs
                            .iter()
                            .flat_map(|b| (b.len() as u32).to_le_bytes())
                            .collect();
                        size_sends.push(comm.isend(peer, base_tag, &lens));
                    }
                    let mut lens_in = BTreeMap::new();
                    for (peer, count, handle) in size_recvs {
                        let data = match handle.wait() {
                            Some(d) if d.len() == count * 4 => d,
                            other => crate::invariant_violation!(
                                "payload size message from rank {peer} missing or malformed: {:?}",
                                other.as_ref().map(|d| d.len())
                            ),
                        };
                        let lens: Vec<usize> = data
                            .chunks_exact(4)
                            .map(|c| u32::from_le_bytes(c.try_into().expect("chunked")) as usize)
                            .collect();
                        lens_in.insert(peer, lens);
                    }
                    for send in size_sends {
                        let _ = send.wait();
                    }
                    lens_in
                }
            };

            for (&peer, list) in plan.receives() {
                let lens = &recv_lens[&peer];
                for ((cell, tag), &expected_len) in list.iter().zip(lens) {
                    let mut buf = vec![0u8; expected_len];
                    let handle = comm.irecv(peer, base.offset(*tag).as_u16(), &mut buf);
                    transfer.recvs.push(PendingRecv::Cell {
                        peer,
                        cell: *cell,
                        expected_len,
                        handle,
                    });
                }
            }

            for (&peer, list) in plan.sends() {
                for ((_, tag), buf) in list.iter().zip(&packed[&peer]) {
                    transfer.sends.push(comm.isend(peer, base.offset(*tag).as_u16(), buf));
                }
            }
        }
    }

    Ok(transfer)
}

/// Blocks until every posted receive has completed and installs the
/// payloads into `dest`, creating default entries as needed.
///
/// A missing or truncated message, or a payload that fails to decode, is
/// a fatal transport failure.
pub fn wait_receives_into<P, C>(transfer: &mut Transfer<C>, dest: &mut HashMap<CellId, P>)
where
    P: CellData,
    C: Communicator,
{
    for pending in transfer.recvs.drain(..) {
        match pending {
            PendingRecv::Bulk {
                peer,
                cells,
                item_len,
                handle,
            } => {
                let data = match handle.wait() {
                    Some(d) if d.len() == cells.len() * item_len => d,
                    other => crate::invariant_violation!(
                        "bulk payload message from rank {peer} missing or truncated: expected {} bytes, got {:?}",
                        cells.len() * item_len,
                        other.as_ref().map(|d| d.len())
                    ),
                };
                for (cell, chunk) in cells.iter().zip(data.chunks_exact(item_len.max(1))) {
                    install(dest, *cell, chunk, peer);
                }
                // zero-length payloads carry no bytes but the cells still exist
                if item_len == 0 {
                    for cell in &cells {
                        dest.entry(*cell).or_default();
                    }
                }
            }
            PendingRecv::Cell {
                peer,
                cell,
                expected_len,
                handle,
            } => {
                let data = match handle.wait() {
                    Some(d) if d.len() == expected_len => d,
                    other => crate::invariant_violation!(
                        "payload message for cell {cell} from rank {peer} missing or truncated: expected {expected_len} bytes, got {:?}",
                        other.as_ref().map(|d| d.len())
                    ),
                };
                install(dest, cell, &data, peer);
            }
        }
    }
}

fn install<P: CellData>(dest: &mut HashMap<CellId, P>, cell: CellId, bytes: &[u8], peer: usize) {
    if let Err(err) = dest.entry(cell).or_default().unpack(bytes) {
        crate::invariant_violation!("payload of cell {cell} from rank {peer} failed to decode: {err}");
    }
}

/// Blocks until every posted send has completed.
pub fn wait_sends<C: Communicator>(transfer: &mut Transfer<C>) {
    for send in transfer.sends.drain(..) {
        let _ = send.wait();
    }
}

// --- typed all-gather helpers -------------------------------------------

/// All-gathers a list of cell ids; result indexed by rank.
pub fn all_gather_cells<C: Communicator>(comm: &C, cells: &[CellId]) -> Vec<Vec<CellId>> {
    let raw: Vec<u64> = cells.iter().map(|c| c.get().to_le()).collect();
    let gathered = comm.all_gather(bytemuck::cast_slice(&raw));
    gathered
        .into_iter()
        .enumerate()
        .map(|(rank, bytes)| {
            bytes
                .chunks_exact(8)
                .map(|chunk| {
                    let raw = u64::from_le_bytes(chunk.try_into().expect("chunked"));
                    CellId::from_wire(raw).unwrap_or_else(|| {
                        crate::invariant_violation!("rank {rank} all-gathered the zero cell id")
                    })
                })
                .collect()
        })
        .collect()
}

/// All-gathers `(cell, value)` pairs; result indexed by rank.
pub fn all_gather_cell_pairs<C: Communicator>(
    comm: &C,
    pairs: &[(CellId, u64)],
) -> Vec<Vec<(CellId, u64)>> {
    let mut raw = Vec::with_capacity(pairs.len() * 2);
    for (cell, value) in pairs {
        raw.push(cell.get().to_le());
        raw.push(value.to_le());
    }
    let gathered = comm.all_gather(bytemuck::cast_slice(&raw));
    gathered
        .into_iter()
        .enumerate()
        .map(|(rank, bytes)| {
            bytes
                .chunks_exact(16)
                .map(|chunk| {
                    let cell_raw = u64::from_le_bytes(chunk[..8].try_into().expect("chunked"));
                    let value = u64::from_le_bytes(chunk[8..].try_into().expect("chunked"));
                    let cell = CellId::from_wire(cell_raw).unwrap_or_else(|| {
                        crate::invariant_violation!("rank {rank} all-gathered the zero cell id")
                    });
                    (cell, value)
                })
                .collect()
        })
        .collect()
}
