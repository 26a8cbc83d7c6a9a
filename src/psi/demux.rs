//! Section reassembly from Transport Stream packets.
//!
//! A [`SectionDemux`] watches a set of PIDs and rebuilds complete PSI/SI
//! sections from the 184-byte packet payloads: pointer_field handling,
//! continuation across packets, several sections per packet, continuity
//! checks. Long sections with an invalid CRC32 are dropped.

use super::section::Section;
use super::{SHORT_SECTION_HEADER_SIZE, TID_STUFFING};
use crate::ts::TsPacket;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

/// Per-PID reassembly state.
#[derive(Default)]
struct PidState {
    /// Partially accumulated section, when a section crosses packets.
    pending: Option<BytesMut>,
    /// Continuity counter of the last packet seen on this PID.
    last_cc: Option<u8>,
}

/// Demultiplexer of PSI/SI sections on selected PIDs.
///
/// Feed every stream packet to [`feed_packet`](SectionDemux::feed_packet);
/// completed sections on subscribed PIDs are returned, usually zero or one
/// per packet.
#[derive(Default)]
pub struct SectionDemux {
    pids: HashMap<u16, PidState>,
}

impl SectionDemux {
    /// Creates a demux with no PID subscription.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a PID. A no-op when already subscribed.
    pub fn add_pid(&mut self, pid: u16) {
        self.pids.entry(pid).or_default();
    }

    /// Unsubscribes a PID, dropping any partial section on it.
    pub fn remove_pid(&mut self, pid: u16) {
        self.pids.remove(&pid);
    }

    /// Returns true when the PID is subscribed.
    pub fn has_pid(&self, pid: u16) -> bool {
        self.pids.contains_key(&pid)
    }

    /// Drops all subscriptions and partial sections.
    pub fn reset(&mut self) {
        self.pids.clear();
    }

    /// Processes one TS packet; returns the sections it completed.
    pub fn feed_packet(&mut self, pkt: &TsPacket) -> Vec<Section> {
        let mut sections = Vec::new();
        if !pkt.has_valid_sync() {
            return sections;
        }
        let Some(state) = self.pids.get_mut(&pkt.pid()) else {
            return sections;
        };
        let Some(payload) = pkt.payload() else {
            return sections;
        };
        if payload.is_empty() {
            return sections;
        }

        // Continuity check: a duplicate packet is ignored, a discontinuity
        // invalidates any partial section.
        let cc = pkt.continuity_counter();
        if let Some(last) = state.last_cc {
            if cc == last {
                return sections;
            }
            if cc != (last + 1) & 0x0F {
                log::debug!("discontinuity on PID 0x{:04X}, dropping partial section", pkt.pid());
                state.pending = None;
            }
        }
        state.last_cc = Some(cc);

        let data = if pkt.payload_unit_start() {
            let pointer = payload[0] as usize;
            if 1 + pointer > payload.len() {
                log::debug!("invalid pointer_field on PID 0x{:04X}", pkt.pid());
                state.pending = None;
                return sections;
            }
            // Bytes before the pointer target complete the pending section.
            if let Some(mut pending) = state.pending.take() {
                pending.extend_from_slice(&payload[1..1 + pointer]);
                complete_pending(pending, &mut sections);
            }
            &payload[1 + pointer..]
        } else {
            match state.pending.take() {
                Some(mut pending) => {
                    pending.extend_from_slice(payload);
                    if let Some(rest) = complete_pending(pending, &mut sections) {
                        state.pending = Some(rest);
                    }
                    return sections;
                }
                // Continuation packet without a section in progress.
                None => return sections,
            }
        };

        // Parse back-to-back sections starting at the pointer target.
        let mut data = data;
        while !data.is_empty() && data[0] != TID_STUFFING {
            if data.len() < SHORT_SECTION_HEADER_SIZE {
                state.pending = Some(BytesMut::from(data));
                return sections;
            }
            let total = 3 + ((((data[1] & 0x0F) as usize) << 8) | data[2] as usize);
            if data.len() < total {
                state.pending = Some(BytesMut::from(data));
                return sections;
            }
            emit(Bytes::copy_from_slice(&data[..total]), &mut sections);
            data = &data[total..];
        }
        sections
    }
}

/// Tries to complete an accumulated section; returns leftover bytes when the
/// buffer extends past the section end (trailing data of a section which
/// ended without a PUSI in this packet is stuffing and is dropped there).
fn complete_pending(pending: BytesMut, sections: &mut Vec<Section>) -> Option<BytesMut> {
    if pending.len() < SHORT_SECTION_HEADER_SIZE {
        return Some(pending);
    }
    let total = 3 + ((((pending[1] & 0x0F) as usize) << 8) | pending[2] as usize);
    if pending.len() < total {
        return Some(pending);
    }
    emit(Bytes::copy_from_slice(&pending[..total]), sections);
    None
}

fn emit(blob: Bytes, sections: &mut Vec<Section>) {
    match Section::from_bytes(blob) {
        Ok(section) => {
            if section.has_valid_crc() {
                sections.push(section);
            } else {
                log::debug!(
                    "dropping section TID 0x{:02X} with invalid CRC32",
                    section.table_id()
                );
            }
        }
        Err(err) => log::debug!("dropping malformed section: {}", err),
    }
}
