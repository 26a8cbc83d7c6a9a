//! Cycling packetizer: repetition-rate scheduling of sections on one PID.
//!
//! Sections with a repetition rate are kept in a list sorted by the packet
//! index at which they are next due; sections without a rate (or when the
//! PID bitrate is unknown) cycle round-robin. The scheduler guarantees
//! forward progress for unscheduled sections even when the scheduled ones
//! alone would saturate the PID.

use super::{Packetizer, SectionProvider};
use crate::psi::Section;
use crate::ts::TsPacket;
use std::collections::VecDeque;

/// TS packet size in bits, used for bitrate conversions.
const PKT_SIZE_BITS: u64 = 188 * 8;

/// Computes the number of TS packets transmitted in `milliseconds` at `bitrate` bits/s.
pub(crate) fn packet_distance(bitrate: u64, milliseconds: u64) -> u64 {
    bitrate * milliseconds / (1000 * PKT_SIZE_BITS)
}

/// Stuffing behavior of a [`CyclingPacketizer`] between sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuffingPolicy {
    /// Never stuff: sections are packed back to back.
    Never,
    /// Stuff to the packet boundary at the end of each full cycle only.
    AtEndOfCycle,
    /// Stuff to the packet boundary after every section.
    Always,
}

/// One section under the scheduler's control.
struct SectionDesc {
    section: Section,
    /// Requested repetition rate in milliseconds, 0 when none.
    repetition: u64,
    /// Packet index of the last emission.
    last_packet: u64,
    /// Packet index at which the section is next due (scheduled list only).
    due_packet: u64,
    /// Cycle number of the last emission.
    last_cycle: u64,
}

impl SectionDesc {
    fn new(section: Section, repetition: u64) -> Self {
        Self { section, repetition, last_packet: 0, due_packet: 0, last_cycle: 0 }
    }

    /// Returns true when this section must be inserted after `other` in the
    /// scheduled list. Ties on due packet group sections of one subtable in
    /// section-number order and prioritize subtable diversity otherwise.
    fn insert_after(&self, other: &SectionDesc) -> bool {
        if self.due_packet != other.due_packet {
            return self.due_packet > other.due_packet;
        }
        let s1 = &self.section;
        let s2 = &other.section;
        if s1.table_id() != s2.table_id()
            || (s1.is_long_section() && s1.table_id_extension() != s2.table_id_extension())
        {
            // Sections do not belong to the same table: insert before.
            false
        } else if self.last_cycle > other.last_cycle {
            // This section is one cycle in advance: insert after.
            true
        } else if self.last_cycle < other.last_cycle {
            // This section is one cycle late: insert before.
            false
        } else if s1.is_short_section() || s2.is_short_section() {
            true
        } else {
            // Same due packet, same cycle, same subtable: section-number order.
            s1.section_number() >= s2.section_number()
        }
    }
}

/// Scheduling state, separated from the [`Packetizer`] so that it can act
/// as the packetizer's [`SectionProvider`].
struct CyclingCore {
    stuffing: StuffingPolicy,
    bitrate: u64,
    section_count: usize,
    remain_in_cycle: usize,
    current_cycle: u64,
    cycle_end: Option<u64>,
    /// Sum of `packet_count()` over all scheduled sections.
    sched_packets: u64,
    sched_sections: VecDeque<SectionDesc>,
    other_sections: VecDeque<SectionDesc>,
    /// Mirror of the packetizer's packet count, refreshed before each pull.
    current_packet: u64,
}

impl CyclingCore {
    fn add_scheduled_section(&mut self, desc: SectionDesc) {
        log::trace!(
            "schedule section: TID 0x{:02X}, TIDext 0x{:04X}, section {}/{}, cycle {}, due packet {}",
            desc.section.table_id(),
            desc.section.table_id_extension(),
            desc.section.section_number(),
            desc.section.last_section_number(),
            desc.last_cycle,
            desc.due_packet
        );
        let pos = self
            .sched_sections
            .iter()
            .position(|other| !desc.insert_after(other))
            .unwrap_or(self.sched_sections.len());
        self.sched_sections.insert(pos, desc);
    }

    fn add_section(&mut self, section: Section, repetition_ms: u64, current_packet: u64) {
        let mut desc = SectionDesc::new(section, repetition_ms);
        if repetition_ms == 0 || self.bitrate == 0 {
            // Unscheduled section, simply append at the end of the queue.
            self.other_sections.push_back(desc);
        } else {
            // Scheduled section, its due time is "now".
            desc.due_packet = current_packet;
            self.sched_packets += desc.section.packet_count();
            self.add_scheduled_section(desc);
        }
        self.section_count += 1;
        self.remain_in_cycle += 1;
    }

    fn remove_matching(
        &mut self,
        scheduled: bool,
        tid: u8,
        tid_ext: Option<u16>,
        section_number: Option<u8>,
    ) {
        let current_cycle = self.current_cycle;
        let mut removed_count = 0usize;
        let mut removed_in_cycle = 0usize;
        let mut removed_packets = 0u64;
        let list = if scheduled { &mut self.sched_sections } else { &mut self.other_sections };
        list.retain(|desc| {
            let sec = &desc.section;
            let matched = sec.table_id() == tid
                && tid_ext.is_none_or(|e| sec.table_id_extension() == e)
                && section_number.is_none_or(|n| sec.section_number() == n);
            if matched {
                removed_count += 1;
                if desc.last_cycle != current_cycle {
                    removed_in_cycle += 1;
                }
                removed_packets += sec.packet_count();
            }
            !matched
        });
        self.section_count -= removed_count;
        self.remain_in_cycle -= removed_in_cycle.min(self.remain_in_cycle);
        if scheduled {
            self.sched_packets -= removed_packets.min(self.sched_packets);
        }
    }

    fn set_bitrate(&mut self, new_bitrate: u64, current_packet: u64) {
        if self.bitrate == new_bitrate {
            // Do not do anything if bitrate unchanged.
            return;
        } else if new_bitrate == 0 {
            // Bitrate now unknown, unable to schedule sections, move them all
            // into the list of unscheduled sections.
            while let Some(desc) = self.sched_sections.pop_front() {
                self.other_sections.push_back(desc);
            }
            self.sched_packets = 0;
        } else if self.bitrate == 0 {
            // Bitrate was unknown but is not now. Promote sections with a
            // repetition rate out of the unscheduled list.
            let mut index = 0;
            while index < self.other_sections.len() {
                if self.other_sections[index].repetition == 0 {
                    index += 1;
                    continue;
                }
                if let Some(mut desc) = self.other_sections.remove(index) {
                    if desc.due_packet < current_packet {
                        desc.due_packet = current_packet;
                    }
                    self.sched_packets += desc.section.packet_count();
                    self.add_scheduled_section(desc);
                }
            }
        } else {
            // Old and new bitrate both known. Recompute the due packet of all
            // scheduled sections and re-sort the list.
            let mut old_list = std::mem::take(&mut self.sched_sections);
            while let Some(mut desc) = old_list.pop_back() {
                desc.due_packet = desc.last_packet + packet_distance(new_bitrate, desc.repetition);
                self.add_scheduled_section(desc);
            }
        }
        self.bitrate = new_bitrate;
    }

    fn remove_all(&mut self) {
        self.section_count = 0;
        self.remain_in_cycle = 0;
        self.sched_packets = 0;
        self.sched_sections.clear();
        self.other_sections.clear();
    }

    /// Marks one emission on the descriptor and maintains cycle accounting.
    fn mark_emitted(&mut self, scheduled: bool, index: usize, counter: u64) {
        let current_cycle = self.current_cycle;
        let current_packet = self.current_packet;
        let list = if scheduled { &mut self.sched_sections } else { &mut self.other_sections };
        let Some(desc) = list.get_mut(index) else { return };
        desc.last_packet = current_packet;
        if desc.last_cycle != current_cycle {
            // First time this section is sent in this cycle.
            desc.last_cycle = current_cycle;
            self.remain_in_cycle = self.remain_in_cycle.saturating_sub(1);
            if self.remain_in_cycle == 0 {
                // This section closes the cycle.
                self.cycle_end = Some(counter);
                self.current_cycle += 1;
                self.remain_in_cycle = self.section_count;
            }
        }
    }
}

impl SectionProvider for CyclingCore {
    fn provide_section(&mut self, counter: u64) -> Option<Section> {
        let current_packet = self.current_packet;

        // Cycle end is defined only when the end of a cycle is encountered.
        self.cycle_end = None;

        // Bitrate overflow guard: when the minimum bitrate required by the
        // scheduled sections exceeds the PID bitrate, unscheduled sections
        // would never pass. Force one through when the previous unscheduled
        // section missed the current cycle or was emitted too long ago.
        let force_unscheduled = !self.other_sections.is_empty()
            && !self.sched_sections.is_empty()
            && self.other_sections.back().is_some_and(|last| {
                last.last_cycle != self.current_cycle
                    || last.last_packet + last.section.packet_count() + self.sched_packets
                        < current_packet
            });

        if !force_unscheduled
            && self.sched_sections.front().is_some_and(|head| head.due_packet <= current_packet)
        {
            // One scheduled section is ready.
            if let Some(mut desc) = self.sched_sections.pop_front() {
                let section = desc.section.clone();
                // Reschedule the section. Add at least one packet so that all
                // scheduled sections get a chance to pass.
                desc.due_packet = current_packet
                    + packet_distance(self.bitrate, desc.repetition).max(1);
                let pos = self
                    .sched_sections
                    .iter()
                    .position(|other| !desc.insert_after(other))
                    .unwrap_or(self.sched_sections.len());
                self.sched_sections.insert(pos, desc);
                self.mark_emitted(true, pos, counter);
                return Some(section);
            }
        }
        if let Some(desc) = self.other_sections.pop_front() {
            // An unscheduled section is ready, move it back to the queue end.
            let section = desc.section.clone();
            self.other_sections.push_back(desc);
            let index = self.other_sections.len() - 1;
            self.mark_emitted(false, index, counter);
            return Some(section);
        }
        None
    }

    fn do_stuffing(&mut self) -> bool {
        self.section_count == 0
            || self.stuffing == StuffingPolicy::Always
            || (self.stuffing == StuffingPolicy::AtEndOfCycle
                && self.remain_in_cycle == self.section_count)
    }
}

/// Packetizer which cyclically emits a set of sections on one PID.
///
/// Sections may carry an individual repetition rate in milliseconds; these
/// rates are honored when the PID bitrate is known. All other sections are
/// emitted round-robin in the remaining capacity.
pub struct CyclingPacketizer {
    packetizer: Packetizer,
    core: CyclingCore,
}

impl CyclingPacketizer {
    /// Creates a cycling packetizer for one PID with the given stuffing policy.
    pub fn new(pid: u16, stuffing: StuffingPolicy) -> Self {
        Self {
            packetizer: Packetizer::new(pid),
            core: CyclingCore {
                stuffing,
                bitrate: 0,
                section_count: 0,
                remain_in_cycle: 0,
                current_cycle: 1,
                cycle_end: None,
                sched_packets: 0,
                sched_sections: VecDeque::new(),
                other_sections: VecDeque::new(),
                current_packet: 0,
            },
        }
    }

    /// Returns the configured PID.
    pub fn pid(&self) -> u16 {
        self.packetizer.pid()
    }

    /// Number of packets produced so far, null packets included.
    pub fn packet_count(&self) -> u64 {
        self.packetizer.packet_count()
    }

    /// Number of sections currently stored.
    pub fn section_count(&self) -> usize {
        self.core.section_count
    }

    /// Current cycle number, starting at 1.
    pub fn cycle_number(&self) -> u64 {
        self.core.current_cycle
    }

    /// Returns the PID bitrate in bits per second (0 when unknown).
    pub fn bitrate(&self) -> u64 {
        self.core.bitrate
    }

    /// Sets the bitrate of the generated PID.
    ///
    /// Repetition rates are only enforceable when the bitrate is known.
    /// Lowering the bitrate to zero demotes all scheduled sections to the
    /// round-robin list; raising it from zero promotes them back; changing
    /// between two non-zero values recomputes every due packet.
    pub fn set_bitrate(&mut self, bitrate: u64) {
        let current = self.packetizer.packet_count();
        self.core.set_bitrate(bitrate, current);
    }

    /// Adds one section with an optional repetition rate in milliseconds
    /// (0 means no rate: round-robin insertion only).
    pub fn add_section(&mut self, section: Section, repetition_ms: u64) {
        let current = self.packetizer.packet_count();
        self.core.add_section(section, repetition_ms, current);
    }

    /// Adds several sections with the same repetition rate.
    pub fn add_sections(&mut self, sections: impl IntoIterator<Item = Section>, repetition_ms: u64) {
        for section in sections {
            self.add_section(section, repetition_ms);
        }
    }

    /// Removes all sections with the given table id.
    pub fn remove_sections(&mut self, tid: u8) {
        self.core.remove_matching(true, tid, None, None);
        self.core.remove_matching(false, tid, None, None);
    }

    /// Removes all sections with the given table id and extension.
    pub fn remove_sections_with_ext(&mut self, tid: u8, tid_ext: u16) {
        self.core.remove_matching(true, tid, Some(tid_ext), None);
        self.core.remove_matching(false, tid, Some(tid_ext), None);
    }

    /// Removes one specific section of a subtable.
    pub fn remove_section(&mut self, tid: u8, tid_ext: u16, section_number: u8) {
        self.core.remove_matching(true, tid, Some(tid_ext), Some(section_number));
        self.core.remove_matching(false, tid, Some(tid_ext), Some(section_number));
    }

    /// Removes every stored section.
    pub fn remove_all(&mut self) {
        self.core.remove_all();
    }

    /// Empties the packetizer and drops any partially emitted section.
    pub fn reset(&mut self) {
        self.core.remove_all();
        self.packetizer.reset();
    }

    /// Builds the next TS packet.
    ///
    /// Returns the packet and a flag which is true when the packet carries
    /// section data.
    pub fn next_packet(&mut self) -> (TsPacket, bool) {
        self.core.current_packet = self.packetizer.packet_count();
        self.packetizer.next_packet(&mut self.core)
    }

    /// Returns true when the last generated packet was the last packet of a
    /// complete cycle through all stored sections.
    pub fn at_cycle_boundary(&self) -> bool {
        // The cycle end marker records the provider counter of the closing
        // section; that section has fully left the packetizer when the output
        // count has moved one past it.
        self.packetizer.at_section_boundary()
            && self
                .core
                .cycle_end
                .is_some_and(|end| end + 1 == self.packetizer.section_out_count())
    }
}
